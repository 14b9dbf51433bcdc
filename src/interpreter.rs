//! The SQL interpreter (spec component B): flattens a [`SqlToken`] tree into
//! a single statement with a flat, contiguously renumbered value list.
//!
//! A single recursive-descent pass over the tree, accumulating into one
//! global counter and value list — the design notes call for exactly this
//! ("a single linear pass with a global counter suffices"); there is no
//! intermediate representation between the token tree and the rendered SQL.

use crate::error::{QueryErrorContext, SlonikError};
use crate::row::RowSchema;
use crate::token::{ListMember, PrimitiveValue, RawToken, SqlToken, TypeRef, ValueExpr, PLACEHOLDER_PREFIX};
use std::sync::Arc;

/// The flattened result of interpreting a token tree: a single statement
/// ready to send to the driver, plus (if the root was a `Raw` token carrying
/// one) the row schema to apply once rows come back.
#[derive(Debug, Clone)]
pub struct Query {
    pub sql: String,
    pub values: Vec<PrimitiveValue>,
    pub row_schema: Option<Arc<dyn RowSchema>>,
}

/// Interprets a root token (always `Raw` for user-level queries, per §4.B).
pub fn interpret(root: &SqlToken) -> Result<Query, SlonikError> {
    let row_schema = match root {
        SqlToken::Raw(raw) => raw.row_schema.clone(),
        _ => None,
    };
    let mut interp = Interpreter::default();
    let sql = interp.render(root)?;
    Ok(Query {
        sql,
        values: interp.values,
        row_schema,
    })
}

#[derive(Default)]
struct Interpreter {
    values: Vec<PrimitiveValue>,
}

fn invalid(message: impl Into<String>) -> SlonikError {
    SlonikError::InvalidInput {
        message: message.into(),
        ctx: QueryErrorContext::default(),
    }
}

impl Interpreter {
    /// Appends a primitive leaf to the global value list, returning its
    /// freshly assigned `$k` placeholder (§4.B step 3).
    fn push_value(&mut self, value: PrimitiveValue) -> String {
        self.values.push(value);
        format!("${}", self.values.len())
    }

    fn render(&mut self, token: &SqlToken) -> Result<String, SlonikError> {
        match token {
            SqlToken::Raw(raw) => self.render_raw(raw),
            SqlToken::Identifier(names) => Ok(render_identifier(names)),
            SqlToken::Array { values, member_type } => {
                let placeholder = self.push_value(PrimitiveValue::Array(values.clone()));
                let type_name = self.render_type_ref(member_type)?;
                Ok(format!("{placeholder}::{type_name}[]"))
            }
            SqlToken::Binary(data) => {
                let placeholder = self.push_value(PrimitiveValue::Bytes(data.clone()));
                Ok(format!("{placeholder}::bytea"))
            }
            SqlToken::Json(value) => {
                let text = render_json(value)?;
                let placeholder = self.push_value(PrimitiveValue::Text(text));
                Ok(format!("{placeholder}::json"))
            }
            SqlToken::JsonBinary(value) => {
                let text = render_json(value)?;
                let placeholder = self.push_value(PrimitiveValue::Text(text));
                Ok(format!("{placeholder}::jsonb"))
            }
            SqlToken::List { members, glue } => self.render_list(members, glue),
            SqlToken::Unnest { tuples, column_types } => self.render_unnest(tuples, column_types),
        }
    }

    /// Scans a `Raw` token's `sql` for its local `$slonik_N` placeholders and
    /// replaces each with either a recursive token expansion or a fresh
    /// global placeholder (§4.B steps 1–3). Scanning left-to-right and
    /// matching the full run of digits after the prefix (rather than
    /// string-replacing placeholder text naively) avoids `$slonik_1`
    /// spuriously matching inside `$slonik_10`.
    fn render_raw(&mut self, raw: &RawToken) -> Result<String, SlonikError> {
        let sql = raw.sql.as_str();
        let mut out = String::with_capacity(sql.len());
        let mut i = 0;
        while i < sql.len() {
            if sql[i..].starts_with(PLACEHOLDER_PREFIX) {
                let rest = &sql[i + PLACEHOLDER_PREFIX.len()..];
                let digit_len = rest.bytes().take_while(u8::is_ascii_digit).count();
                if digit_len > 0 {
                    let n: usize = rest[..digit_len].parse().expect("scanned ascii digits");
                    if n == 0 || n > raw.values.len() {
                        return Err(invalid(format!(
                            "placeholder {PLACEHOLDER_PREFIX}{n} is out of range for this token's {} local value(s)",
                            raw.values.len()
                        )));
                    }
                    out.push_str(&self.render_value_expr(&raw.values[n - 1])?);
                    i += PLACEHOLDER_PREFIX.len() + digit_len;
                    continue;
                }
            }
            let ch = sql[i..].chars().next().expect("i < sql.len()");
            out.push(ch);
            i += ch.len_utf8();
        }
        Ok(out)
    }

    fn render_value_expr(&mut self, expr: &ValueExpr) -> Result<String, SlonikError> {
        match expr {
            ValueExpr::Value(v) => Ok(self.push_value(v.clone())),
            ValueExpr::Token(t) => self.render(t),
            ValueExpr::Invalid(reason) => Err(invalid(reason.clone())),
        }
    }

    fn render_type_ref(&mut self, type_ref: &TypeRef) -> Result<String, SlonikError> {
        match type_ref {
            TypeRef::Name(name) => Ok(name.clone()),
            TypeRef::Fragment(raw) => self.render_raw(raw),
        }
    }

    /// `sql.join` (§4.B step 4, `List`): glue must itself be a zero-value
    /// `Raw` token, checked here rather than at construction time since
    /// that's the first point the interpreter actually touches it.
    fn render_list(&mut self, members: &[ListMember], glue: &RawToken) -> Result<String, SlonikError> {
        if !glue.values.is_empty() {
            return Err(invalid("sql.join glue must be a Raw token with zero values"));
        }
        let glue_sql = self.render_raw(glue)?;

        let mut rendered = Vec::with_capacity(members.len());
        for member in members {
            let piece = match member {
                ListMember::Raw(raw) => self.render_raw(raw)?,
                ListMember::Token(token) => self.render(token)?,
                ListMember::Primitive(value) => self.push_value(value.clone()),
            };
            rendered.push(piece);
        }
        Ok(rendered.join(&glue_sql))
    }

    /// `sql.unnest` (§4.B step 4): validates every tuple's width against
    /// `column_types`, transposes tuples into per-column arrays, and emits
    /// one bind parameter per column.
    fn render_unnest(&mut self, tuples: &[Vec<PrimitiveValue>], column_types: &[TypeRef]) -> Result<String, SlonikError> {
        let width = column_types.len();
        for (i, tuple) in tuples.iter().enumerate() {
            if tuple.len() != width {
                return Err(invalid(format!(
                    "unnest tuple {i} has width {} but column_types has width {width}",
                    tuple.len()
                )));
            }
        }

        let mut placeholders = Vec::with_capacity(width);
        for col in 0..width {
            let column_values: Vec<PrimitiveValue> = tuples.iter().map(|tuple| tuple[col].clone()).collect();
            let placeholder = self.push_value(PrimitiveValue::Array(column_values));
            let type_name = self.render_type_ref(&column_types[col])?;
            placeholders.push(format!("{placeholder}::{type_name}[]"));
        }
        Ok(format!("unnest({})", placeholders.join(", ")))
    }
}

/// `Identifier` rendering (§4.B step 4): each name wrapped in `"…"` with
/// internal `"` doubled, names joined by `.`. Idempotent only in the sense
/// that re-feeding the rendered form doubles quotes again — there is no
/// magic inverse (spec §8 invariant 3).
fn render_identifier(names: &[String]) -> String {
    names
        .iter()
        .map(|name| format!("\"{}\"", name.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

fn render_json(value: &serde_json::Value) -> Result<String, SlonikError> {
    serde_json::to_string(value).map_err(|e| invalid(format!("failed to serialise JSON value: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql;
    use crate::token::{identifier, join, unnest};

    fn as_raw(token: SqlToken) -> RawToken {
        match token {
            SqlToken::Raw(raw) => raw,
            _ => panic!("expected Raw token"),
        }
    }

    #[test]
    fn s1_mixed_literal_value_and_identifier() {
        let root = sql!("SELECT {}, {}, {}", 1i64, "a", identifier(["u", "id"]));
        let query = interpret(&root).unwrap();
        assert_eq!(query.sql, "SELECT $1, $2, \"u\".\"id\"");
        assert_eq!(query.values, vec![PrimitiveValue::Int(1), PrimitiveValue::Text("a".into())]);
    }

    #[test]
    fn s2_join_with_glue() {
        let glue = as_raw(sql!(" AND "));
        let members = vec![sql!("a={}", 1i64), sql!("b={}", 2i64)];
        let root = sql!("{}", join(members, glue));
        let query = interpret(&root).unwrap();
        assert_eq!(query.sql, "a=$1 AND b=$2");
        assert_eq!(query.values, vec![PrimitiveValue::Int(1), PrimitiveValue::Int(2)]);
    }

    #[test]
    fn s3_unnest_transposes_columns() {
        let tuples = vec![
            vec![PrimitiveValue::Int(1), PrimitiveValue::Text("x".into())],
            vec![PrimitiveValue::Int(2), PrimitiveValue::Text("y".into())],
        ];
        let root = sql!("SELECT * FROM {}", unnest(tuples, vec!["int4", "text"]));
        let query = interpret(&root).unwrap();
        assert_eq!(query.sql, "SELECT * FROM unnest($1::int4[], $2::text[])");
        assert_eq!(
            query.values,
            vec![
                PrimitiveValue::Array(vec![PrimitiveValue::Int(1), PrimitiveValue::Int(2)]),
                PrimitiveValue::Array(vec![PrimitiveValue::Text("x".into()), PrimitiveValue::Text("y".into())]),
            ]
        );
    }

    #[test]
    fn unnest_rejects_width_mismatch() {
        let tuples = vec![vec![PrimitiveValue::Int(1)]];
        let root = sql!("SELECT * FROM {}", unnest(tuples, vec!["int4", "text"]));
        assert!(interpret(&root).is_err());
    }

    #[test]
    fn placeholder_numbering_survives_ten_or_more_values() {
        let root = sql!(
            "{}{}{}{}{}{}{}{}{}{}{}",
            1i64, 2i64, 3i64, 4i64, 5i64, 6i64, 7i64, 8i64, 9i64, 10i64, 11i64
        );
        let query = interpret(&root).unwrap();
        assert_eq!(query.sql, "$1$2$3$4$5$6$7$8$9$10$11");
        assert_eq!(query.values.len(), 11);
    }

    #[test]
    fn join_rejects_nonempty_glue_values() {
        let bad_glue = as_raw(sql!("{}", 1i64));
        let members = vec![sql!("a")];
        let root = sql!("{}", join(members, bad_glue));
        assert!(interpret(&root).is_err());
    }
}
