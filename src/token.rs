//! The SQL token model (spec component A).
//!
//! A [`SqlToken`] is a tagged variant; every variant only carries values a
//! caller cannot smuggle malicious SQL through. Tokens are immutable after
//! construction — there is no interior mutability anywhere in this module.
//!
//! The tagged-template ergonomics of the original library are replaced, per
//! the crate's design notes, by the [`sql!`] macro plus free constructor
//! functions for every non-`Raw` variant ([`identifier`], [`array`],
//! [`binary`], [`json`], [`jsonb`], [`join`], [`unnest`], [`literal_value`],
//! [`typed`]).

use crate::row::RowSchema;
use std::sync::Arc;

/// The sentinel prefix a [`RawToken`]'s `sql` uses for its *local*
/// placeholders, scoped to that token's own `values` list. The interpreter
/// (§4.B) rewrites every occurrence into either a nested expansion or a
/// fresh global `$k` placeholder.
pub const PLACEHOLDER_PREFIX: &str = "$slonik_";

/// A single value a query can bind: boolean, finite number, text, bytes,
/// null, or a nested array of the same. No objects, no functions, no
/// `NaN`/`±Infinity` — those are rejected before they ever reach a
/// [`ValueExpr`] (see the `IntoValueExpr` impls below).
#[derive(Debug, Clone, PartialEq)]
pub enum PrimitiveValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Array(Vec<PrimitiveValue>),
}

impl From<bool> for PrimitiveValue {
    fn from(v: bool) -> Self {
        PrimitiveValue::Bool(v)
    }
}
impl From<i16> for PrimitiveValue {
    fn from(v: i16) -> Self {
        PrimitiveValue::Int(v as i64)
    }
}
impl From<i32> for PrimitiveValue {
    fn from(v: i32) -> Self {
        PrimitiveValue::Int(v as i64)
    }
}
impl From<i64> for PrimitiveValue {
    fn from(v: i64) -> Self {
        PrimitiveValue::Int(v)
    }
}
impl From<String> for PrimitiveValue {
    fn from(v: String) -> Self {
        PrimitiveValue::Text(v)
    }
}
impl From<&str> for PrimitiveValue {
    fn from(v: &str) -> Self {
        PrimitiveValue::Text(v.to_string())
    }
}
impl From<Vec<u8>> for PrimitiveValue {
    fn from(v: Vec<u8>) -> Self {
        PrimitiveValue::Bytes(v)
    }
}
impl From<Vec<PrimitiveValue>> for PrimitiveValue {
    fn from(v: Vec<PrimitiveValue>) -> Self {
        PrimitiveValue::Array(v)
    }
}

/// Fallible conversion for floats: a non-finite `f64` (`NaN`, `+Inf`,
/// `-Inf`) cannot be represented as a bind parameter.
impl TryFrom<f64> for PrimitiveValue {
    type Error = String;

    fn try_from(v: f64) -> Result<Self, Self::Error> {
        if v.is_finite() {
            Ok(PrimitiveValue::Float(v))
        } else {
            Err(format!("non-finite number {v} cannot be bound as a value"))
        }
    }
}
impl TryFrom<f32> for PrimitiveValue {
    type Error = String;

    fn try_from(v: f32) -> Result<Self, Self::Error> {
        PrimitiveValue::try_from(v as f64)
    }
}

impl<T> From<Option<T>> for PrimitiveValue
where
    PrimitiveValue: From<T>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => PrimitiveValue::from(v),
            None => PrimitiveValue::Null,
        }
    }
}

/// A local value inside a [`RawToken`]: either a primitive leaf or a nested
/// token to be recursively interpreted (spec §4.B step 2).
#[derive(Debug, Clone)]
pub enum ValueExpr {
    /// A well-formed value, ready to bind.
    Value(PrimitiveValue),
    /// A nested token to splice in recursively.
    Token(SqlToken),
    /// A value that failed construction-time validation (e.g. a non-finite
    /// float). Carried through rather than panicking so the rejection can
    /// surface as an `InvalidInputError` at interpretation time, per spec §3.
    Invalid(String),
}

/// Converts a caller-supplied value into a [`ValueExpr`], performing the
/// construction-time validation the design notes call for (§9: "re-architect
/// as a tagged variant, with construction-time validation"). Implemented
/// concretely per accepted type — deliberately not a blanket impl, so that
/// the `SqlToken` and `PrimitiveValue` conversions below cannot collide with
/// it under Rust's coherence rules.
pub trait IntoValueExpr {
    fn into_value_expr(self) -> ValueExpr;
}

macro_rules! into_value_expr_infallible {
    ($($ty:ty),* $(,)?) => {
        $(
            impl IntoValueExpr for $ty {
                fn into_value_expr(self) -> ValueExpr {
                    ValueExpr::Value(PrimitiveValue::from(self))
                }
            }
        )*
    };
}

into_value_expr_infallible!(
    bool, i16, i32, i64, String, &str, Vec<u8>, Vec<PrimitiveValue>,
    Option<bool>, Option<i64>, Option<String>, Option<Vec<u8>>
);

impl IntoValueExpr for f64 {
    fn into_value_expr(self) -> ValueExpr {
        match PrimitiveValue::try_from(self) {
            Ok(v) => ValueExpr::Value(v),
            Err(reason) => ValueExpr::Invalid(reason),
        }
    }
}
impl IntoValueExpr for f32 {
    fn into_value_expr(self) -> ValueExpr {
        (self as f64).into_value_expr()
    }
}
impl IntoValueExpr for Option<f64> {
    fn into_value_expr(self) -> ValueExpr {
        match self {
            Some(v) => v.into_value_expr(),
            None => ValueExpr::Value(PrimitiveValue::Null),
        }
    }
}

impl IntoValueExpr for PrimitiveValue {
    fn into_value_expr(self) -> ValueExpr {
        ValueExpr::Value(self)
    }
}

impl IntoValueExpr for SqlToken {
    fn into_value_expr(self) -> ValueExpr {
        ValueExpr::Token(self)
    }
}

/// A `Raw` token: a literal SQL fragment with its local bind values and an
/// optional attached row schema (spec §3/§4.A).
#[derive(Clone)]
pub struct RawToken {
    pub sql: String,
    pub values: Vec<ValueExpr>,
    pub row_schema: Option<Arc<dyn RowSchema>>,
}

impl std::fmt::Debug for RawToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawToken")
            .field("sql", &self.sql)
            .field("values", &self.values)
            .field("row_schema", &self.row_schema.as_ref().map(|_| "<RowSchema>"))
            .finish()
    }
}

impl RawToken {
    pub fn new(sql: impl Into<String>, values: Vec<ValueExpr>) -> Self {
        Self {
            sql: sql.into(),
            values,
            row_schema: None,
        }
    }

    pub fn with_row_schema(mut self, schema: Arc<dyn RowSchema>) -> Self {
        self.row_schema = Some(schema);
        self
    }
}

/// `sql.identifier`'s type name argument, or `sql.unnest`'s per-column type:
/// either a bare Postgres type name or a raw fragment that renders it
/// (spec §3: `memberType: SqlToken|TypeName`, `columnTypes: (TypeName|Raw)[]`).
#[derive(Debug, Clone)]
pub enum TypeRef {
    Name(String),
    Fragment(RawToken),
}

impl From<&str> for TypeRef {
    fn from(v: &str) -> Self {
        TypeRef::Name(v.to_string())
    }
}
impl From<String> for TypeRef {
    fn from(v: String) -> Self {
        TypeRef::Name(v)
    }
}
impl From<RawToken> for TypeRef {
    fn from(v: RawToken) -> Self {
        TypeRef::Fragment(v)
    }
}

/// A single member of a `sql.join` list (spec §3: `members: (Raw|Primitive|Token)[]`).
#[derive(Debug, Clone)]
pub enum ListMember {
    Raw(RawToken),
    Primitive(PrimitiveValue),
    Token(SqlToken),
}

impl From<RawToken> for ListMember {
    fn from(v: RawToken) -> Self {
        ListMember::Raw(v)
    }
}
impl From<SqlToken> for ListMember {
    fn from(v: SqlToken) -> Self {
        match v {
            SqlToken::Raw(r) => ListMember::Raw(r),
            other => ListMember::Token(other),
        }
    }
}
impl From<PrimitiveValue> for ListMember {
    fn from(v: PrimitiveValue) -> Self {
        ListMember::Primitive(v)
    }
}

/// The SQL fragment tree (spec §3/§4.A).
#[derive(Debug, Clone)]
pub enum SqlToken {
    Raw(RawToken),
    Identifier(Vec<String>),
    Array {
        values: Vec<PrimitiveValue>,
        member_type: TypeRef,
    },
    Binary(Vec<u8>),
    Json(serde_json::Value),
    JsonBinary(serde_json::Value),
    List {
        members: Vec<ListMember>,
        glue: Box<RawToken>,
    },
    Unnest {
        tuples: Vec<Vec<PrimitiveValue>>,
        column_types: Vec<TypeRef>,
    },
}

/// Builds a `Raw` token's `sql` text from interleaved literal fragments and
/// values, assigning each value a local `$slonik_N` placeholder — the
/// internal convention described in spec §9. This is what the [`sql!`]
/// macro expands to; it is also usable directly, matching the design note's
/// "provide a builder object whose `sql(fragments, ...values)` function
/// accepts the fragment list and values explicitly."
pub fn raw_fragments(fragments: &[&str], values: Vec<ValueExpr>) -> SqlToken {
    if fragments.len() != values.len() + 1 {
        return SqlToken::Raw(RawToken::new(
            format!(
                "-- malformed sql! invocation: {} fragments for {} values",
                fragments.len(),
                values.len()
            ),
            Vec::new(),
        ));
    }

    let mut sql = String::new();
    for (i, fragment) in fragments.iter().enumerate() {
        sql.push_str(fragment);
        if i < values.len() {
            sql.push_str(PLACEHOLDER_PREFIX);
            sql.push_str(&(i + 1).to_string());
        }
    }

    SqlToken::Raw(RawToken::new(sql, values))
}

/// Splits a `format!`-style literal (using `{}` markers) into fragments and
/// builds the corresponding `Raw` token. This is the function the [`sql!`]
/// macro calls.
pub fn build_raw(fmt: &str, values: Vec<ValueExpr>) -> SqlToken {
    let fragments: Vec<&str> = fmt.split("{}").collect();
    raw_fragments(&fragments, values)
}

/// Builds a `Raw` token from a `format!`-style literal with `{}` markers for
/// each bind value, e.g. `sql!("SELECT * FROM t WHERE id = {}", id)`.
#[macro_export]
macro_rules! sql {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::token::build_raw($fmt, vec![$($crate::token::IntoValueExpr::into_value_expr($arg)),*])
    };
}

/// `sql.identifier(["a", "b"])` — renders `"a"."b"` with quote-doubling on
/// embedded `"` (spec §4.B).
pub fn identifier<I, S>(names: I) -> SqlToken
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    SqlToken::Identifier(names.into_iter().map(Into::into).collect())
}

/// `sql.array(values, memberType)` — a single bind parameter typed
/// `memberType[]`.
pub fn array(values: Vec<PrimitiveValue>, member_type: impl Into<TypeRef>) -> SqlToken {
    SqlToken::Array {
        values,
        member_type: member_type.into(),
    }
}

/// `sql.binary(data)` — a single bind parameter of `bytea`.
pub fn binary(data: Vec<u8>) -> SqlToken {
    SqlToken::Binary(data)
}

/// `sql.json(value)` — serialised with stable key ordering (`serde_json`'s
/// default map representation is a `BTreeMap`, so keys already come out
/// sorted without the `preserve_order` feature); bind parameter typed `json`.
pub fn json<T: serde::Serialize>(value: &T) -> Result<SqlToken, serde_json::Error> {
    Ok(SqlToken::Json(serde_json::to_value(value)?))
}

/// `sql.jsonb(value)` — same as [`json`] but typed `jsonb`.
pub fn jsonb<T: serde::Serialize>(value: &T) -> Result<SqlToken, serde_json::Error> {
    Ok(SqlToken::JsonBinary(serde_json::to_value(value)?))
}

/// `sql.join(members, glue)` — renders each member joined by `glue`'s SQL.
/// `glue` must be a zero-value `Raw` token (checked at interpretation time).
pub fn join<I, M>(members: I, glue: RawToken) -> SqlToken
where
    I: IntoIterator<Item = M>,
    M: Into<ListMember>,
{
    SqlToken::List {
        members: members.into_iter().map(Into::into).collect(),
        glue: Box::new(glue),
    }
}

/// `sql.unnest(tuples, columnTypes)` — renders
/// `unnest($1::T1[], …, $k::Tk[])`; each column becomes one bind parameter
/// (an array of that column's values across all tuples). Width mismatches
/// between a tuple and `column_types` are detected at interpretation time
/// (spec §4.B step 5), not here.
pub fn unnest<T>(tuples: Vec<Vec<PrimitiveValue>>, column_types: Vec<T>) -> SqlToken
where
    T: Into<TypeRef>,
{
    SqlToken::Unnest {
        tuples,
        column_types: column_types.into_iter().map(Into::into).collect(),
    }
}

/// `sql.literalValue(value)` — renders `value` as an inline SQL literal
/// rather than a bind parameter. Used for the rare positions (e.g. DDL
/// defaults) where a bind parameter isn't legal syntax.
pub fn literal_value(value: PrimitiveValue) -> SqlToken {
    SqlToken::Raw(RawToken::new(render_literal(&value), Vec::new()))
}

fn render_literal(value: &PrimitiveValue) -> String {
    match value {
        PrimitiveValue::Null => "NULL".to_string(),
        PrimitiveValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        PrimitiveValue::Int(i) => i.to_string(),
        PrimitiveValue::Float(f) => f.to_string(),
        PrimitiveValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
        PrimitiveValue::Bytes(b) => format!("'\\x{}'", hex_encode(b)),
        PrimitiveValue::Array(items) => {
            let rendered: Vec<String> = items.iter().map(render_literal).collect();
            format!("ARRAY[{}]", rendered.join(", "))
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// `sql.type(schema)` — a combinator attaching a [`RowSchema`] to the `Raw`
/// token produced by a subsequent `sql!`/`raw_fragments` call.
pub struct TypedBuilder {
    schema: Arc<dyn RowSchema>,
}

pub fn typed(schema: Arc<dyn RowSchema>) -> TypedBuilder {
    TypedBuilder { schema }
}

impl TypedBuilder {
    pub fn build(&self, fmt: &str, values: Vec<ValueExpr>) -> SqlToken {
        match build_raw(fmt, values) {
            SqlToken::Raw(raw) => SqlToken::Raw(raw.with_row_schema(self.schema.clone())),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_quotes_and_doubles_embedded_quotes() {
        let SqlToken::Identifier(names) = identifier(["a\"b"]) else {
            panic!("expected Identifier token");
        };
        assert_eq!(names, vec!["a\"b".to_string()]);
    }

    #[test]
    fn float_validation_rejects_non_finite() {
        let expr = f64::NAN.into_value_expr();
        assert!(matches!(expr, ValueExpr::Invalid(_)));

        let expr = f64::INFINITY.into_value_expr();
        assert!(matches!(expr, ValueExpr::Invalid(_)));

        let expr = 1.5f64.into_value_expr();
        assert!(matches!(expr, ValueExpr::Value(PrimitiveValue::Float(_))));
    }

    #[test]
    fn raw_fragments_assigns_contiguous_local_placeholders() {
        let token = raw_fragments(
            &["SELECT ", ", ", ""],
            vec![1i64.into_value_expr(), "a".into_value_expr()],
        );
        let SqlToken::Raw(raw) = token else {
            panic!("expected Raw token");
        };
        assert_eq!(raw.sql, "SELECT $slonik_1, $slonik_2");
        assert_eq!(raw.values.len(), 2);
    }

    #[test]
    fn sql_macro_builds_raw_token() {
        let token = sql!("SELECT {}, {}", 1i64, "a");
        let SqlToken::Raw(raw) = token else {
            panic!("expected Raw token");
        };
        assert_eq!(raw.sql, "SELECT $slonik_1, $slonik_2");
    }
}
