//! Row parser & type registry (spec component C).
//!
//! A [`TypeRegistry`] maps PostgreSQL types (by OID, via `tokio_postgres`'s
//! own `Type` catalogue — reusing the wire driver's own type table rather
//! than reinventing one) to a parser function. The built-in parsers mirror
//! the dispatch-by-type style of
//! `examples/other_examples/30ec1ce3_Electron100-butane__propane_core-src-db-pg.rs.rs`'s
//! `FromSql` impl for `SqlVal`, generalized to this crate's [`PrimitiveValue`]
//! and extended with array and interval/numeric decoding.

use crate::error::{QueryErrorContext, SlonikError};
use crate::token::PrimitiveValue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_postgres::types::{FromSql, Kind, Type};

/// A single parsed database row: an ordered list of `(column name, value)`
/// pairs. Order is preserved so the `*First` shape functions can enforce
/// "exactly one column" without a name lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, PrimitiveValue)>,
}

impl Row {
    pub fn new(columns: Vec<(String, PrimitiveValue)>) -> Self {
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&PrimitiveValue> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_index(&self, index: usize) -> Option<&PrimitiveValue> {
        self.columns.get(index).map(|(_, v)| v)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    pub fn columns(&self) -> &[(String, PrimitiveValue)] {
        &self.columns
    }

    pub fn into_columns(self) -> Vec<(String, PrimitiveValue)> {
        self.columns
    }
}

/// Pluggable row validation/transformation, installed per-`Raw` token via
/// `sql.type(schema)` (spec §4.A/§4.C). A failing parse raises
/// `SchemaValidationError` carrying the offending row and this report.
pub trait RowSchema: Send + Sync {
    fn parse(&self, row: &Row) -> Result<Row, String>;
}

/// A single registrable type parser: `{name, parse}` per spec §4.C.
pub type ParseFn = Arc<dyn Fn(&[u8]) -> Result<PrimitiveValue, String> + Send + Sync>;

#[derive(Clone)]
pub struct TypeParser {
    pub name: &'static str,
    pub parse: ParseFn,
}

impl std::fmt::Debug for TypeParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeParser").field("name", &self.name).finish()
    }
}

/// Maps types to parser functions. User-registered parsers (by type name)
/// take priority over the built-ins; this mirrors spec §4.C: "on connection
/// initialisation the registry is installed on the driver."
#[derive(Clone, Default)]
pub struct TypeRegistry {
    custom: HashMap<String, ParseFn>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, parser: TypeParser) {
        self.custom.insert(parser.name.to_string(), parser.parse);
    }

    /// Parses one column's raw wire bytes (`None` for SQL NULL) into a
    /// [`PrimitiveValue`].
    pub fn parse_column(&self, ty: &Type, raw: Option<&[u8]>) -> Result<PrimitiveValue, String> {
        let Some(bytes) = raw else {
            return Ok(PrimitiveValue::Null);
        };
        if let Some(parse) = self.custom.get(ty.name()) {
            return parse(bytes);
        }
        built_in_parse(ty, bytes)
    }
}

fn to_str<E: std::fmt::Display>(e: E) -> String {
    e.to_string()
}

fn built_in_parse(ty: &Type, raw: &[u8]) -> Result<PrimitiveValue, String> {
    if let Kind::Array(elem_ty) = ty.kind() {
        return parse_array(elem_ty, raw);
    }
    parse_scalar(ty, raw)
}

fn parse_scalar(ty: &Type, raw: &[u8]) -> Result<PrimitiveValue, String> {
    match *ty {
        Type::BOOL => bool::from_sql(ty, raw).map(PrimitiveValue::Bool).map_err(to_str),
        Type::INT2 => i16::from_sql(ty, raw)
            .map(|v| PrimitiveValue::Int(v as i64))
            .map_err(to_str),
        Type::INT4 => i32::from_sql(ty, raw)
            .map(|v| PrimitiveValue::Int(v as i64))
            .map_err(to_str),
        Type::INT8 => i64::from_sql(ty, raw).map(PrimitiveValue::Int).map_err(to_str),
        Type::FLOAT4 => f32::from_sql(ty, raw)
            .map(|v| PrimitiveValue::Float(v as f64))
            .map_err(to_str),
        Type::FLOAT8 => f64::from_sql(ty, raw).map(PrimitiveValue::Float).map_err(to_str),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            String::from_sql(ty, raw).map(PrimitiveValue::Text).map_err(to_str)
        }
        Type::BYTEA => Vec::<u8>::from_sql(ty, raw).map(PrimitiveValue::Bytes).map_err(to_str),
        Type::UUID => uuid::Uuid::from_sql(ty, raw)
            .map(|v| PrimitiveValue::Text(v.to_string()))
            .map_err(to_str),
        Type::NUMERIC => parse_numeric(raw).map(PrimitiveValue::Text),
        Type::TIMESTAMP => chrono::NaiveDateTime::from_sql(ty, raw)
            .map(|v| PrimitiveValue::Text(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
            .map_err(to_str),
        Type::TIMESTAMPTZ => chrono::DateTime::<chrono::Utc>::from_sql(ty, raw)
            .map(|v| PrimitiveValue::Text(v.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)))
            .map_err(to_str),
        Type::DATE => chrono::NaiveDate::from_sql(ty, raw)
            .map(|v| PrimitiveValue::Text(v.format("%Y-%m-%d").to_string()))
            .map_err(to_str),
        Type::INTERVAL => parse_interval(raw).map(PrimitiveValue::Text),
        Type::JSON | Type::JSONB => serde_json::Value::from_sql(ty, raw)
            .map(|v| PrimitiveValue::Text(v.to_string()))
            .map_err(to_str),
        _ => match std::str::from_utf8(raw) {
            Ok(text) => Ok(PrimitiveValue::Text(text.to_string())),
            Err(_) => Ok(PrimitiveValue::Bytes(raw.to_vec())),
        },
    }
}

/// Decodes the generic PostgreSQL binary array wire format, recursing into
/// [`parse_scalar`] per element so every scalar parser above also covers its
/// array form for free (spec §4.C: "and array variants").
fn parse_array(elem_ty: &Type, raw: &[u8]) -> Result<PrimitiveValue, String> {
    if raw.len() < 12 {
        return Err("array: truncated header".to_string());
    }
    let ndim = i32::from_be_bytes(raw[0..4].try_into().unwrap());
    let mut offset = 12usize;

    if ndim == 0 {
        return Ok(PrimitiveValue::Array(Vec::new()));
    }

    let mut dims = Vec::with_capacity(ndim as usize);
    for _ in 0..ndim {
        if offset + 8 > raw.len() {
            return Err("array: truncated dimension header".to_string());
        }
        let size = i32::from_be_bytes(raw[offset..offset + 4].try_into().unwrap());
        offset += 8; // dimension size + lower bound
        dims.push(size.max(0) as usize);
    }

    let total: usize = dims.iter().product();
    let mut flat = Vec::with_capacity(total);
    for _ in 0..total {
        if offset + 4 > raw.len() {
            return Err("array: truncated element length".to_string());
        }
        let len = i32::from_be_bytes(raw[offset..offset + 4].try_into().unwrap());
        offset += 4;
        if len < 0 {
            flat.push(PrimitiveValue::Null);
        } else {
            let len = len as usize;
            if offset + len > raw.len() {
                return Err("array: truncated element".to_string());
            }
            flat.push(parse_scalar(elem_ty, &raw[offset..offset + len])?);
            offset += len;
        }
    }

    Ok(nest_dims(&dims, &mut flat.into_iter()))
}

fn nest_dims(dims: &[usize], flat: &mut impl Iterator<Item = PrimitiveValue>) -> PrimitiveValue {
    match dims {
        [] => flat.next().unwrap_or(PrimitiveValue::Null),
        [only] => PrimitiveValue::Array((0..*only).map(|_| flat.next().unwrap_or(PrimitiveValue::Null)).collect()),
        [first, rest @ ..] => PrimitiveValue::Array((0..*first).map(|_| nest_dims(rest, flat)).collect()),
    }
}

/// Decodes PostgreSQL's binary `numeric` format into a decimal string,
/// preserving precision exactly rather than lossily widening to `f64`.
fn parse_numeric(raw: &[u8]) -> Result<String, String> {
    if raw.len() < 8 {
        return Err("numeric: truncated header".to_string());
    }
    let ndigits = i16::from_be_bytes([raw[0], raw[1]]) as i32;
    let weight = i16::from_be_bytes([raw[2], raw[3]]) as i32;
    let sign = u16::from_be_bytes([raw[4], raw[5]]);
    let dscale = i16::from_be_bytes([raw[6], raw[7]]).max(0) as usize;

    if sign == 0xC000 {
        return Ok("NaN".to_string());
    }
    if sign != 0x0000 && sign != 0x4000 {
        return Err(format!("numeric: unsupported sign marker {sign:#x}"));
    }

    let mut digits = Vec::with_capacity(ndigits.max(0) as usize);
    let mut offset = 8usize;
    for _ in 0..ndigits {
        if offset + 2 > raw.len() {
            return Err("numeric: truncated digit".to_string());
        }
        digits.push(i16::from_be_bytes([raw[offset], raw[offset + 1]]) as i32);
        offset += 2;
    }

    let mut int_part = String::new();
    let mut frac_part = String::new();
    for (i, digit) in digits.iter().enumerate() {
        let exp = weight - i as i32;
        if exp >= 0 {
            if int_part.is_empty() {
                int_part.push_str(&digit.to_string());
            } else {
                int_part.push_str(&format!("{:04}", digit));
            }
        } else {
            frac_part.push_str(&format!("{:04}", digit));
        }
    }
    if int_part.is_empty() {
        int_part.push('0');
    }
    while frac_part.len() < dscale {
        frac_part.push('0');
    }
    frac_part.truncate(dscale);

    let sign_str = if sign == 0x4000 { "-" } else { "" };
    if dscale > 0 {
        Ok(format!("{sign_str}{int_part}.{frac_part}"))
    } else {
        Ok(format!("{sign_str}{int_part}"))
    }
}

/// Decodes PostgreSQL's binary `interval` format (microseconds, days,
/// months) into an ISO-8601 duration string, per spec §4.C.
fn parse_interval(raw: &[u8]) -> Result<String, String> {
    if raw.len() != 16 {
        return Err("interval: unexpected length".to_string());
    }
    let micros = i64::from_be_bytes(raw[0..8].try_into().unwrap());
    let days = i32::from_be_bytes(raw[8..12].try_into().unwrap());
    let months = i32::from_be_bytes(raw[12..16].try_into().unwrap());

    let years = months / 12;
    let rem_months = months % 12;

    let mut secs_total = micros / 1_000_000;
    let micros_rem = (micros % 1_000_000).abs();
    let hours = secs_total / 3600;
    secs_total %= 3600;
    let minutes = secs_total / 60;
    let seconds = secs_total % 60;

    let mut out = String::from("P");
    if years != 0 {
        out.push_str(&format!("{years}Y"));
    }
    if rem_months != 0 {
        out.push_str(&format!("{rem_months}M"));
    }
    if days != 0 {
        out.push_str(&format!("{days}D"));
    }

    let has_time = hours != 0 || minutes != 0 || seconds != 0 || micros_rem != 0;
    if has_time {
        out.push('T');
        if hours != 0 {
            out.push_str(&format!("{hours}H"));
        }
        if minutes != 0 {
            out.push_str(&format!("{minutes}M"));
        }
        if seconds != 0 || micros_rem != 0 {
            if micros_rem != 0 {
                out.push_str(&format!("{seconds}.{micros_rem:06}S"));
            } else {
                out.push_str(&format!("{seconds}S"));
            }
        }
    }
    if out == "P" {
        out.push_str("T0S");
    }
    Ok(out)
}

/// One column of a driver-reported row, in the form the [`TypeRegistry`]
/// consumes: a name, the wire `Type`, and the raw bytes (`None` for NULL).
/// Deliberately plain data — a mock [`crate::driver::Driver`] can construct
/// this without a live server, which is what makes the row parser testable
/// in isolation from the wire driver (out of scope per the crate's purpose).
#[derive(Debug, Clone)]
pub struct RawColumnData {
    pub name: String,
    pub ty: Type,
    pub bytes: Option<Vec<u8>>,
}

/// A full driver-reported row before column parsing (spec §4.C step 1 input).
#[derive(Debug, Clone, Default)]
pub struct RawRow {
    pub columns: Vec<RawColumnData>,
}

/// Converts a [`RawRow`] into this crate's [`Row`], applying the
/// [`TypeRegistry`] column by column (spec §4.C step 1).
pub fn row_from_raw(registry: &TypeRegistry, raw_row: &RawRow) -> Result<Row, SlonikError> {
    let mut columns = Vec::with_capacity(raw_row.columns.len());
    for col in &raw_row.columns {
        let value = registry
            .parse_column(&col.ty, col.bytes.as_deref())
            .map_err(|e| SlonikError::UnexpectedState {
                message: format!("failed to parse column '{}': {e}", col.name),
            })?;
        columns.push((col.name.clone(), value));
    }
    Ok(Row::new(columns))
}

/// Applies a [`RowSchema`] to a parsed row (spec §4.C step 3), mapping a
/// failing parse to `SchemaValidationError`.
pub fn apply_row_schema(
    schema: &Arc<dyn RowSchema>,
    row: Row,
    ctx: &QueryErrorContext,
) -> Result<Row, SlonikError> {
    schema.parse(&row).map_err(|message| SlonikError::SchemaValidation {
        message,
        ctx: ctx.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_roundtrips_simple_decimal() {
        // 123.45 encoded as PostgreSQL binary numeric: ndigits=2, weight=0,
        // sign=0, dscale=2, digits=[123, 4500]
        let raw: Vec<u8> = [2i16, 0, 0, 2]
            .iter()
            .flat_map(|v| v.to_be_bytes())
            .chain([123i16, 4500].iter().flat_map(|v| v.to_be_bytes()))
            .collect();
        assert_eq!(parse_numeric(&raw).unwrap(), "123.4500");
    }

    #[test]
    fn interval_renders_iso8601_duration() {
        // 1 day, 3661 seconds (1h1m1s), 0 months
        let raw: Vec<u8> = 3_661_000_000i64
            .to_be_bytes()
            .iter()
            .chain(1i32.to_be_bytes().iter())
            .chain(0i32.to_be_bytes().iter())
            .copied()
            .collect();
        assert_eq!(parse_interval(&raw).unwrap(), "P1DT1H1M1S");
    }

    #[test]
    fn array_nests_by_dimension() {
        // a 1-d int4 array [1, 2, 3]: ndim=1, hasnull=0, elem_oid=INT4,
        // dim=3, lower_bound=1, then 3 elements of length 4 each.
        let mut raw = Vec::new();
        raw.extend(1i32.to_be_bytes());
        raw.extend(0i32.to_be_bytes());
        raw.extend((Type::INT4.oid() as i32).to_be_bytes());
        raw.extend(3i32.to_be_bytes());
        raw.extend(1i32.to_be_bytes());
        for v in [1i32, 2, 3] {
            raw.extend(4i32.to_be_bytes());
            raw.extend(v.to_be_bytes());
        }
        let value = parse_array(&Type::INT4, &raw).unwrap();
        assert_eq!(
            value,
            PrimitiveValue::Array(vec![
                PrimitiveValue::Int(1),
                PrimitiveValue::Int(2),
                PrimitiveValue::Int(3),
            ])
        );
    }
}
