//! Query parameter decoding and binding
//!
//! Callers send every parameter as a string. Each one is decoded on its own:
//!
//! 1. JSON, if it parses (`5`, `"hello"`, `true`, `{"a":1}`, `null`)
//! 2. base64 bytes, if it is base64-alphabet only and longer than 20 chars
//! 3. otherwise the raw text, unchanged
//!
//! This is a heuristic, not a type contract: a long unquoted token made of
//! base64 characters is always treated as bytes.
//!
//! Decoded values are then encoded as the type the server inferred for each
//! placeholder (`WHERE id = $1` against a uuid column takes a uuid), so text
//! works wherever the server would accept an untyped literal.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgTypeInfo};
use sqlx::query::Query;
use sqlx::types::{Json, Uuid};
use sqlx::{Postgres, TypeInfo};

use crate::error::{DbError, DbResult};

/// Shortest string length (exclusive) considered for base64 decoding
pub const BASE64_MIN_LEN: usize = 20;

/// SQLSTATE the server reports for unparsable literals
pub const INVALID_TEXT_REPRESENTATION: &str = "22P02";

static BASE64_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9+/]+=*$").expect("invalid base64 regex"));

/// Accepts padded and unpadded input alike.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// A decoded parameter, ready to bind
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Json(Value),
    Bytes(Vec<u8>),
    Text(String),
}

impl QueryParam {
    /// Short description for logs; never includes the value itself.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Json(Value::Null) => "null",
            Self::Json(Value::Bool(_)) => "bool",
            Self::Json(Value::Number(_)) => "number",
            Self::Json(Value::String(_)) => "string",
            Self::Json(Value::Array(_)) => "array",
            Self::Json(Value::Object(_)) => "object",
            Self::Bytes(_) => "bytes",
            Self::Text(_) => "text",
        }
    }

    /// Encoding when the server did not report a type for the placeholder.
    pub fn into_declared(self) -> TypedValue {
        match self {
            Self::Json(Value::Null) => TypedValue::Null,
            Self::Json(Value::Bool(b)) => TypedValue::Bool(b),
            Self::Json(Value::Number(n)) => match n.as_i64() {
                Some(i) => TypedValue::Int8(i),
                None => TypedValue::Float8(n.as_f64().unwrap_or(f64::NAN)),
            },
            Self::Json(Value::String(s)) => TypedValue::Text(s),
            Self::Json(nested) => TypedValue::Json(nested),
            Self::Bytes(bytes) => TypedValue::Bytes(bytes),
            Self::Text(text) => TypedValue::Text(text),
        }
    }

    /// Encode as the type the server inferred for this placeholder.
    ///
    /// Text that does not parse as that type fails the way the server
    /// would: a `Query` error with SQLSTATE `22P02`.
    pub fn encode_as(self, ty: &PgTypeInfo) -> DbResult<TypedValue> {
        let target = Target::of(ty);
        match self {
            Self::Json(Value::Null) => Ok(TypedValue::Null),
            Self::Bytes(bytes) => Ok(TypedValue::Bytes(bytes)),
            Self::Json(value) if target == Target::Json => Ok(TypedValue::Json(value)),
            Self::Json(Value::Array(items)) if target.is_array() => {
                let raw = Value::Array(items.clone()).to_string();
                let elements = items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(s) => Some(s),
                        Value::Null => None,
                        other => Some(other.to_string()),
                    })
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| invalid(ty, &raw))?;
                encode_array(target, ty, &raw, &elements)
            }
            Self::Json(Value::String(text)) | Self::Text(text) => encode_text(target, ty, text),
            Self::Json(other) => encode_text(target, ty, other.to_string()),
        }
    }
}

/// A parameter in its wire type
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Numeric(Decimal),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    Timestamptz(DateTime<Utc>),
    Json(Value),
    Bytes(Vec<u8>),
    Text(String),
    Int4Array(Vec<i32>),
    Int8Array(Vec<i64>),
    Float8Array(Vec<f64>),
    TextArray(Vec<String>),
    UuidArray(Vec<Uuid>),
}

impl TypedValue {
    /// Attach this value to a query as the next positional argument.
    pub fn bind<'q>(
        self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        match self {
            Self::Null => query.bind(None::<String>),
            Self::Bool(v) => query.bind(v),
            Self::Int2(v) => query.bind(v),
            Self::Int4(v) => query.bind(v),
            Self::Int8(v) => query.bind(v),
            Self::Float4(v) => query.bind(v),
            Self::Float8(v) => query.bind(v),
            Self::Numeric(v) => query.bind(v),
            Self::Uuid(v) => query.bind(v),
            Self::Date(v) => query.bind(v),
            Self::Time(v) => query.bind(v),
            Self::Timestamp(v) => query.bind(v),
            Self::Timestamptz(v) => query.bind(v),
            Self::Json(v) => query.bind(Json(v)),
            Self::Bytes(v) => query.bind(v),
            Self::Text(v) => query.bind(v),
            Self::Int4Array(v) => query.bind(v),
            Self::Int8Array(v) => query.bind(v),
            Self::Float8Array(v) => query.bind(v),
            Self::TextArray(v) => query.bind(v),
            Self::UuidArray(v) => query.bind(v),
        }
    }
}

/// Bind every parameter in order. `types` are the server-inferred
/// placeholder types; a parameter without one keeps its declared encoding.
pub fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: Vec<QueryParam>,
    types: &[PgTypeInfo],
) -> DbResult<Query<'q, Postgres, PgArguments>> {
    for (index, param) in params.into_iter().enumerate() {
        let value = match types.get(index) {
            Some(ty) => param.encode_as(ty)?,
            None => param.into_declared(),
        };
        query = value.bind(query);
    }
    Ok(query)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Uuid,
    Date,
    Time,
    Timestamp,
    Timestamptz,
    Json,
    Bytea,
    Int4Array,
    Int8Array,
    Float8Array,
    TextArray,
    UuidArray,
    Text,
}

impl Target {
    fn of(ty: &PgTypeInfo) -> Self {
        match ty.name() {
            "BOOL" => Self::Bool,
            "INT2" => Self::Int2,
            "INT4" => Self::Int4,
            "INT8" => Self::Int8,
            "FLOAT4" => Self::Float4,
            "FLOAT8" => Self::Float8,
            "NUMERIC" => Self::Numeric,
            "UUID" => Self::Uuid,
            "DATE" => Self::Date,
            "TIME" => Self::Time,
            "TIMESTAMP" => Self::Timestamp,
            "TIMESTAMPTZ" => Self::Timestamptz,
            "JSON" | "JSONB" => Self::Json,
            "BYTEA" => Self::Bytea,
            "INT4[]" => Self::Int4Array,
            "INT8[]" => Self::Int8Array,
            "FLOAT8[]" => Self::Float8Array,
            "TEXT[]" | "VARCHAR[]" => Self::TextArray,
            "UUID[]" => Self::UuidArray,
            // text, varchar, name, unknown, enums
            _ => Self::Text,
        }
    }

    fn is_array(self) -> bool {
        matches!(
            self,
            Self::Int4Array | Self::Int8Array | Self::Float8Array | Self::TextArray | Self::UuidArray
        )
    }
}

fn invalid(ty: &PgTypeInfo, text: &str) -> DbError {
    DbError::Query {
        message: format!(
            "invalid input syntax for type {}: \"{text}\"",
            ty.name().to_lowercase()
        ),
        code: Some(INVALID_TEXT_REPRESENTATION.to_owned()),
    }
}

fn encode_text(target: Target, ty: &PgTypeInfo, text: String) -> DbResult<TypedValue> {
    let value = match target {
        Target::Text => return Ok(TypedValue::Text(text)),
        Target::Bytea => return Ok(TypedValue::Bytes(text.into_bytes())),
        Target::Bool => parse_bool(&text).map(TypedValue::Bool),
        Target::Int2 => text.trim().parse().ok().map(TypedValue::Int2),
        Target::Int4 => text.trim().parse().ok().map(TypedValue::Int4),
        Target::Int8 => text.trim().parse().ok().map(TypedValue::Int8),
        Target::Float4 => text.trim().parse().ok().map(TypedValue::Float4),
        Target::Float8 => text.trim().parse().ok().map(TypedValue::Float8),
        Target::Numeric => parse_numeric(&text).map(TypedValue::Numeric),
        Target::Uuid => Uuid::parse_str(text.trim()).ok().map(TypedValue::Uuid),
        Target::Date => parse_date(&text).map(TypedValue::Date),
        Target::Time => parse_time(&text).map(TypedValue::Time),
        Target::Timestamp => parse_timestamp(&text).map(TypedValue::Timestamp),
        Target::Timestamptz => parse_timestamptz(&text).map(TypedValue::Timestamptz),
        Target::Json => serde_json::from_str(&text).ok().map(TypedValue::Json),
        Target::Int4Array
        | Target::Int8Array
        | Target::Float8Array
        | Target::TextArray
        | Target::UuidArray => {
            let elements = parse_array_literal(&text).ok_or_else(|| invalid(ty, &text))?;
            return encode_array(target, ty, &text, &elements);
        }
    };
    value.ok_or_else(|| invalid(ty, &text))
}

fn encode_array(target: Target, ty: &PgTypeInfo, raw: &str, elements: &[String]) -> DbResult<TypedValue> {
    fn each<T>(elements: &[String], parse: impl Fn(&str) -> Option<T>) -> Option<Vec<T>> {
        elements.iter().map(|e| parse(e.trim())).collect()
    }

    let value = match target {
        Target::Int4Array => each(elements, |e| e.parse().ok()).map(TypedValue::Int4Array),
        Target::Int8Array => each(elements, |e| e.parse().ok()).map(TypedValue::Int8Array),
        Target::Float8Array => each(elements, |e| e.parse().ok()).map(TypedValue::Float8Array),
        Target::UuidArray => each(elements, |e| Uuid::parse_str(e).ok()).map(TypedValue::UuidArray),
        _ => Some(TypedValue::TextArray(elements.to_vec())),
    };
    value.ok_or_else(|| invalid(ty, raw))
}

/// `{a,b,"c d"}` into its elements. Nested arrays and NULL are not supported.
fn parse_array_literal(text: &str) -> Option<Vec<String>> {
    let inner = text.trim().strip_prefix('{')?.strip_suffix('}')?;
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }
    inner
        .split(',')
        .map(|element| {
            let element = element.trim();
            if element.eq_ignore_ascii_case("null") || element.starts_with('{') {
                return None;
            }
            let unquoted = element
                .strip_prefix('"')
                .and_then(|e| e.strip_suffix('"'))
                .unwrap_or(element);
            Some(unquoted.to_owned())
        })
        .collect()
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "t" | "true" | "y" | "yes" | "on" | "1" => Some(true),
        "f" | "false" | "n" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_numeric(text: &str) -> Option<Decimal> {
    let text = text.trim();
    Decimal::from_str_exact(text)
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").ok()
}

fn parse_time(text: &str) -> Option<NaiveTime> {
    ["%H:%M:%S%.f", "%H:%M"]
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(text.trim(), format).ok())
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ]
    .iter()
    .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
    .or_else(|| parse_date(text).and_then(|date| date.and_hms_opt(0, 0, 0)))
}

/// Offset-less input is read as UTC.
fn parse_timestamptz(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    DateTime::parse_from_rfc3339(text)
        .ok()
        .or_else(|| {
            ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"]
                .iter()
                .find_map(|format| DateTime::parse_from_str(text, format).ok())
        })
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| parse_timestamp(text).map(|naive| naive.and_utc()))
}

/// Decode one raw parameter.
///
/// # Example
/// ```
/// use pgrelay_core::params::{decode, QueryParam};
/// use serde_json::json;
///
/// assert_eq!(decode("5"), QueryParam::Json(json!(5)));
/// assert_eq!(decode("\"hello\""), QueryParam::Json(json!("hello")));
/// assert_eq!(decode("plain words"), QueryParam::Text("plain words".into()));
/// ```
pub fn decode(raw: &str) -> QueryParam {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return QueryParam::Json(value);
    }

    if raw.len() > BASE64_MIN_LEN && BASE64_RE.is_match(raw) {
        match LENIENT_BASE64.decode(raw) {
            Ok(bytes) => return QueryParam::Bytes(bytes),
            Err(e) => {
                tracing::debug!(error = %e, "base64-looking parameter did not decode, binding as text");
            }
        }
    }

    QueryParam::Text(raw.to_owned())
}

/// Decode every parameter, preserving order.
pub fn decode_params<S: AsRef<str>>(raw: &[S]) -> Vec<QueryParam> {
    raw.iter().map(|p| decode(p.as_ref())).collect()
}

/// Comma-separated kinds for logging; byte parameters show their length.
pub fn summary(params: &[QueryParam]) -> String {
    params
        .iter()
        .map(|p| match p {
            QueryParam::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
            other => other.kind().to_owned(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mixed_parameters_decode_by_tier() {
        let blob = "SGVsbG8gV29ybGQhIFRoaXMgaXMgYSB0ZXN0Lg==";
        assert_eq!(blob.len(), 40);

        let decoded = decode_params(&["5", "\"hello\"", blob]);

        assert_eq!(
            decoded,
            vec![
                QueryParam::Json(json!(5)),
                QueryParam::Json(json!("hello")),
                QueryParam::Bytes(b"Hello World! This is a test.".to_vec()),
            ]
        );
    }

    #[test]
    fn structured_values_stay_structured() {
        assert_eq!(decode("true"), QueryParam::Json(json!(true)));
        assert_eq!(decode("null"), QueryParam::Json(Value::Null));
        assert_eq!(decode("1.5"), QueryParam::Json(json!(1.5)));
        assert_eq!(decode(r#"{"id":1}"#), QueryParam::Json(json!({"id": 1})));
        assert_eq!(decode("[1,2]"), QueryParam::Json(json!([1, 2])));
    }

    #[test]
    fn short_base64_alphabet_is_text() {
        // exactly 20 characters is not enough
        assert_eq!(decode("abcdefghijABCDEFGHIJ"), QueryParam::Text("abcdefghijABCDEFGHIJ".into()));
        assert_eq!(decode("hello"), QueryParam::Text("hello".into()));
    }

    #[test]
    fn long_non_base64_is_text() {
        let raw = "2024-01-01 10:00:00+00 and more";
        assert_eq!(decode(raw), QueryParam::Text(raw.into()));
    }

    #[test]
    fn unpadded_base64_is_accepted() {
        let raw = "SGVsbG8gV29ybGQhIFRoaXMgaXMgYSB0ZXN0Lg";
        assert_eq!(
            decode(raw),
            QueryParam::Bytes(b"Hello World! This is a test.".to_vec())
        );
    }

    #[test]
    fn long_base64_word_is_misread_as_bytes() {
        // Known ambiguity of the heuristic: unquoted identifier-like text
        // longer than 20 characters becomes bytes.
        let raw = "averyveryverylongidentifier";
        assert!(matches!(decode(raw), QueryParam::Bytes(_)));
        // Quoting it as JSON keeps it a string.
        assert_eq!(
            decode("\"averyveryverylongidentifier\""),
            QueryParam::Json(json!("averyveryverylongidentifier"))
        );
    }

    #[test]
    fn summary_lists_kinds_only() {
        let params = decode_params(&["5", "secret text", "SGVsbG8gV29ybGQhIFRoaXMgaXMgYSB0ZXN0Lg=="]);
        assert_eq!(summary(&params), "number,text,<28 bytes>");
    }

    fn ty(name: &'static str) -> PgTypeInfo {
        PgTypeInfo::with_name(name)
    }

    #[test]
    fn text_follows_the_inferred_type() {
        let id = "6f1c3d2a-9b8e-4c7d-a6f5-0e1d2c3b4a59";
        assert_eq!(
            decode(id).encode_as(&ty("UUID")).unwrap(),
            TypedValue::Uuid(Uuid::parse_str(id).unwrap())
        );
        assert_eq!(
            decode("2020-01-01").encode_as(&ty("DATE")).unwrap(),
            TypedValue::Date(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap())
        );
        assert_eq!(
            decode("2020-01-01").encode_as(&ty("TIMESTAMPTZ")).unwrap(),
            TypedValue::Timestamptz(
                NaiveDate::from_ymd_opt(2020, 1, 1)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
                    .and_utc()
            )
        );
        assert_eq!(
            decode("10:30").encode_as(&ty("TIME")).unwrap(),
            TypedValue::Time(NaiveTime::from_hms_opt(10, 30, 0).unwrap())
        );
        assert_eq!(
            decode("hello").encode_as(&ty("TEXT")).unwrap(),
            TypedValue::Text("hello".into())
        );
    }

    #[test]
    fn timestamps_accept_server_and_rfc3339_forms() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();

        for raw in ["2024-01-01 12:00:00+02", "2024-01-01T10:00:00Z", "2024-01-01 10:00:00"] {
            assert_eq!(
                decode(raw).encode_as(&ty("TIMESTAMPTZ")).unwrap(),
                TypedValue::Timestamptz(expected.and_utc()),
                "{raw}"
            );
        }
        assert_eq!(
            decode("2024-01-01T10:00:00").encode_as(&ty("TIMESTAMP")).unwrap(),
            TypedValue::Timestamp(expected)
        );
    }

    #[test]
    fn json_values_follow_the_inferred_type() {
        assert_eq!(decode("5").encode_as(&ty("INT4")).unwrap(), TypedValue::Int4(5));
        assert_eq!(decode("5").encode_as(&ty("TEXT")).unwrap(), TypedValue::Text("5".into()));
        assert_eq!(decode("1.5").encode_as(&ty("FLOAT8")).unwrap(), TypedValue::Float8(1.5));
        assert_eq!(
            decode("\"12.50\"").encode_as(&ty("NUMERIC")).unwrap(),
            TypedValue::Numeric(Decimal::new(1250, 2))
        );
        assert_eq!(decode("true").encode_as(&ty("BOOL")).unwrap(), TypedValue::Bool(true));
        assert_eq!(
            decode(r#"{"a":1}"#).encode_as(&ty("JSONB")).unwrap(),
            TypedValue::Json(json!({"a": 1}))
        );
        assert_eq!(
            decode(r#"{"a":1}"#).encode_as(&ty("TEXT")).unwrap(),
            TypedValue::Text(r#"{"a":1}"#.into())
        );
        assert_eq!(decode("null").encode_as(&ty("UUID")).unwrap(), TypedValue::Null);
    }

    #[test]
    fn arrays_from_json_or_literals() {
        assert_eq!(
            decode("[1,2,3]").encode_as(&ty("INT4[]")).unwrap(),
            TypedValue::Int4Array(vec![1, 2, 3])
        );
        assert_eq!(
            decode("{1,2,3}").encode_as(&ty("INT8[]")).unwrap(),
            TypedValue::Int8Array(vec![1, 2, 3])
        );
        assert_eq!(
            decode(r#"{a,"b c"}"#).encode_as(&ty("TEXT[]")).unwrap(),
            TypedValue::TextArray(vec!["a".into(), "b c".into()])
        );
    }

    #[test]
    fn unparsable_text_fails_like_the_server() {
        let err = decode("not-a-uuid").encode_as(&ty("UUID")).unwrap_err();
        match err {
            DbError::Query { message, code } => {
                assert_eq!(message, "invalid input syntax for type uuid: \"not-a-uuid\"");
                assert_eq!(code.as_deref(), Some(INVALID_TEXT_REPRESENTATION));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(decode("1.5").encode_as(&ty("INT4")).is_err());
        assert!(decode("[1,null]").encode_as(&ty("INT4[]")).is_err());
    }

    #[test]
    fn undeclared_placeholders_keep_declared_encoding() {
        assert_eq!(decode("5").into_declared(), TypedValue::Int8(5));
        assert_eq!(decode("hello").into_declared(), TypedValue::Text("hello".into()));
        assert_eq!(decode("[1]").into_declared(), TypedValue::Json(json!([1])));
    }
}
