//! Result marshaling: database rows to JSON records.

use std::fmt::Write;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde_json::{json, Map, Number, Value};
use sqlx::postgres::types::Oid;
use sqlx::postgres::PgRow;
use sqlx::types::Uuid;
use sqlx::{Column, Row, TypeInfo, ValueRef};

/// Convert one row into a JSON object keyed by column name.
///
/// Columns sharing a name collapse to the last one, as in a JS object.
pub fn row_to_json(row: &PgRow) -> Map<String, Value> {
    let mut record = Map::with_capacity(row.len());
    for column in row.columns() {
        let value = column_to_json(row, column.ordinal(), column.type_info().name());
        record.insert(column.name().to_owned(), value);
    }
    record
}

fn column_to_json(row: &PgRow, idx: usize, type_name: &str) -> Value {
    match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(_) => {}
        Err(e) => {
            tracing::debug!(column = idx, error = %e, "column not readable");
            return Value::Null;
        }
    }

    let decoded = match type_name {
        "BOOL" => row.try_get::<bool, _>(idx).map(Value::Bool),
        "INT2" => row.try_get::<i16, _>(idx).map(Value::from),
        "INT4" => row.try_get::<i32, _>(idx).map(Value::from),
        // 64-bit integers exceed JSON's safe range; keep them exact as text.
        "INT8" => row.try_get::<i64, _>(idx).map(|v| Value::String(v.to_string())),
        "FLOAT4" => row.try_get::<f32, _>(idx).map(|v| float(f64::from(v))),
        "FLOAT8" => row.try_get::<f64, _>(idx).map(float),
        "NUMERIC" => row
            .try_get_unchecked::<&[u8], _>(idx)
            .map(|buf| numeric_to_string(buf).map_or(Value::Null, Value::String)),
        "JSON" | "JSONB" => row.try_get::<Value, _>(idx),
        "UUID" => row.try_get::<Uuid, _>(idx).map(|v| Value::String(v.to_string())),
        "TIMESTAMPTZ" => row
            .try_get::<DateTime<Utc>, _>(idx)
            .map(|v| Value::String(v.to_rfc3339_opts(SecondsFormat::Millis, true))),
        "TIMESTAMP" => row
            .try_get::<NaiveDateTime, _>(idx)
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.3f").to_string())),
        "DATE" => row.try_get::<NaiveDate, _>(idx).map(|v| Value::String(v.to_string())),
        "TIME" => row.try_get::<NaiveTime, _>(idx).map(|v| Value::String(v.to_string())),
        "BYTEA" => row.try_get::<Vec<u8>, _>(idx).map(|v| buffer(&v)),
        "OID" => row.try_get::<Oid, _>(idx).map(|v| Value::from(v.0)),
        "VOID" => Ok(Value::String(String::new())),
        "BOOL[]" => row.try_get::<Vec<Option<bool>>, _>(idx).map(|v| json!(v)),
        "INT2[]" => row.try_get::<Vec<Option<i16>>, _>(idx).map(|v| json!(v)),
        "INT4[]" => row.try_get::<Vec<Option<i32>>, _>(idx).map(|v| json!(v)),
        "INT8[]" => row.try_get::<Vec<Option<i64>>, _>(idx).map(|v| {
            Value::Array(
                v.into_iter()
                    .map(|i| i.map_or(Value::Null, |i| Value::String(i.to_string())))
                    .collect(),
            )
        }),
        "FLOAT8[]" => row
            .try_get::<Vec<Option<f64>>, _>(idx)
            .map(|v| Value::Array(v.into_iter().map(|f| f.map_or(Value::Null, float)).collect())),
        "TEXT[]" | "VARCHAR[]" | "NAME[]" => {
            row.try_get::<Vec<Option<String>>, _>(idx).map(|v| json!(v))
        }
        // TEXT, VARCHAR, BPCHAR, NAME, enums and anything else with a
        // textual representation
        _ => row.try_get_unchecked::<String, _>(idx).map(Value::String),
    };

    decoded.unwrap_or_else(|e| {
        tracing::debug!(column = idx, type_name, error = %e, "unsupported column value, returning null");
        Value::Null
    })
}

fn float(v: f64) -> Value {
    Number::from_f64(v).map_or(Value::Null, Value::Number)
}

/// Binary values in the shape Node's `Buffer.toJSON()` produces.
fn buffer(bytes: &[u8]) -> Value {
    json!({ "type": "Buffer", "data": bytes })
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Render a `NUMERIC` in Postgres binary format as its exact decimal text.
///
/// Layout: `ndigits`, `weight`, `sign`, `dscale` (all 16-bit big endian),
/// then `ndigits` base-10000 digits, most significant first.
pub fn numeric_to_string(buf: &[u8]) -> Option<String> {
    let word = |at: usize| -> Option<u16> {
        let bytes = buf.get(at..at + 2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    };

    let ndigits = usize::from(word(0)?);
    let weight = i32::from(word(2)? as i16);
    let sign = word(4)?;
    let dscale = usize::from(word(6)?);

    match sign {
        NUMERIC_NAN => return Some("NaN".into()),
        NUMERIC_PINF => return Some("Infinity".into()),
        NUMERIC_NINF => return Some("-Infinity".into()),
        _ => {}
    }

    let digits = (0..ndigits)
        .map(|i| word(8 + 2 * i))
        .collect::<Option<Vec<u16>>>()?;
    let digit = |group: i32| -> u16 {
        usize::try_from(group)
            .ok()
            .and_then(|g| digits.get(g).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        for group in 0..=weight {
            if group == 0 {
                let _ = write!(out, "{}", digit(group));
            } else {
                let _ = write!(out, "{:04}", digit(group));
            }
        }
    }

    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut group = weight + 1;
        while frac.len() < dscale {
            let _ = write!(frac, "{:04}", digit(group));
            group += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }

    Some(out)
}

/// Leading keyword of a statement, upper-cased. Comments and whitespace
/// are skipped; `WITH` is reported as `SELECT`.
pub fn command_tag(sql: &str) -> String {
    let mut rest = sql;
    loop {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail);
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail);
        } else {
            break;
        }
    }

    let keyword: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();

    match keyword.as_str() {
        "WITH" => "SELECT".into(),
        _ => keyword,
    }
}
