//! GELF message model and parser.
//!
//! Incoming messages are a JSON object with a fixed-field core (`version`,
//! `host`, `short_message`, `full_message`, `timestamp`, `facility`) and any
//! number of additional fields. Additional values are discriminated at parse
//! time into two homogeneous maps (strings and numbers) so the commit path
//! needs no runtime type check beyond a map lookup; booleans collapse into
//! the number map as 0/1.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while parsing a GELF message.
#[derive(Debug, Error)]
pub enum GelfError {
    /// Request body is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Top-level JSON value is not an object.
    #[error("GELF message must be a JSON object")]
    NotAnObject,

    /// A fixed field carried the wrong JSON type.
    #[error("{expected} expected at '{field}'")]
    FieldType {
        field: String,
        expected: &'static str,
    },

    /// An additional field key was empty.
    #[error("zero-length field key")]
    EmptyKey,

    /// An additional field key failed identifier validation.
    #[error("invalid GELF message key: '{0}'")]
    InvalidKey(String),

    /// An additional field value was not a string, number, or boolean.
    #[error("unsupported value type at '{0}'")]
    UnsupportedValue(String),
}

/// An ingested log record.
///
/// `timestamp` is Unix seconds, UTC. A timestamp of 0 means "unset"; it is
/// replaced with the current time when the message is committed, not at
/// ingest, so messages that carry a wire timestamp keep it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GelfMessage {
    pub version: String,
    pub host: String,
    pub short_message: String,
    pub full_message: String,
    pub timestamp: u32,
    pub facility: String,
    /// Additional string-valued fields, keyed by validated identifier.
    pub additional_strings: BTreeMap<String, String>,
    /// Additional numeric fields; booleans land here as 0/1.
    pub additional_numbers: BTreeMap<String, f64>,
}

/// Returns true when `s` is a valid field identifier: `^[A-Za-z][A-Za-z0-9_-]*$`.
///
/// Identifiers end up inlined into `ALTER TABLE` and `INSERT` column lists,
/// which cannot be parameter-bound, so everything that reaches the storage
/// layer must have passed this check.
pub(crate) fn is_valid_identifier(s: &str) -> bool {
    static IDENTIFIER_RE: OnceLock<Regex> = OnceLock::new();
    let re = IDENTIFIER_RE.get_or_init(|| {
        Regex::new("^[A-Za-z][A-Za-z0-9_-]*$").expect("failed to compile identifier regex")
    });
    re.is_match(s)
}

/// Parse a GELF message from a raw request body.
///
/// Unknown keys are treated as additional fields: a single leading
/// underscore is stripped, the remainder must match the identifier rule,
/// and the value must be a scalar (string, number, or boolean).
pub fn parse_gelf(data: &[u8]) -> Result<GelfMessage, GelfError> {
    let value: serde_json::Value = serde_json::from_slice(data)?;
    let object = value.as_object().ok_or(GelfError::NotAnObject)?;

    let mut msg = GelfMessage::default();

    for (key, value) in object {
        match key.as_str() {
            "version" => msg.version = expect_string(key, value)?,
            "host" => msg.host = expect_string(key, value)?,
            "short_message" => msg.short_message = expect_string(key, value)?,
            "full_message" => msg.full_message = expect_string(key, value)?,
            "facility" => msg.facility = expect_string(key, value)?,
            "timestamp" => {
                let n = value.as_f64().ok_or_else(|| GelfError::FieldType {
                    field: key.clone(),
                    expected: "number",
                })?;
                msg.timestamp = n as u32;
            }
            _ => {
                if key.is_empty() {
                    return Err(GelfError::EmptyKey);
                }
                let name = key.strip_prefix('_').unwrap_or(key.as_str());
                if !is_valid_identifier(name) {
                    return Err(GelfError::InvalidKey(name.to_string()));
                }
                match value {
                    serde_json::Value::String(s) => {
                        msg.additional_strings.insert(name.to_string(), s.clone());
                    }
                    serde_json::Value::Number(n) => {
                        let v = n.as_f64().ok_or_else(|| GelfError::FieldType {
                            field: key.clone(),
                            expected: "number",
                        })?;
                        msg.additional_numbers.insert(name.to_string(), v);
                    }
                    serde_json::Value::Bool(b) => {
                        msg.additional_numbers
                            .insert(name.to_string(), if *b { 1.0 } else { 0.0 });
                    }
                    _ => return Err(GelfError::UnsupportedValue(key.clone())),
                }
            }
        }
    }

    Ok(msg)
}

fn expect_string(key: &str, value: &serde_json::Value) -> Result<String, GelfError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| GelfError::FieldType {
            field: key.to_string(),
            expected: "string",
        })
}
