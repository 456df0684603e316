//! Versioned session blobs
//!
//! A saved session is a JSON envelope:
//! `{"format": "ai-ops/session", "version": 1, "session": {...}}`.
//! The storage layer treats the bytes as opaque. A blob with another format
//! tag or an unknown version is refused instead of being half-read.

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

use super::Session;

pub const SESSION_FORMAT: &str = "ai-ops/session";
pub const SESSION_VERSION: u32 = 1;

#[derive(Serialize)]
struct Envelope<'a> {
    format: &'a str,
    version: u32,
    session: &'a Session,
}

pub fn serialize(session: &Session) -> Result<Vec<u8>> {
    let envelope = Envelope {
        format: SESSION_FORMAT,
        version: SESSION_VERSION,
        session,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

pub fn deserialize(blob: &[u8]) -> Result<Session> {
    let mut envelope: Value = serde_json::from_slice(blob)?;

    let format = envelope.get("format").and_then(Value::as_str);
    if format != Some(SESSION_FORMAT) {
        return Err(Error::IncompatibleSessionVersion {
            found: match format {
                Some(other) => format!("format '{}'", other),
                None => "no format tag".to_string(),
            },
            supported: SESSION_VERSION,
        });
    }

    match envelope.get("version") {
        Some(v) if v.as_u64() == Some(SESSION_VERSION as u64) => {}
        Some(v) => {
            return Err(Error::IncompatibleSessionVersion {
                found: v.to_string(),
                supported: SESSION_VERSION,
            })
        }
        None => {
            return Err(Error::IncompatibleSessionVersion {
                found: "no version".to_string(),
                supported: SESSION_VERSION,
            })
        }
    }

    let session = envelope
        .get_mut("session")
        .map(Value::take)
        .unwrap_or(Value::Null);
    Ok(serde_json::from_value(session)?)
}
