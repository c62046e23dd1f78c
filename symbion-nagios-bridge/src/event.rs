//! Check result events read from the spool
//!
//! A spool file holds one JSON object written by the monitoring side. Known
//! fields are typed, everything else rides along untouched in `extra` so new
//! upstream fields reach subscribers without a bridge release.

use crate::perfdata::{self, Metrics};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed check result payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Value of the `type` field; anything unrecognised is kept verbatim and
/// routed like a host check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckKind {
    #[serde(rename = "HOST", alias = "host")]
    Host,
    #[serde(rename = "SERVICE", alias = "service")]
    Service,
    #[serde(untagged)]
    Other(String),
}

/// Decoded check result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckEvent {
    #[serde(default)]
    pub hostname: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_description: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<CheckKind>,

    /// Routing sub-namespace inserted after `checks/`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Raw text on the way in, decoded metrics on the way out
    #[serde(
        default,
        deserialize_with = "perf_data_from_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub perf_data: Option<Metrics>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CheckEvent {
    pub fn is_service(&self) -> bool {
        self.kind == Some(CheckKind::Service)
    }

    /// Re-encodes the event for publication.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

fn perf_data_from_text<'de, D>(deserializer: D) -> Result<Option<Metrics>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.map(|text| perfdata::decode(&text)))
}

/// Drops every character that is neither printable nor whitespace.
///
/// Invalid UTF-8 sequences go as well (they would decode to U+FFFD).
pub fn sanitize(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .chars()
        .filter(|c| c.is_whitespace() || !(c.is_control() || *c == char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Sanitizes and parses one spool payload.
pub fn decode(raw: &[u8]) -> Result<CheckEvent, DecodeError> {
    let text = sanitize(raw);
    Ok(serde_json::from_str(&text)?)
}
