//! Nagios performance data decoding
//!
//! Turns the `perf_data` text of a check result
//! (`label=value[uom][;warn[;crit[;min[;max]]]] ...`) into typed metric records.
//! Decoding never fails: malformed tokens are dropped and the rest are kept.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Marker used by the plugin guidelines when a value could not be determined
pub const UNKNOWN_VALUE: &str = "U";

/// One performance data point, keyed by its label in [`Metrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Numeric text as emitted by the plugin, or `U`
    pub val: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uom: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,
}

pub type Metrics = BTreeMap<String, MetricRecord>;

/// Decodes a whole performance data string.
///
/// Labels may be single-quoted to carry whitespace (`'free space'=10%`), with
/// `''` standing for a literal quote. A repeated label keeps its last value.
pub fn decode(raw: &str) -> Metrics {
    let mut metrics = Metrics::new();
    for token in tokenize(raw) {
        if let Some((label, record)) = decode_token(&token) {
            metrics.insert(label, record);
        }
    }
    metrics
}

/// Decodes a single `label=value;warn;crit;min;max` token.
///
/// Returns `None` for tokens without `=` or with an empty label.
pub fn decode_token(token: &str) -> Option<(String, MetricRecord)> {
    let split = label_end(token)?;
    let label = unquote_label(&token[..split]);
    if label.is_empty() {
        return None;
    }

    let mut slots = token[split + 1..].split(';');
    let (val, uom) = split_unit(slots.next().unwrap_or_default());
    let mut next_slot = || {
        slots
            .next()
            .filter(|slot| !slot.is_empty())
            .map(str::to_string)
    };

    let mut record = MetricRecord {
        val,
        uom,
        warn: next_slot(),
        crit: next_slot(),
        min: next_slot(),
        max: next_slot(),
    };

    if record.uom.as_deref() == Some("%") {
        record.min.get_or_insert_with(|| "0".to_string());
        record.max.get_or_insert_with(|| "100".to_string());
    }

    Some((label, record))
}

/// Splits a value such as `120ms` into its numeric body and unit.
///
/// An empty numeric body yields the unknown marker and no unit.
fn split_unit(value: &str) -> (String, Option<String>) {
    let end = numeric_prefix_len(value);
    if end == 0 {
        return (UNKNOWN_VALUE.to_string(), None);
    }
    let unit = &value[end..];
    let uom = (!unit.is_empty()).then(|| unit.to_string());
    (value[..end].to_string(), uom)
}

/// Length in bytes of the leading number (sign, digits, `.`/`,`, exponent).
fn numeric_prefix_len(value: &str) -> usize {
    let bytes = value.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'-' | b'+')) {
        end = 1;
    }

    let mut digits = 0;
    while let Some(&b) = bytes.get(end) {
        match b {
            b'0'..=b'9' => digits += 1,
            b'.' | b',' => {}
            _ => break,
        }
        end += 1;
    }
    if digits == 0 {
        return 0;
    }

    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'-' | b'+')) {
            exp += 1;
        }
        let exp_digits = exp;
        while bytes.get(exp).is_some_and(u8::is_ascii_digit) {
            exp += 1;
        }
        if exp > exp_digits {
            end = exp;
        }
    }
    end
}

/// Whitespace tokenizer that keeps a quoted label together.
///
/// A quote only opens a label when it starts a token. An unterminated label
/// falls back to plain whitespace splitting so it cannot absorb later tokens.
fn tokenize(raw: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_whitespace() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            continue;
        }
        if c == '\'' && current.is_empty() {
            let mut label = String::from(c);
            let mut closed = false;
            while let Some(q) = chars.next() {
                label.push(q);
                if q == '\'' {
                    match chars.next_if_eq(&'\'') {
                        Some(escaped) => label.push(escaped),
                        None => {
                            closed = true;
                            break;
                        }
                    }
                }
            }
            if closed {
                current = label;
            } else {
                tokens.extend(label.split_whitespace().map(str::to_string));
            }
            continue;
        }
        current.push(c);
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Byte offset of the `=` separating label and value, skipping over a
/// leading quoted label.
fn label_end(token: &str) -> Option<usize> {
    let Some(rest) = token.strip_prefix('\'') else {
        return token.find('=');
    };
    let mut chars = rest.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if c != '\'' {
            continue;
        }
        if chars.next_if(|&(_, next)| next == '\'').is_none() {
            let after = 1 + idx + c.len_utf8();
            return token[after..].find('=').map(|pos| after + pos);
        }
    }
    token.find('=')
}

fn unquote_label(label: &str) -> String {
    match label
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
    {
        Some(inner) => inner.replace("''", "'"),
        None => label.to_string(),
    }
}
