//! Canonical JSON text and the checksums computed over it.
//!
//! Object keys are sorted recursively and no whitespace is emitted, so two
//! equal documents always produce the same bytes regardless of how their maps
//! were built. A `serde_json::Value` is a tree, which means cyclic input can
//! not be expressed in the first place; the writer needs no cycle guard.

use std::fmt;
use std::str::FromStr;

use plexus_core::hash::hash32_hex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Render `value` as compact JSON with recursively sorted object keys.
///
/// ```
/// use plexus_state::canonical::canonical_json;
/// use serde_json::json;
///
/// let text = canonical_json(&json!({ "b": [2, { "z": 1, "a": null }], "a": "x" }));
/// assert_eq!(text, r#"{"a":"x","b":[2,{"a":null,"z":1}]}"#);
/// ```
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(key.as_str()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        // Scalars: serde_json's compact form is already canonical.
        scalar => out.push_str(&scalar.to_string()),
    }
}

// ---------------------------------------------------------------------------
// ChecksumAlgorithm
// ---------------------------------------------------------------------------

/// Checksum algorithms a snapshot can declare.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// 32-bit FNV-1a, 8 hex chars.
    #[default]
    Fnv1a32,
    /// BLAKE3, 64 hex chars.
    Blake3,
}

impl ChecksumAlgorithm {
    /// The name recorded in `checksumAlgorithm`.
    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Fnv1a32 => "fnv1a32",
            ChecksumAlgorithm::Blake3 => "blake3",
        }
    }

    /// Hex digest of `text` under this algorithm.
    pub fn digest(self, text: &str) -> String {
        match self {
            ChecksumAlgorithm::Fnv1a32 => hash32_hex(text.as_bytes()),
            ChecksumAlgorithm::Blake3 => blake3::hash(text.as_bytes()).to_hex().to_string(),
        }
    }

    /// Length of the hex digest.
    pub fn hex_len(self) -> usize {
        match self {
            ChecksumAlgorithm::Fnv1a32 => 8,
            ChecksumAlgorithm::Blake3 => 64,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an unrecognised algorithm name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown checksum algorithm '{0}'")]
pub struct UnknownAlgorithm(pub String);

impl FromStr for ChecksumAlgorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fnv1a32" => Ok(ChecksumAlgorithm::Fnv1a32),
            "blake3" => Ok(ChecksumAlgorithm::Blake3),
            other => Err(UnknownAlgorithm(other.to_owned())),
        }
    }
}
