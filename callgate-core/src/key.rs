// Request key derivation for cache and deduplication lookups.
//
// Keys are built by literal concatenation of the canonicalised request shape.
// Only oversized segments are hashed, to bound key length.

use crate::request::{HttpMethod, RequestSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// When the request body takes part in the key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyKeyMode {
    Never,
    /// Only for write methods (POST/PUT/PATCH/DELETE)
    #[default]
    NonIdempotent,
    Always,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    pub body: BodyKeyMode,
    /// Segments longer than this are replaced by their hash
    pub max_segment_len: usize,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            body: BodyKeyMode::NonIdempotent,
            max_segment_len: 512,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct KeyGenerator {
    config: KeyConfig,
}

impl KeyGenerator {
    pub fn new(config: KeyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &KeyConfig {
        &self.config
    }

    /// Derive the key for a request. Equal request shapes always produce the
    /// same key regardless of object key order.
    pub fn generate(&self, request: &RequestSpec) -> String {
        let mut key = String::with_capacity(64);
        key.push_str(request.method.as_str());
        key.push(' ');
        key.push_str(&request.url);

        if let Some(params) = request.params.as_ref().filter(|p| !is_empty(p)) {
            key.push('?');
            key.push_str(&self.bounded(canonical_json(params)));
        }

        if self.includes_body(request.method) {
            if let Some(data) = request.data.as_ref().filter(|d| !is_empty(d)) {
                key.push('#');
                key.push_str(&self.bounded(canonical_json(data)));
            }
        }

        key
    }

    fn includes_body(&self, method: HttpMethod) -> bool {
        match self.config.body {
            BodyKeyMode::Never => false,
            BodyKeyMode::NonIdempotent => !method.is_read(),
            BodyKeyMode::Always => true,
        }
    }

    fn bounded(&self, segment: String) -> String {
        if segment.len() <= self.config.max_segment_len {
            segment
        } else {
            format!("h{:016x}:{}", fnv1a(segment.as_bytes()), segment.len())
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Serialize a JSON value with object keys sorted at every level
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*k).clone()).to_string());
                out.push(':');
                write_canonical(&map[k.as_str()], out);
            }
            out.push('}');
        }
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
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// 64-bit FNV-1a. Collisions only cause a cache/dedup false share.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}
