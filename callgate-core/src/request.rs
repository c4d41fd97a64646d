use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Options,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Read-style methods: safe to cache and to deduplicate by default
    pub fn is_read(&self) -> bool {
        matches!(self, HttpMethod::Get | HttpMethod::Head | HttpMethod::Options)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete HTTP request, built per call from a method config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl RequestSpec {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        RequestSpec {
            method,
            url: url.into(),
            params: None,
            data: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Patch, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, url)
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Merge call params into a copy of this spec.
    ///
    /// Read methods take params as query parameters, write methods take them
    /// as the request body. Objects are merged key by key with the call
    /// params winning; anything else replaces the static value.
    pub fn merged_with(&self, params: &Value) -> RequestSpec {
        let mut spec = self.clone();
        if params.is_null() {
            return spec;
        }

        let slot = if spec.method.is_read() {
            &mut spec.params
        } else {
            &mut spec.data
        };
        *slot = Some(merge_values(slot.take(), params));
        spec
    }
}

fn merge_values(base: Option<Value>, overlay: &Value) -> Value {
    match (base, overlay) {
        (Some(Value::Object(mut base)), Value::Object(overlay)) => {
            for (k, v) in overlay {
                base.insert(k.clone(), v.clone());
            }
            Value::Object(base)
        }
        _ => overlay.clone(),
    }
}

/// Transport response as seen by the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub data: Value,
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub config: RequestSpec,
}

impl Response {
    pub fn new(data: Value, status: u16, config: RequestSpec) -> Self {
        Response {
            data,
            status,
            status_text: String::new(),
            headers: BTreeMap::new(),
            config,
        }
    }

    /// Synthetic 200 response, used by error middleware to recover a call
    pub fn ok(data: Value, config: RequestSpec) -> Self {
        let mut response = Self::new(data, 200, config);
        response.status_text = "OK".to_string();
        response
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Convert a JSON object into an ordered map of string pairs, as used for
/// query strings. Non-string scalars are rendered with their JSON text.
pub fn value_to_pairs(value: &Value) -> Vec<(String, String)> {
    match value {
        Value::Object(map) => object_pairs(map),
        _ => Vec::new(),
    }
}

fn object_pairs(map: &Map<String, Value>) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = map
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let rendered = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), rendered)
        })
        .collect();
    pairs.sort();
    pairs
}
