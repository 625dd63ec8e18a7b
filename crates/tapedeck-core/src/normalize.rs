//! Request normalization
//!
//! Turns a raw inbound request into its stored form and derives the
//! comparison key used for matching. Two rewrites happen:
//!
//! - the stored form has the test's working directory replaced by a
//!   placeholder and volatile headers dropped
//! - the comparison key additionally drops volatile body fields and query
//!   parameters, which stay verbatim in the stored form
//!
//! Which headers and fields count as volatile is data, see
//! [`NormalizationRules`].

use axum::http::HeaderMap;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};
use crate::exchange::{ExchangeRequest, Payload};

pub const DEFAULT_WORKDIR_PLACEHOLDER: &str = "${workdir}";

/// Headers that describe the connection rather than the message
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Rule set for normalization, loadable from YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationRules {
    /// Request headers never stored nor compared (case-insensitive)
    pub volatile_headers: Vec<String>,
    /// Response headers not stored
    pub volatile_response_headers: Vec<String>,
    /// JSON object keys removed from the comparison key at any depth
    pub volatile_body_fields: Vec<String>,
    /// Query parameters removed from the comparison key
    pub volatile_query_params: Vec<String>,
    /// Token substituted for the working directory
    pub workdir_placeholder: String,
}

impl Default for NormalizationRules {
    fn default() -> Self {
        Self {
            volatile_headers: [
                "authorization",
                "cookie",
                "host",
                "content-length",
                "accept-encoding",
                "user-agent",
                "x-request-id",
                "x-correlation-id",
                "traceparent",
                "tracestate",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            volatile_response_headers: [
                "content-length",
                "date",
                "set-cookie",
                "x-request-id",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            volatile_body_fields: Vec::new(),
            volatile_query_params: Vec::new(),
            workdir_placeholder: DEFAULT_WORKDIR_PLACEHOLDER.to_string(),
        }
    }
}

impl NormalizationRules {
    /// Load rules from a YAML file; missing keys take their defaults
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!(
                "Failed to read normalization rules {}: {e}",
                path.display()
            ))
        })?;
        serde_yaml::from_str(&content).map_err(|e| {
            Error::Configuration(format!(
                "Failed to parse normalization rules {}: {e}",
                path.display()
            ))
        })
    }

    pub fn is_volatile_header(&self, name: &str) -> bool {
        HOP_BY_HOP_HEADERS.contains(&name)
            || self
                .volatile_headers
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name))
    }

    pub fn is_volatile_response_header(&self, name: &str) -> bool {
        HOP_BY_HOP_HEADERS.contains(&name)
            || self
                .volatile_response_headers
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name))
    }

    /// Keep the headers worth storing, lowercased and sorted
    pub fn stored_headers(
        &self,
        headers: &HeaderMap,
        volatile: impl Fn(&Self, &str) -> bool,
    ) -> BTreeMap<String, String> {
        let mut out: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in headers.iter() {
            let name = name.as_str();
            if volatile(self, name) {
                continue;
            }
            let Ok(value) = value.to_str() else {
                continue;
            };
            out.entry(name.to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }
        out
    }

    /// Derive the comparison key from a stored request
    pub fn comparison_key(&self, request: &ExchangeRequest) -> ComparisonKey {
        let body = request.body.as_ref().map(|payload| match payload {
            Payload::Json(value) => {
                let mut value = value.clone();
                strip_fields(&mut value, &self.volatile_body_fields);
                value
            }
            Payload::Text(text) => serde_json::Value::String(text.clone()),
            Payload::Base64(data) => serde_json::Value::String(format!("base64:{data}")),
        });

        ComparisonKey {
            method: request.method.to_ascii_uppercase(),
            path: strip_query_params(&request.path, &self.volatile_query_params),
            body,
        }
    }
}

/// Inbound request as received by the proxy
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: String,
    /// Path plus query string
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The (method, path, body) triple used to match a live request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonKey {
    pub method: String,
    pub path: String,
    pub body: Option<serde_json::Value>,
}

impl fmt::Display for ComparisonKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)?;
        if let Some(body) = &self.body {
            write!(f, " {body}")?;
        }
        Ok(())
    }
}

/// Normalizer bound to one working directory
#[derive(Debug, Clone)]
pub struct Normalizer {
    rules: NormalizationRules,
    /// Spellings of the working directory, longest first
    work_dirs: Vec<String>,
}

impl Normalizer {
    pub fn new(rules: NormalizationRules, work_dir: &Path) -> Self {
        let mut work_dirs = vec![work_dir.to_string_lossy().trim_end_matches('/').to_string()];
        // macOS temp dirs live behind /var -> /private/var
        if let Ok(canonical) = work_dir.canonicalize() {
            let canonical = canonical.to_string_lossy().trim_end_matches('/').to_string();
            if !work_dirs.contains(&canonical) {
                work_dirs.push(canonical);
            }
        }
        work_dirs.retain(|d| !d.is_empty());
        work_dirs.sort_by_key(|d| std::cmp::Reverse(d.len()));

        Self { rules, work_dirs }
    }

    pub fn rules(&self) -> &NormalizationRules {
        &self.rules
    }

    /// Replace every occurrence of the working directory with the placeholder
    ///
    /// A match must end the path component, so `/tmp/work2` is left alone
    /// when the working directory is `/tmp/work`.
    pub fn rewrite_str(&self, input: &str) -> String {
        let mut out = input.to_string();
        for dir in &self.work_dirs {
            if out.contains(dir.as_str()) {
                out = replace_path(&out, dir, &self.rules.workdir_placeholder);
            }
        }
        out
    }

    fn rewrite_value(&self, value: &mut serde_json::Value) {
        match value {
            serde_json::Value::String(s) => *s = self.rewrite_str(s),
            serde_json::Value::Array(items) => {
                for item in items {
                    self.rewrite_value(item);
                }
            }
            serde_json::Value::Object(map) => {
                let entries = std::mem::take(map);
                for (key, mut item) in entries {
                    self.rewrite_value(&mut item);
                    map.insert(self.rewrite_str(&key), item);
                }
            }
            _ => {}
        }
    }

    /// Produce the stored form of a raw request
    pub fn normalize(&self, raw: &RawRequest) -> ExchangeRequest {
        let headers = self
            .rules
            .stored_headers(&raw.headers, NormalizationRules::is_volatile_header)
            .into_iter()
            .map(|(name, value)| (name, self.rewrite_str(&value)))
            .collect();

        let body = Payload::structured(&raw.body).map(|payload| match payload {
            Payload::Json(mut value) => {
                self.rewrite_value(&mut value);
                Payload::Json(value)
            }
            Payload::Text(text) => Payload::Text(self.rewrite_str(&text)),
            other => other,
        });

        ExchangeRequest {
            method: raw.method.to_ascii_uppercase(),
            path: self.rewrite_str(&raw.path),
            headers,
            body,
        }
    }

    /// Stored form and comparison key in one go
    pub fn key_for(&self, raw: &RawRequest) -> (ExchangeRequest, ComparisonKey) {
        let request = self.normalize(raw);
        let key = self.rules.comparison_key(&request);
        (request, key)
    }
}

fn replace_path(input: &str, dir: &str, placeholder: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find(dir) {
        let end = pos + dir.len();
        let at_boundary = rest[end..]
            .chars()
            .next()
            .map_or(true, |c| !is_path_name_char(c));
        out.push_str(&rest[..pos]);
        out.push_str(if at_boundary { placeholder } else { dir });
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}

fn is_path_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

fn strip_fields(value: &mut serde_json::Value, fields: &[String]) {
    if fields.is_empty() {
        return;
    }
    match value {
        serde_json::Value::Object(map) => {
            map.retain(|k, _| !fields.iter().any(|f| f == k));
            for item in map.values_mut() {
                strip_fields(item, fields);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                strip_fields(item, fields);
            }
        }
        _ => {}
    }
}

fn strip_query_params(path: &str, params: &[String]) -> String {
    let Some((base, query)) = path.split_once('?') else {
        return path.to_string();
    };
    if params.is_empty() {
        return path.to_string();
    }
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let name = pair.split_once('=').map_or(*pair, |(k, _)| k);
            !params.iter().any(|p| p == name)
        })
        .collect();
    if kept.is_empty() {
        base.to_string()
    } else {
        format!("{base}?{}", kept.join("&"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    fn raw(path: &str, body: serde_json::Value) -> RawRequest {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("x-request-id", HeaderValue::from_static("abc-123"));
        RawRequest {
            method: "post".to_string(),
            path: path.to_string(),
            headers,
            body: Bytes::from(serde_json::to_vec(&body).unwrap()),
        }
    }

    #[test]
    fn test_workdir_rewritten_in_path_and_body() {
        let normalizer = Normalizer::new(
            NormalizationRules::default(),
            Path::new("/tmp/tapedeck-work-a1b2"),
        );
        let request = normalizer.normalize(&raw(
            "/files?root=/tmp/tapedeck-work-a1b2/src",
            json!({"cwd": "/tmp/tapedeck-work-a1b2", "files": ["/tmp/tapedeck-work-a1b2/x.rs"]}),
        ));

        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/files?root=${workdir}/src");
        assert_eq!(
            request.body.unwrap().as_json().unwrap(),
            &json!({"cwd": "${workdir}", "files": ["${workdir}/x.rs"]})
        );
    }

    #[test]
    fn test_sibling_paths_not_rewritten() {
        let normalizer = Normalizer::new(
            NormalizationRules::default(),
            Path::new("/tmp/tapedeck-work"),
        );
        assert_eq!(
            normalizer.rewrite_str("/tmp/tapedeck-work2/x /tmp/tapedeck-work_old"),
            "/tmp/tapedeck-work2/x /tmp/tapedeck-work_old"
        );
        assert_eq!(
            normalizer.rewrite_str("cd /tmp/tapedeck-work && ls /tmp/tapedeck-work/src"),
            "cd ${workdir} && ls ${workdir}/src"
        );
        assert_eq!(
            normalizer.rewrite_str("/tmp/tapedeck-work2:/tmp/tapedeck-work"),
            "/tmp/tapedeck-work2:${workdir}"
        );
    }

    #[test]
    fn test_volatile_headers_dropped() {
        let normalizer = Normalizer::new(NormalizationRules::default(), Path::new("/w"));
        let request = normalizer.normalize(&raw("/", json!({})));
        assert!(!request.headers.contains_key("authorization"));
        assert!(!request.headers.contains_key("x-request-id"));
        assert_eq!(
            request.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
    }

    #[test]
    fn test_different_workdirs_same_key() {
        let rules = NormalizationRules::default();
        let a = Normalizer::new(rules.clone(), Path::new("/home/alice/run-1"));
        let b = Normalizer::new(rules, Path::new("/Users/bob/tmp/run-9"));

        let (_, key_a) = a.key_for(&raw("/chat", json!({"prompt": "ls /home/alice/run-1"})));
        let (_, key_b) = b.key_for(&raw("/chat", json!({"prompt": "ls /Users/bob/tmp/run-9"})));
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn test_volatile_fields_removed_from_key_but_stored() {
        let rules = NormalizationRules {
            volatile_body_fields: vec!["timestamp".to_string(), "nonce".to_string()],
            ..Default::default()
        };
        let normalizer = Normalizer::new(rules, Path::new("/w"));

        let (stored_a, key_a) = normalizer.key_for(&raw(
            "/chat",
            json!({"messages": [{"role": "user", "timestamp": 1}], "nonce": "x1"}),
        ));
        let (_, key_b) = normalizer.key_for(&raw(
            "/chat",
            json!({"messages": [{"role": "user", "timestamp": 2}], "nonce": "y2"}),
        ));

        assert_eq!(key_a, key_b);
        let stored = stored_a.body.unwrap();
        assert_eq!(stored.as_json().unwrap()["nonce"], json!("x1"));
    }

    #[test]
    fn test_volatile_query_params() {
        let rules = NormalizationRules {
            volatile_query_params: vec!["ts".to_string()],
            ..Default::default()
        };
        assert_eq!(strip_query_params("/a?ts=1&b=2", &rules.volatile_query_params), "/a?b=2");
        assert_eq!(strip_query_params("/a?ts=1", &rules.volatile_query_params), "/a");
        assert_eq!(strip_query_params("/a", &rules.volatile_query_params), "/a");
    }

    #[test]
    fn test_key_display() {
        let key = ComparisonKey {
            method: "POST".to_string(),
            path: "/chat".to_string(),
            body: Some(json!({"a": 1})),
        };
        assert_eq!(key.to_string(), r#"POST /chat {"a":1}"#);
    }

    #[test]
    fn test_rules_from_yaml_keep_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(&path, "volatile_body_fields: [created_at]\n").unwrap();

        let rules = NormalizationRules::from_yaml_file(&path).unwrap();
        assert_eq!(rules.volatile_body_fields, vec!["created_at"]);
        assert_eq!(rules.workdir_placeholder, DEFAULT_WORKDIR_PLACEHOLDER);
        assert!(rules.is_volatile_header("Authorization"));
    }
}
