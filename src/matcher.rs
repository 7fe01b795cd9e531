//! Request matching logic.
//!
//! Stub request matchers are compiled once, at registration, and then
//! evaluated against every incoming [`MatchRequest`]. Matching is a pure
//! predicate: no side effects, same answer for the same (stub, request).

use crate::config::{BodyPattern, HeaderMatcher, QueryMatcher, RequestMatcher, UrlPattern};
use crate::json_path;
use bytes::Bytes;
use regex::Regex;
use std::collections::HashMap;

/// A parsed inbound request, as handed to the engine by the transport.
#[derive(Debug, Clone, Default)]
pub struct MatchRequest {
    /// HTTP method
    pub method: String,
    /// Request path, without the query string
    pub path: String,
    /// Raw query string, without the leading `?`
    pub query: Option<String>,
    /// Request headers in arrival order
    pub headers: Vec<(String, String)>,
    /// Request body
    pub body: Bytes,
}

impl MatchRequest {
    /// Build a request from a method and a `path?query` URL.
    pub fn new(method: impl Into<String>, url: &str) -> Self {
        let (path, query) = match url.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (url.to_string(), None),
        };
        Self {
            method: method.into(),
            path,
            query,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(url: &str) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: &str) -> Self {
        Self::new("POST", url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Path and query, as the client sent them.
    pub fn url(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    /// Case-insensitive header lookup (first value wins).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Decoded query parameters.
    pub fn query_params(&self) -> HashMap<String, String> {
        parse_query_string(self.query.as_deref().unwrap_or(""))
    }

    /// Body as UTF-8 text, if it is valid UTF-8.
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// Compiled form of a [`RequestMatcher`].
#[derive(Debug)]
pub struct CompiledMatcher {
    methods: Vec<String>,
    url: CompiledUrlPattern,
    query: Vec<(String, CompiledValueMatcher)>,
    headers: Vec<(String, CompiledValueMatcher)>,
    body: Vec<CompiledBodyPattern>,
}

#[derive(Debug)]
enum CompiledUrlPattern {
    Any,
    Exact(String),
    PathExact(String),
    Prefix(String),
    Wildcard(globset::GlobMatcher),
    Regex(Regex),
    PathRegex(Regex),
}

#[derive(Debug)]
enum CompiledValueMatcher {
    Exact(String),
    Regex(Regex),
    Present,
    Absent,
    Contains(String),
}

#[derive(Debug)]
enum CompiledBodyPattern {
    EqualTo(String),
    Contains(String),
    Regex(Regex),
    JsonPath {
        path: json_path::CompiledPath,
        equals: Option<serde_json::Value>,
    },
    Json,
    Empty,
}

/// Compile a regex that must match the entire input.
fn full_match_regex(pattern: &str) -> Result<Regex, String> {
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| format!("Invalid regex: {}", e))
}

impl CompiledMatcher {
    /// Compile a request matcher; fails on unparseable patterns.
    pub fn compile(matcher: &RequestMatcher) -> Result<Self, String> {
        let methods = matcher
            .method
            .iter()
            .map(|m| m.to_uppercase())
            .filter(|m| m != "ANY" && m != "*")
            .collect();

        let url = match &matcher.url {
            None | Some(UrlPattern::Any) => CompiledUrlPattern::Any,
            Some(UrlPattern::Exact { value }) => CompiledUrlPattern::Exact(value.clone()),
            Some(UrlPattern::PathExact { value }) => CompiledUrlPattern::PathExact(value.clone()),
            Some(UrlPattern::Prefix { value }) => {
                CompiledUrlPattern::Prefix(value.trim_end_matches('*').to_string())
            }
            Some(UrlPattern::Wildcard { pattern }) => {
                let glob = globset::Glob::new(pattern).map_err(|e| format!("Invalid glob: {}", e))?;
                CompiledUrlPattern::Wildcard(glob.compile_matcher())
            }
            Some(UrlPattern::Regex { pattern }) => CompiledUrlPattern::Regex(full_match_regex(pattern)?),
            Some(UrlPattern::PathRegex { pattern }) => {
                CompiledUrlPattern::PathRegex(full_match_regex(pattern)?)
            }
        };

        let mut query = Vec::with_capacity(matcher.query.len());
        for (name, qm) in &matcher.query {
            let compiled = match qm {
                QueryMatcher::Exact { value } => CompiledValueMatcher::Exact(value.clone()),
                QueryMatcher::Regex { pattern } => CompiledValueMatcher::Regex(
                    Regex::new(pattern).map_err(|e| format!("invalid regex for query `{}`: {}", name, e))?,
                ),
                QueryMatcher::Present => CompiledValueMatcher::Present,
                QueryMatcher::Absent => CompiledValueMatcher::Absent,
            };
            query.push((name.clone(), compiled));
        }

        let mut headers = Vec::with_capacity(matcher.headers.len());
        for (name, hm) in &matcher.headers {
            let compiled = match hm {
                HeaderMatcher::Exact { value } => CompiledValueMatcher::Exact(value.clone()),
                HeaderMatcher::Regex { pattern } => CompiledValueMatcher::Regex(
                    Regex::new(pattern).map_err(|e| format!("invalid regex for header `{}`: {}", name, e))?,
                ),
                HeaderMatcher::Present => CompiledValueMatcher::Present,
                HeaderMatcher::Absent => CompiledValueMatcher::Absent,
                HeaderMatcher::Contains { value } => CompiledValueMatcher::Contains(value.clone()),
            };
            headers.push((name.clone(), compiled));
        }

        let mut body = Vec::with_capacity(matcher.body.len());
        for pattern in &matcher.body {
            body.push(match pattern {
                BodyPattern::EqualTo { value } => CompiledBodyPattern::EqualTo(value.clone()),
                BodyPattern::Contains { value } => CompiledBodyPattern::Contains(value.clone()),
                BodyPattern::Regex { pattern } => CompiledBodyPattern::Regex(
                    Regex::new(pattern).map_err(|e| format!("Invalid body regex: {}", e))?,
                ),
                BodyPattern::JsonPath { expression, equals } => CompiledBodyPattern::JsonPath {
                    path: json_path::CompiledPath::compile(expression)?,
                    equals: equals.clone(),
                },
                BodyPattern::Json => CompiledBodyPattern::Json,
                BodyPattern::Empty => CompiledBodyPattern::Empty,
            });
        }

        Ok(Self {
            methods,
            url,
            query,
            headers,
            body,
        })
    }

    /// Does `request` satisfy every part of this matcher?
    pub fn matches(&self, request: &MatchRequest) -> bool {
        self.matches_method(&request.method)
            && self.matches_url(request)
            && self.matches_query(request)
            && self.matches_headers(request)
            && self.matches_body(&request.body)
    }

    fn matches_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    fn matches_url(&self, request: &MatchRequest) -> bool {
        match &self.url {
            CompiledUrlPattern::Any => true,
            CompiledUrlPattern::Exact(value) => request.url() == *value,
            CompiledUrlPattern::PathExact(value) => request.path == *value,
            CompiledUrlPattern::Prefix(value) => request.path.starts_with(value.as_str()),
            CompiledUrlPattern::Wildcard(glob) => glob.is_match(&request.path),
            CompiledUrlPattern::Regex(regex) => regex.is_match(&request.url()),
            CompiledUrlPattern::PathRegex(regex) => regex.is_match(&request.path),
        }
    }

    fn matches_query(&self, request: &MatchRequest) -> bool {
        if self.query.is_empty() {
            return true;
        }
        let params = request.query_params();
        self.query
            .iter()
            .all(|(name, matcher)| matcher.matches(params.get(name).map(String::as_str)))
    }

    fn matches_headers(&self, request: &MatchRequest) -> bool {
        self.headers
            .iter()
            .all(|(name, matcher)| matcher.matches(request.header(name)))
    }

    fn matches_body(&self, body: &[u8]) -> bool {
        if self.body.is_empty() {
            return true;
        }
        let body_str = std::str::from_utf8(body).ok();
        // Parsed lazily and shared by every JSON predicate of this matcher.
        let mut json: Option<Option<serde_json::Value>> = None;

        for pattern in &self.body {
            let ok = match pattern {
                CompiledBodyPattern::EqualTo(value) => body_str == Some(value.as_str()),
                CompiledBodyPattern::Contains(value) => {
                    body_str.map(|bs| bs.contains(value.as_str())).unwrap_or(false)
                }
                CompiledBodyPattern::Regex(regex) => {
                    body_str.map(|bs| regex.is_match(bs)).unwrap_or(false)
                }
                CompiledBodyPattern::JsonPath { path, equals } => {
                    let parsed = json.get_or_insert_with(|| serde_json::from_slice(body).ok());
                    match parsed {
                        Some(doc) => match (path.first(doc), equals) {
                            (Some(found), Some(expected)) => found == *expected,
                            (Some(_), None) => true,
                            (None, _) => false,
                        },
                        None => false,
                    }
                }
                CompiledBodyPattern::Json => json
                    .get_or_insert_with(|| serde_json::from_slice(body).ok())
                    .is_some(),
                CompiledBodyPattern::Empty => body.is_empty(),
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

impl CompiledValueMatcher {
    fn matches(&self, value: Option<&str>) -> bool {
        match self {
            CompiledValueMatcher::Exact(expected) => value == Some(expected.as_str()),
            CompiledValueMatcher::Regex(regex) => value.map(|v| regex.is_match(v)).unwrap_or(false),
            CompiledValueMatcher::Present => value.is_some(),
            CompiledValueMatcher::Absent => value.is_none(),
            CompiledValueMatcher::Contains(needle) => {
                value.map(|v| v.contains(needle.as_str())).unwrap_or(false)
            }
        }
    }
}

/// Parse a query string into key-value pairs.
fn parse_query_string(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    for part in query.split('&') {
        if part.is_empty() {
            continue;
        }
        if let Some((key, value)) = part.split_once('=') {
            params.insert(decode_component(key), decode_component(value));
        } else {
            params.insert(decode_component(part), String::new());
        }
    }

    params
}

/// Form-style decoding: `+` is a space, invalid escapes are kept as-is.
fn decode_component(s: &str) -> String {
    let spaced = s.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}
