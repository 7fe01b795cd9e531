//! Configuration for the stub server.
//!
//! Defines stub definitions (request matchers and response specs) and
//! server settings. Everything here is plain serde data; compiled forms
//! live in [`crate::matcher`] and [`crate::synthesizer`].

use crate::error::StubError;
use crate::json_path;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Main configuration for the stub server.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MockServerConfig {
    /// Stubs registered when the server starts
    #[serde(default)]
    pub stubs: Vec<StubDefinition>,

    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,

    /// Response used when no stub matches (404 with empty body if unset)
    #[serde(default)]
    pub default_response: Option<ResponseDefinition>,
}

impl MockServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (i, stub) in self.stubs.iter().enumerate() {
            stub.validate()
                .map_err(|e| anyhow::anyhow!("Stub {}: {}", i, e))?;
        }
        if let Some(default) = &self.default_response {
            default
                .validate("default_response")
                .map_err(|e| anyhow::anyhow!("{}", e))?;
        }
        self.settings
            .listen
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow::anyhow!("Invalid listen address {}: {}", self.settings.listen, e))?;
        Ok(())
    }
}

/// A single stub definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StubDefinition {
    /// Unique identifier; generated at registration when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Optional name/description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Request matcher
    #[serde(default)]
    pub request: RequestMatcher,

    /// Response to return
    pub response: ResponseDefinition,

    /// Priority (lower = matched first, unset = matched last)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

impl StubDefinition {
    /// Start a definition for the given request matcher and response.
    pub fn new(request: RequestMatcher, response: ResponseDefinition) -> Self {
        Self {
            id: None,
            name: None,
            request,
            response,
            priority: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn at_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Label used in error messages before an id has been assigned.
    pub fn label(&self) -> &str {
        self.id
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or("<unnamed>")
    }

    /// Validate the stub definition.
    pub fn validate(&self) -> Result<(), StubError> {
        let label = self.label();
        self.validate_id()?;
        self.request
            .validate()
            .map_err(|reason| StubError::invalid(label, reason))?;
        self.response.validate(label)?;
        Ok(())
    }

    /// Reject an explicit id that is blank.
    pub fn validate_id(&self) -> Result<(), StubError> {
        match &self.id {
            Some(id) if id.trim().is_empty() => {
                Err(StubError::invalid(self.label(), "stub id cannot be empty"))
            }
            _ => Ok(()),
        }
    }
}

/// Request matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RequestMatcher {
    /// HTTP method(s) to match (empty, `ANY` or `*` = any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub method: Vec<String>,

    /// URL matching (absent = any URL)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<UrlPattern>,

    /// Query parameter matching
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub query: HashMap<String, QueryMatcher>,

    /// Header matching
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, HeaderMatcher>,

    /// Body predicates, all of which must hold
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<BodyPattern>,
}

impl RequestMatcher {
    /// Match any method on the given URL pattern.
    pub fn url(url: UrlPattern) -> Self {
        Self {
            url: Some(url),
            ..Self::default()
        }
    }

    /// Match `GET` requests on the given URL pattern.
    pub fn get(url: UrlPattern) -> Self {
        Self::url(url).with_method("GET")
    }

    /// Match `POST` requests on the given URL pattern.
    pub fn post(url: UrlPattern) -> Self {
        Self::url(url).with_method("POST")
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method.push(method.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, matcher: QueryMatcher) -> Self {
        self.query.insert(name.into(), matcher);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, matcher: HeaderMatcher) -> Self {
        self.headers.insert(name.into(), matcher);
        self
    }

    pub fn with_body(mut self, pattern: BodyPattern) -> Self {
        self.body.push(pattern);
        self
    }

    /// Validate the request matcher.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(url) = &self.url {
            url.validate()?;
        }
        for (name, qm) in &self.query {
            if let QueryMatcher::Regex { pattern } = qm {
                regex::Regex::new(pattern)
                    .map_err(|e| format!("invalid regex for query `{}`: {}", name, e))?;
            }
        }
        for (name, hm) in &self.headers {
            if let HeaderMatcher::Regex { pattern } = hm {
                regex::Regex::new(pattern)
                    .map_err(|e| format!("invalid regex for header `{}`: {}", name, e))?;
            }
        }
        for pattern in &self.body {
            pattern.validate()?;
        }
        Ok(())
    }
}

/// URL matching configuration. The kind of match is part of the pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UrlPattern {
    /// Path and query equal `value`
    Exact { value: String },
    /// Path (query ignored) equals `value`
    PathExact { value: String },
    /// Path starts with `value`; a trailing `*` is accepted as a wildcard marker
    Prefix { value: String },
    /// Glob pattern over the path
    Wildcard { pattern: String },
    /// Regex that must match the whole of path and query
    Regex { pattern: String },
    /// Regex that must match the whole path
    PathRegex { pattern: String },
    /// Any URL
    Any,
}

impl UrlPattern {
    pub fn exact(value: impl Into<String>) -> Self {
        UrlPattern::Exact { value: value.into() }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        UrlPattern::Regex {
            pattern: pattern.into(),
        }
    }

    pub fn path_regex(pattern: impl Into<String>) -> Self {
        UrlPattern::PathRegex {
            pattern: pattern.into(),
        }
    }

    pub fn prefix(value: impl Into<String>) -> Self {
        UrlPattern::Prefix { value: value.into() }
    }

    /// Validate the URL pattern.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            UrlPattern::Regex { pattern } | UrlPattern::PathRegex { pattern } => {
                regex::Regex::new(pattern).map_err(|e| format!("Invalid regex: {}", e))?;
            }
            UrlPattern::Wildcard { pattern } => {
                globset::Glob::new(pattern).map_err(|e| format!("Invalid glob: {}", e))?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Query parameter matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryMatcher {
    /// Exact value match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Parameter must be present (any value)
    Present,
    /// Parameter must be absent
    Absent,
}

/// Header matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeaderMatcher {
    /// Exact value match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Header must be present (any value)
    Present,
    /// Header must be absent
    Absent,
    /// Value must contain substring
    Contains { value: String },
}

/// A single predicate against the request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BodyPattern {
    /// Exact body match
    EqualTo { value: String },
    /// Body must contain substring
    Contains { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// JSON path must resolve (and equal `equals` when given)
    JsonPath {
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        equals: Option<serde_json::Value>,
    },
    /// Body must be valid JSON (any structure)
    Json,
    /// Body must be empty
    Empty,
}

impl BodyPattern {
    pub fn json_path(expression: impl Into<String>) -> Self {
        BodyPattern::JsonPath {
            expression: expression.into(),
            equals: None,
        }
    }

    pub fn json_path_equals(expression: impl Into<String>, value: serde_json::Value) -> Self {
        BodyPattern::JsonPath {
            expression: expression.into(),
            equals: Some(value),
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            BodyPattern::Regex { pattern } => {
                regex::Regex::new(pattern).map_err(|e| format!("Invalid body regex: {}", e))?;
            }
            BodyPattern::JsonPath { expression, .. } => json_path::validate(expression)?,
            _ => {}
        }
        Ok(())
    }
}

/// Response definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseDefinition {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Response headers (names are case-insensitive)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Response body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<ResponseBody>,

    /// Latency simulation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DelayConfig>,

    /// Failure simulation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultConfig>,
}

fn default_status() -> u16 {
    200
}

impl Default for ResponseDefinition {
    fn default() -> Self {
        Self {
            status: default_status(),
            headers: BTreeMap::new(),
            body: None,
            delay: None,
            fault: None,
        }
    }
}

impl ResponseDefinition {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// 200 with a JSON body.
    pub fn json(content: serde_json::Value) -> Self {
        Self::default().with_body(ResponseBody::Json { content })
    }

    /// 200 with a text template body.
    pub fn template(content: impl Into<String>) -> Self {
        Self::default().with_body(ResponseBody::Template {
            content: content.into(),
        })
    }

    /// Forward matched requests to `base_url`.
    pub fn proxy(base_url: impl Into<String>) -> Self {
        Self::default().with_body(ResponseBody::Proxy {
            base_url: base_url.into(),
        })
    }

    pub fn with_body(mut self, body: ResponseBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_fixed_delay(mut self, millis: u64) -> Self {
        self.delay = Some(DelayConfig::fixed(millis));
        self
    }

    pub fn with_fault(mut self, fault: FaultConfig) -> Self {
        self.fault = Some(fault);
        self
    }

    /// Validate the response definition.
    pub fn validate(&self, label: &str) -> Result<(), StubError> {
        if self.status < 100 || self.status > 599 {
            return Err(StubError::invalid(
                label,
                format!("Invalid status code: {}", self.status),
            ));
        }
        if let Some(delay) = &self.delay {
            if delay.fixed_ms == 0 && delay.max_ms != 0 && delay.max_ms < delay.min_ms {
                return Err(StubError::invalid(
                    label,
                    format!("delay max_ms {} is below min_ms {}", delay.max_ms, delay.min_ms),
                ));
            }
        }
        if let Some(FaultConfig::Corrupt { probability }) = &self.fault {
            if !(0.0..=1.0).contains(probability) {
                return Err(StubError::invalid(
                    label,
                    format!("corrupt probability {} is outside 0.0..=1.0", probability),
                ));
            }
        }
        if let Some(FaultConfig::Error { status, .. }) = &self.fault {
            if *status < 100 || *status > 599 {
                return Err(StubError::invalid(
                    label,
                    format!("Invalid fault status code: {}", status),
                ));
            }
        }
        if let Some(ResponseBody::Proxy { base_url }) = &self.body {
            if self.fault.is_some() {
                return Err(StubError::invalid(
                    label,
                    "a proxy response cannot also inject a fault",
                ));
            }
            if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
                return Err(StubError::invalid(
                    label,
                    format!("proxy base_url must be an http(s) URL: {}", base_url),
                ));
            }
        }
        Ok(())
    }
}

/// Response body configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Plain text body
    Text { content: String },
    /// JSON body
    Json { content: serde_json::Value },
    /// Base64 encoded binary
    Base64 { content: String },
    /// Load from file (read once, at registration)
    File { path: String },
    /// Text rendered with request data on every response
    Template { content: String },
    /// JSON whose string leaves are rendered with request data
    JsonTemplate { content: serde_json::Value },
    /// Forward the request to an upstream service verbatim
    Proxy { base_url: String },
}

impl ResponseBody {
    /// Get the literal body content as bytes. Templates return their source.
    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        match self {
            ResponseBody::Text { content } | ResponseBody::Template { content } => {
                Ok(content.as_bytes().to_vec())
            }
            ResponseBody::Json { content } | ResponseBody::JsonTemplate { content } => {
                serde_json::to_vec(content).map_err(|e| format!("Invalid JSON body: {}", e))
            }
            ResponseBody::Base64 { content } => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(content)
                    .map_err(|e| format!("Invalid base64: {}", e))
            }
            ResponseBody::File { path } => {
                std::fs::read(path).map_err(|e| format!("Failed to read file {}: {}", path, e))
            }
            ResponseBody::Proxy { .. } => Ok(Vec::new()),
        }
    }

    /// Get content type for this body.
    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            ResponseBody::Text { .. } | ResponseBody::Template { .. } => Some("text/plain"),
            ResponseBody::Json { .. } | ResponseBody::JsonTemplate { .. } => {
                Some("application/json")
            }
            ResponseBody::Base64 { .. } | ResponseBody::File { .. } => {
                Some("application/octet-stream")
            }
            ResponseBody::Proxy { .. } => None,
        }
    }
}

/// Delay/latency simulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DelayConfig {
    /// Fixed delay in milliseconds
    #[serde(default)]
    pub fixed_ms: u64,

    /// Minimum delay for random range (ms)
    #[serde(default)]
    pub min_ms: u64,

    /// Maximum delay for random range (ms)
    #[serde(default)]
    pub max_ms: u64,
}

impl DelayConfig {
    pub fn fixed(millis: u64) -> Self {
        Self {
            fixed_ms: millis,
            min_ms: 0,
            max_ms: 0,
        }
    }

    /// Calculate the actual delay to apply.
    pub fn calculate(&self) -> u64 {
        if self.fixed_ms > 0 {
            return self.fixed_ms;
        }
        if self.max_ms > self.min_ms {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            return rng.gen_range(self.min_ms..=self.max_ms);
        }
        self.min_ms
    }

    /// Largest delay `calculate` can return.
    pub fn upper_bound(&self) -> u64 {
        if self.fixed_ms > 0 {
            self.fixed_ms
        } else {
            self.min_ms.max(self.max_ms)
        }
    }
}

/// Fault injection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FaultConfig {
    /// Close the connection without sending a response
    EmptyResponse,
    /// Return an error response
    Error {
        /// HTTP status code
        status: u16,
        /// Error message
        #[serde(default)]
        message: Option<String>,
    },
    /// Hang for `duration_ms`, then answer 504
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },
    /// Replace the body with garbage
    Corrupt {
        /// Corruption probability (0.0 - 1.0)
        #[serde(default = "default_probability")]
        probability: f64,
    },
}

fn default_probability() -> f64 {
    1.0
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Address the server listens on (port 0 picks a free port)
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Log all matched stubs
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log unmatched requests
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// Timeout for proxied upstream calls (ms)
    #[serde(default = "default_proxy_timeout_ms")]
    pub proxy_timeout_ms: u64,

    /// Longest delay or timeout fault a stub may configure (ms)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log_matches: true,
            log_unmatched: true,
            proxy_timeout_ms: default_proxy_timeout_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_proxy_timeout_ms() -> u64 {
    30_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}
