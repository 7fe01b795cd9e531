//! Response synthesis.
//!
//! Turns a stub's compiled response definition into what the transport should
//! do: write a response, drop the connection, or forward upstream.

use crate::config::{DelayConfig, FaultConfig, ResponseBody, ResponseDefinition};
use crate::error::StubError;
use crate::matcher::MatchRequest;
use crate::template::TemplateEngine;
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use std::time::Duration;
use tracing::debug;

/// A concrete response handed back to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl MockResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Upstream to forward a matched request to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub base_url: String,
}

/// Result of synthesizing a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Synthesized {
    /// Write this response
    Respond(MockResponse),
    /// Drop the connection without writing anything
    CloseConnection,
    /// Forward the request upstream and relay the answer
    Forward(ProxyTarget),
}

/// Body source after compilation.
#[derive(Debug, Clone)]
enum BodySource {
    Empty,
    Literal(Bytes),
    Template(String),
    JsonTemplate(serde_json::Value),
    Proxy(String),
}

/// Compiled form of a [`ResponseDefinition`].
#[derive(Debug, Clone)]
pub struct CompiledResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: BodySource,
    delay: Option<DelayConfig>,
    fault: Option<FaultConfig>,
}

impl CompiledResponse {
    /// Validate and compile a response definition.
    ///
    /// Literal bodies (base64, file) are resolved here, so a bad body is a
    /// registration error rather than a per-request one.
    pub fn compile(definition: &ResponseDefinition, label: &str) -> Result<Self, StubError> {
        definition.validate(label)?;

        let body = match &definition.body {
            None => BodySource::Empty,
            Some(ResponseBody::Template { content }) => BodySource::Template(content.clone()),
            Some(ResponseBody::JsonTemplate { content }) => BodySource::JsonTemplate(content.clone()),
            Some(ResponseBody::Proxy { base_url }) => {
                BodySource::Proxy(base_url.trim_end_matches('/').to_string())
            }
            Some(literal) => BodySource::Literal(Bytes::from(
                literal
                    .to_bytes()
                    .map_err(|reason| StubError::invalid(label, reason))?,
            )),
        };

        // Names are case-insensitive; on a clash the later key in map order wins.
        let mut headers: Vec<(String, String)> = Vec::with_capacity(definition.headers.len() + 1);
        for (name, value) in &definition.headers {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| StubError::invalid(label, format!("Invalid header name {}: {}", name, e)))?;
            HeaderValue::from_str(value)
                .map_err(|e| StubError::invalid(label, format!("Invalid value for header {}: {}", name, e)))?;
            match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
                Some(existing) => *existing = (name.clone(), value.clone()),
                None => headers.push((name.clone(), value.clone())),
            }
        }
        let has_content_type = headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type"));
        if !has_content_type {
            if let Some(content_type) = definition.body.as_ref().and_then(|b| b.content_type()) {
                headers.push(("Content-Type".to_string(), content_type.to_string()));
            }
        }

        Ok(Self {
            status: definition.status,
            headers,
            body,
            delay: definition.delay.clone(),
            fault: definition.fault.clone(),
        })
    }

    /// 404 with an empty body.
    pub fn not_found() -> Self {
        Self {
            status: 404,
            headers: Vec::new(),
            body: BodySource::Empty,
            delay: None,
            fault: None,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self.body, BodySource::Proxy(_))
    }

    /// Longest suspension this response can cause before answering.
    pub fn max_suspension(&self) -> Duration {
        let delay = self.delay.as_ref().map(|d| d.upper_bound()).unwrap_or(0);
        let timeout = match &self.fault {
            Some(FaultConfig::Timeout { duration_ms }) => *duration_ms,
            _ => 0,
        };
        Duration::from_millis(delay.saturating_add(timeout))
    }
}

/// Builds responses from compiled response definitions.
pub struct ResponseSynthesizer {
    templates: TemplateEngine,
}

impl ResponseSynthesizer {
    pub fn new() -> Self {
        Self {
            templates: TemplateEngine::new(),
        }
    }

    /// Produce the outcome for `response` given the request that matched.
    ///
    /// The configured delay is served first, in full, whatever the outcome.
    pub async fn synthesize(&self, response: &CompiledResponse, request: &MatchRequest) -> Synthesized {
        if let Some(delay) = &response.delay {
            let delay_ms = delay.calculate();
            if delay_ms > 0 {
                debug!(delay_ms, "Applying delay");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }

        match &response.fault {
            None => self.build(response, request),
            Some(FaultConfig::EmptyResponse) => Synthesized::CloseConnection,
            Some(FaultConfig::Error { status, message }) => Synthesized::Respond(
                MockResponse::new(*status)
                    .with_header("Content-Type", "text/plain")
                    .with_body(message.clone().unwrap_or_else(|| "Error".to_string())),
            ),
            Some(FaultConfig::Timeout { duration_ms }) => {
                debug!(duration_ms, "Simulating timeout");
                tokio::time::sleep(Duration::from_millis(*duration_ms)).await;
                Synthesized::Respond(
                    MockResponse::new(504)
                        .with_header("Content-Type", "text/plain")
                        .with_body("Gateway Timeout (simulated)"),
                )
            }
            Some(FaultConfig::Corrupt { probability }) => {
                use rand::Rng;
                let should_corrupt = rand::thread_rng().gen::<f64>() < *probability;
                if should_corrupt {
                    Synthesized::Respond(
                        MockResponse::new(response.status)
                            .with_header("Content-Type", "application/octet-stream")
                            .with_body(generate_garbage()),
                    )
                } else {
                    self.build(response, request)
                }
            }
        }
    }

    fn build(&self, response: &CompiledResponse, request: &MatchRequest) -> Synthesized {
        let body = match &response.body {
            BodySource::Proxy(base_url) => {
                return Synthesized::Forward(ProxyTarget {
                    base_url: base_url.clone(),
                })
            }
            BodySource::Empty => Bytes::new(),
            BodySource::Literal(bytes) => bytes.clone(),
            BodySource::Template(template) => Bytes::from(self.templates.render(template, request)),
            BodySource::JsonTemplate(json) => {
                let rendered = self.templates.render_json(json, request);
                Bytes::from(rendered.to_string())
            }
        };

        Synthesized::Respond(MockResponse {
            status: response.status,
            headers: response.headers.clone(),
            body,
        })
    }
}

impl Default for ResponseSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate random garbage data for corruption simulation.
fn generate_garbage() -> Bytes {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(50..200);
    (0..len).map(|_| rng.gen_range(0x20u8..0x7e)).collect::<Vec<u8>>().into()
}
