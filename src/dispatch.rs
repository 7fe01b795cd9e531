//! Request dispatch.
//!
//! Drives one request through resolution and synthesis:
//! received → resolving → synthesizing | proxying | fallback → completed.

use crate::config::GlobalSettings;
use crate::error::StubError;
use crate::matcher::MatchRequest;
use crate::proxy::Upstream;
use crate::registry::StubRegistry;
use crate::synthesizer::{CompiledResponse, MockResponse, ResponseSynthesizer, Synthesized};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the transport should do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Write this response
    Response(MockResponse),
    /// Drop the connection without a response (injected fault)
    CloseConnection,
}

impl Outcome {
    /// The response, if one is to be written.
    pub fn response(&self) -> Option<&MockResponse> {
        match self {
            Outcome::Response(response) => Some(response),
            Outcome::CloseConnection => None,
        }
    }
}

/// Dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub requests_total: u64,
    pub requests_matched: u64,
    pub requests_unmatched: u64,
    pub faults_injected: u64,
    pub proxy_failures: u64,
}

/// Resolves requests against a registry and produces their outcome.
pub struct DispatchEngine {
    registry: Arc<StubRegistry>,
    synthesizer: ResponseSynthesizer,
    upstream: Arc<dyn Upstream>,
    fallback: CompiledResponse,
    settings: GlobalSettings,
    requests_total: AtomicU64,
    requests_matched: AtomicU64,
    requests_unmatched: AtomicU64,
    faults_injected: AtomicU64,
    proxy_failures: AtomicU64,
}

impl DispatchEngine {
    /// Create an engine answering unmatched requests with 404 and no body.
    pub fn new(registry: Arc<StubRegistry>, upstream: Arc<dyn Upstream>, settings: GlobalSettings) -> Self {
        Self {
            registry,
            synthesizer: ResponseSynthesizer::new(),
            upstream,
            fallback: CompiledResponse::not_found(),
            settings,
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
            faults_injected: AtomicU64::new(0),
            proxy_failures: AtomicU64::new(0),
        }
    }

    /// Answer unmatched requests with `fallback` instead of a bare 404.
    pub fn with_fallback(mut self, fallback: &crate::config::ResponseDefinition) -> Result<Self, StubError> {
        let compiled = CompiledResponse::compile(fallback, "default_response")?;
        if compiled.is_proxy() {
            return Err(StubError::invalid(
                "default_response",
                "the fallback response cannot proxy",
            ));
        }
        self.fallback = compiled;
        Ok(self)
    }

    pub fn registry(&self) -> &Arc<StubRegistry> {
        &self.registry
    }

    /// Run one request to completion.
    pub async fn dispatch(&self, request: &MatchRequest) -> Outcome {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        debug!(method = %request.method, url = %request.url(), "Resolving request");

        let outcome = match self.registry.resolve(request) {
            Some(rule) => {
                self.requests_matched.fetch_add(1, Ordering::Relaxed);
                if self.settings.log_matches {
                    info!(
                        stub_id = %rule.id(),
                        method = %request.method,
                        url = %request.url(),
                        "Request matched stub"
                    );
                }

                debug!(stub_id = %rule.id(), "Synthesizing response");
                match self.synthesizer.synthesize(rule.response(), request).await {
                    Synthesized::Respond(response) => Outcome::Response(response),
                    Synthesized::CloseConnection => {
                        self.faults_injected.fetch_add(1, Ordering::Relaxed);
                        info!(
                            stub_id = %rule.id(),
                            fault_injected = true,
                            "Closing connection without response"
                        );
                        Outcome::CloseConnection
                    }
                    Synthesized::Forward(target) => {
                        debug!(stub_id = %rule.id(), upstream = %target.base_url, "Proxying request");
                        Outcome::Response(self.proxy(&target.base_url, request).await)
                    }
                }
            }
            None => {
                self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
                if self.settings.log_unmatched {
                    warn!(
                        method = %request.method,
                        url = %request.url(),
                        "No matching stub found"
                    );
                }
                match self.synthesizer.synthesize(&self.fallback, request).await {
                    Synthesized::Respond(response) => Outcome::Response(response),
                    Synthesized::CloseConnection => {
                        self.faults_injected.fetch_add(1, Ordering::Relaxed);
                        Outcome::CloseConnection
                    }
                    // Rejected by `with_fallback`
                    Synthesized::Forward(_) => Outcome::Response(MockResponse::new(404)),
                }
            }
        };

        debug!(
            status = outcome.response().map(|r| r.status),
            "Request completed"
        );
        outcome
    }

    async fn proxy(&self, base_url: &str, request: &MatchRequest) -> MockResponse {
        match self.upstream.forward(base_url, request).await {
            Ok(response) => response,
            Err(e) => {
                self.proxy_failures.fetch_add(1, Ordering::Relaxed);
                warn!(upstream = %base_url, error = %e, "Upstream proxy call failed");
                MockResponse::new(502)
                    .with_header("Content-Type", "text/plain")
                    .with_body(format!("Bad Gateway: {}", e))
            }
        }
    }

    /// Snapshot of the dispatch counters.
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_matched: self.requests_matched.load(Ordering::Relaxed),
            requests_unmatched: self.requests_unmatched.load(Ordering::Relaxed),
            faults_injected: self.faults_injected.load(Ordering::Relaxed),
            proxy_failures: self.proxy_failures.load(Ordering::Relaxed),
        }
    }
}
