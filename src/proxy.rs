//! Upstream forwarding for proxy stubs.

use crate::error::ProxyError;
use crate::matcher::MatchRequest;
use crate::synthesizer::MockResponse;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Headers that describe a single hop and are not relayed.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Something that can answer a request on behalf of an upstream service.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send `request` to `base_url` + the request's path and query and
    /// return the upstream's answer unchanged.
    async fn forward(&self, base_url: &str, request: &MatchRequest) -> Result<MockResponse, ProxyError>;
}

/// [`Upstream`] backed by a pooled `reqwest` client.
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    /// Build a client whose calls give up after `timeout`. Redirects are
    /// relayed to the caller, never followed.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(&self, base_url: &str, request: &MatchRequest) -> Result<MockResponse, ProxyError> {
        let target_url = format!("{}{}", base_url, request.url());
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ProxyError::InvalidMethod(request.method.clone()))?;

        debug!(%method, url = %target_url, "Forwarding request upstream");

        let mut builder = self.client.request(method, &target_url);
        for (name, value) in &request.headers {
            let lower = name.to_lowercase();
            if lower != "host" && lower != "content-length" && !is_hop_by_hop(&lower) {
                builder = builder.header(name, value);
            }
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await.map_err(|source| ProxyError::Request {
            url: target_url.clone(),
            source,
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()) && name.as_str() != "content-length")
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|source| ProxyError::Request { url: target_url, source })?;

        Ok(MockResponse { status, headers, body })
    }
}
