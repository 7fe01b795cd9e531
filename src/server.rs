//! HTTP transport for the stub engine.
//!
//! One tokio task per connection; each request body is collected, handed to
//! the [`DispatchEngine`] as a [`MatchRequest`] and the outcome written back.
//! A close-connection fault is reported to hyper as a service error, which
//! makes it drop the connection without writing a response.

use crate::admin::{self, ADMIN_PREFIX};
use crate::config::MockServerConfig;
use crate::dispatch::{DispatchEngine, Outcome};
use crate::error::FaultInjected;
use crate::matcher::MatchRequest;
use crate::proxy::{HttpUpstream, Upstream};
use crate::registry::StubRegistry;
use crate::synthesizer::MockResponse;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// A running stub server with its own registry.
pub struct MockServer {
    addr: SocketAddr,
    engine: Arc<DispatchEngine>,
    shutdown: Option<oneshot::Sender<()>>,
    accept_loop: Option<JoinHandle<()>>,
}

impl MockServer {
    /// Bind `config.settings.listen`, register the configured stubs and
    /// start serving.
    pub async fn start(config: MockServerConfig) -> anyhow::Result<Self> {
        let upstream = HttpUpstream::new(Duration::from_millis(config.settings.proxy_timeout_ms))?;
        Self::start_with_upstream(config, Arc::new(upstream)).await
    }

    /// Like [`MockServer::start`], forwarding proxy stubs through `upstream`.
    pub async fn start_with_upstream(
        config: MockServerConfig,
        upstream: Arc<dyn Upstream>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let registry = Arc::new(StubRegistry::with_max_delay(Duration::from_millis(
            config.settings.max_delay_ms,
        )));
        for stub in config.stubs {
            registry.register(stub)?;
        }

        let mut engine = DispatchEngine::new(Arc::clone(&registry), upstream, config.settings.clone());
        if let Some(fallback) = &config.default_response {
            engine = engine.with_fallback(fallback)?;
        }
        let engine = Arc::new(engine);

        let listener = TcpListener::bind(config.settings.listen.as_str()).await?;
        let addr = listener.local_addr()?;
        info!(address = %addr, stubs = registry.len(), "Stub server listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let accept_loop = tokio::spawn(accept_loop(listener, Arc::clone(&engine), shutdown_rx));

        Ok(Self {
            addr,
            engine,
            shutdown: Some(shutdown_tx),
            accept_loop: Some(accept_loop),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `http://host:port`, without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn registry(&self) -> &Arc<StubRegistry> {
        self.engine.registry()
    }

    pub fn engine(&self) -> &Arc<DispatchEngine> {
        &self.engine
    }

    /// Stop accepting connections and clear the registry.
    pub async fn stop(mut self) {
        self.signal_shutdown();
        if let Some(handle) = self.accept_loop.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Accept loop ended abnormally");
            }
        }
        self.engine.registry().clear();
        info!(address = %self.addr, "Stub server stopped");
    }

    fn signal_shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

async fn accept_loop(listener: TcpListener, engine: Arc<DispatchEngine>, mut shutdown: oneshot::Receiver<()>) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let engine = Arc::clone(&engine);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let engine = Arc::clone(&engine);
                async move { handle_request(req, engine).await }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(peer = %peer, error = %e, "Connection ended");
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    engine: Arc<DispatchEngine>,
) -> Result<Response<Full<Bytes>>, FaultInjected> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Ok(admin::build_response(
                StatusCode::BAD_REQUEST,
                "text/plain",
                format!("Failed to read request body: {e}"),
            ))
        }
    };

    let path = parts.uri.path();
    if path == ADMIN_PREFIX || path.starts_with("/__admin/") {
        return Ok(admin::route(&parts.method, path, &body, &engine));
    }

    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let request = MatchRequest {
        method: parts.method.as_str().to_string(),
        path: path.to_string(),
        query: parts.uri.query().map(str::to_string),
        headers,
        body,
    };

    match engine.dispatch(&request).await {
        Outcome::Response(response) => Ok(into_http(response)),
        Outcome::CloseConnection => Err(FaultInjected),
    }
}

fn into_http(response: MockResponse) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(response.status);
    for (name, value) in &response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(Full::new(response.body)).unwrap_or_else(|e| {
        error!(error = %e, "Stub produced an unrepresentable response");
        let mut fallback = Response::new(Full::new(Bytes::from("Internal Server Error")));
        *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        fallback
    })
}
