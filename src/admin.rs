//! Admin API for registering and removing stubs over HTTP.
//!
//! Served under `/__admin/` by the same listener as the stubs.

use crate::config::StubDefinition;
use crate::dispatch::DispatchEngine;
use crate::registry::{StubId, StubMapping};
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};

/// Path prefix reserved for the admin API.
pub const ADMIN_PREFIX: &str = "/__admin";

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

/// Build an HTTP response with the given status and body.
pub fn build_response(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Full::new(body.into()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from("Internal Server Error"))))
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string_pretty(body).unwrap_or_else(|_| "{}".to_string());
    build_response(status, "application/json", json)
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &ErrorBody { error: message })
}

/// Route an admin request. `path` still carries the `/__admin` prefix.
pub fn route(method: &Method, path: &str, body: &[u8], engine: &DispatchEngine) -> Response<Full<Bytes>> {
    let rest = path.strip_prefix(ADMIN_PREFIX).unwrap_or(path);
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    debug!(%method, path, "Admin API request");

    match (method, segments.as_slice()) {
        (&Method::GET, ["mappings"]) => list_mappings(engine),
        (&Method::POST, ["mappings"]) => create_mapping(body, engine),
        (&Method::DELETE, ["mappings", id]) => delete_mapping(id, engine),
        (&Method::POST, ["reset"]) => {
            engine.registry().clear();
            json_response(StatusCode::OK, &serde_json::json!({ "reset": true }))
        }
        (&Method::GET, ["stats"]) => json_response(StatusCode::OK, &engine.stats()),
        _ => error_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

/// GET /__admin/mappings
fn list_mappings(engine: &DispatchEngine) -> Response<Full<Bytes>> {
    let snapshot = engine.registry().find_all_mapped();
    let mappings: Vec<StubMapping<'_>> = snapshot.iter().map(|rule| StubMapping::from(rule.as_ref())).collect();
    let total = mappings.len();
    json_response(
        StatusCode::OK,
        &serde_json::json!({ "mappings": mappings, "total": total }),
    )
}

/// POST /__admin/mappings
fn create_mapping(body: &[u8], engine: &DispatchEngine) -> Response<Full<Bytes>> {
    let definition: StubDefinition = match serde_json::from_slice(body) {
        Ok(d) => d,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("Invalid stub JSON: {e}"))
        }
    };

    match engine.registry().register(definition) {
        Ok(id) => json_response(StatusCode::CREATED, &serde_json::json!({ "id": id })),
        Err(e) => {
            warn!(error = %e, "Rejected stub registration");
            error_response(StatusCode::BAD_REQUEST, &e.to_string())
        }
    }
}

/// DELETE /__admin/mappings/{id}
fn delete_mapping(raw_id: &str, engine: &DispatchEngine) -> Response<Full<Bytes>> {
    let id = match urlencoding::decode(raw_id) {
        Ok(id) => id,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("Invalid stub id: {e}"))
        }
    };
    let removed = engine.registry().remove(&StubId::new(id.into_owned()));
    json_response(StatusCode::OK, &serde_json::json!({ "removed": removed }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalSettings;
    use crate::proxy::HttpUpstream;
    use crate::registry::StubRegistry;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use std::time::Duration;

    fn engine() -> DispatchEngine {
        let upstream = HttpUpstream::new(Duration::from_secs(1)).unwrap();
        DispatchEngine::new(Arc::new(StubRegistry::new()), Arc::new(upstream), GlobalSettings::default())
    }

    async fn json_body(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_create_list_delete() {
        let engine = engine();
        let stub = serde_json::json!({
            "id": "client-123",
            "priority": 10,
            "request": { "method": ["GET"], "url": { "type": "exact", "value": "/client/123" } },
            "response": { "body": { "type": "json", "content": { "orderHistory": 6 } } }
        });

        let created = route(&Method::POST, "/__admin/mappings", stub.to_string().as_bytes(), &engine);
        assert_eq!(created.status(), StatusCode::CREATED);
        assert_eq!(json_body(created).await["id"], "client-123");

        let listed = json_body(route(&Method::GET, "/__admin/mappings", b"", &engine)).await;
        assert_eq!(listed["total"], 1);
        assert_eq!(listed["mappings"][0]["id"], "client-123");
        assert_eq!(listed["mappings"][0]["sequence"], 0);

        let deleted = json_body(route(&Method::DELETE, "/__admin/mappings/client-123", b"", &engine)).await;
        assert_eq!(deleted["removed"], true);
        let again = json_body(route(&Method::DELETE, "/__admin/mappings/client-123", b"", &engine)).await;
        assert_eq!(again["removed"], false);
    }

    #[tokio::test]
    async fn test_delete_decodes_id() {
        let engine = engine();
        engine
            .registry()
            .register(
                StubDefinition::new(Default::default(), crate::config::ResponseDefinition::default())
                    .with_id("client 123/orders"),
            )
            .unwrap();

        let deleted = json_body(route(
            &Method::DELETE,
            "/__admin/mappings/client%20123%2Forders",
            b"",
            &engine,
        ))
        .await;
        assert_eq!(deleted["removed"], true);
        assert!(engine.registry().is_empty());

        let bad = route(&Method::DELETE, "/__admin/mappings/%FF", b"", &engine);
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_invalid_stub_is_bad_request() {
        let engine = engine();
        let stub = serde_json::json!({
            "request": { "url": { "type": "regex", "pattern": "(" } },
            "response": { "status": 200 }
        });
        let response = route(&Method::POST, "/__admin/mappings", stub.to_string().as_bytes(), &engine);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(engine.registry().is_empty());

        let garbage = route(&Method::POST, "/__admin/mappings", b"{not json", &engine);
        assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_reset_and_unknown_route() {
        let engine = engine();
        engine
            .registry()
            .register(StubDefinition::new(
                Default::default(),
                crate::config::ResponseDefinition::default(),
            ))
            .unwrap();

        let reset = route(&Method::POST, "/__admin/reset", b"", &engine);
        assert_eq!(reset.status(), StatusCode::OK);
        assert!(engine.registry().is_empty());

        let unknown = route(&Method::GET, "/__admin/nothing", b"", &engine);
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    }
}
