//! Template engine for dynamic responses.
//!
//! Uses Handlebars with WireMock-style helpers. Rendering never fails: a
//! template that does not render as a whole is rendered again one
//! `{{...}}` directive at a time, and any directive that still fails is
//! copied to the output as literal text.

use crate::json_path;
use crate::matcher::MatchRequest;
use handlebars::{Handlebars, RenderErrorReason};
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;

/// Template engine for rendering dynamic responses.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

/// Data visible to templates, under the `request` key.
#[derive(Debug, Serialize)]
pub struct TemplateContext {
    pub request: RequestView,
}

/// Request fields exposed to templates.
#[derive(Debug, Serialize)]
pub struct RequestView {
    /// Request method
    pub method: String,
    /// Path and query
    pub url: String,
    /// Path only
    pub path: String,
    /// Query parameters
    pub query: HashMap<String, String>,
    /// Request headers (lower-cased names)
    pub headers: HashMap<String, String>,
    /// Request body as text (empty if not UTF-8)
    pub body: String,
}

impl TemplateContext {
    pub fn from_request(request: &MatchRequest) -> Self {
        let headers = request
            .headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .collect();
        Self {
            request: RequestView {
                method: request.method.clone(),
                url: request.url(),
                path: request.path.clone(),
                query: request.query_params(),
                headers,
                body: request.body_text().unwrap_or_default().to_string(),
            },
        }
    }
}

impl TemplateEngine {
    /// Create a new template engine.
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper("jsonPath", Box::new(json_path_helper));
        handlebars.register_helper("pickRandom", Box::new(pick_random_helper));
        handlebars.register_helper("randomInt", Box::new(random_int_helper));
        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));

        // Response bodies are not HTML
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }

    /// Render a template string against the request.
    pub fn render(&self, template: &str, request: &MatchRequest) -> String {
        let ctx = TemplateContext::from_request(request);
        self.render_with(template, &ctx)
    }

    /// Render every string leaf of a JSON value against the request.
    pub fn render_json(&self, json: &serde_json::Value, request: &MatchRequest) -> serde_json::Value {
        let ctx = TemplateContext::from_request(request);
        self.render_json_value(json, &ctx)
    }

    fn render_with(&self, template: &str, ctx: &TemplateContext) -> String {
        if !template.contains("{{") {
            return template.to_string();
        }
        match self.handlebars.render_template(template, ctx) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(error = %e, "Template failed to render, falling back to per-directive rendering");
                self.render_by_directive(template, ctx)
            }
        }
    }

    fn render_by_directive(&self, template: &str, ctx: &TemplateContext) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let tail = &rest[start..];
            let Some(end) = tail.find("}}") else {
                out.push_str(tail);
                return out;
            };
            let directive = &tail[..end + 2];
            match self.handlebars.render_template(directive, ctx) {
                Ok(rendered) => out.push_str(&rendered),
                Err(e) => {
                    warn!(directive, error = %e, "Template directive left unresolved");
                    out.push_str(directive);
                }
            }
            rest = &tail[end + 2..];
        }

        out.push_str(rest);
        out
    }

    fn render_json_value(&self, value: &serde_json::Value, ctx: &TemplateContext) -> serde_json::Value {
        match value {
            serde_json::Value::String(s) => serde_json::Value::String(self.render_with(s, ctx)),
            serde_json::Value::Array(arr) => serde_json::Value::Array(
                arr.iter().map(|v| self.render_json_value(v, ctx)).collect(),
            ),
            serde_json::Value::Object(obj) => {
                let mut rendered = serde_json::Map::new();
                for (k, v) in obj {
                    rendered.insert(k.clone(), self.render_json_value(v, ctx));
                }
                serde_json::Value::Object(rendered)
            }
            _ => value.clone(),
        }
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn param_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        other => json_path::to_text(other),
    }
}

// Custom Handlebars helpers

/// `{{jsonPath request.body '$.field'}}`; unresolved paths render as "".
fn json_path_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let source = h
        .param(0)
        .ok_or(RenderErrorReason::ParamNotFoundForIndex("jsonPath", 0))?
        .value();
    let expression = h
        .param(1)
        .and_then(|v| v.value().as_str())
        .ok_or(RenderErrorReason::ParamNotFoundForIndex("jsonPath", 1))?;

    let found = match source {
        serde_json::Value::String(text) => json_path::select(text.as_bytes(), expression),
        other => json_path::first(other, expression),
    };

    match found {
        Some(value) => out.write(&json_path::to_text(&value))?,
        None => warn!(expression, "jsonPath directive did not resolve, substituting empty text"),
    }
    Ok(())
}

/// `{{pickRandom 'a' 'b' 'c'}}`: one alternative, uniformly at random.
fn pick_random_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::seq::SliceRandom;

    let choice = {
        let mut rng = rand::thread_rng();
        h.params()
            .choose(&mut rng)
            .map(|p| param_text(p.value()))
            .ok_or(RenderErrorReason::ParamNotFoundForIndex("pickRandom", 0))?
    };
    out.write(&choice)?;
    Ok(())
}

fn random_int_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;

    let min = h.param(0).and_then(|v| v.value().as_i64()).unwrap_or(0);
    let max = h.param(1).and_then(|v| v.value().as_i64()).unwrap_or(100);

    let value = if max > min {
        rand::thread_rng().gen_range(min..=max)
    } else {
        min
    };
    out.write(&value.to_string())?;
    Ok(())
}

fn uuid_helper(
    _: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    out.write(&uuid::Uuid::new_v4().to_string())?;
    Ok(())
}

fn now_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use chrono::Utc;

    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");

    out.write(&Utc::now().format(format).to_string())?;
    Ok(())
}

fn default_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).map(|v| param_text(v.value())).unwrap_or_default();
    let default = h.param(1).and_then(|v| v.value().as_str()).unwrap_or("");

    if value.is_empty() {
        out.write(default)?;
    } else {
        out.write(&value)?;
    }
    Ok(())
}

fn upper_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_lowercase())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn student_request() -> MatchRequest {
        MatchRequest::post("/nspk/technikum/student/add")
            .with_header("Content-Type", "application/json")
            .with_body(r#"{"id":"42","name":"Elena","secondName":"Orlova","role":"Student"}"#)
    }

    #[test]
    fn test_json_path_extracts_request_field() {
        let engine = TemplateEngine::new();
        let result = engine.render(
            r#"{{jsonPath request.body "$.secondName"}} added successfully"#,
            &student_request(),
        );
        assert_eq!(result, "Orlova added successfully");
    }

    #[test]
    fn test_json_path_unresolved_is_empty() {
        let engine = TemplateEngine::new();
        let result = engine.render(
            r#"[{{jsonPath request.body "$.middleName"}}] added"#,
            &student_request(),
        );
        assert_eq!(result, "[] added");

        let not_json = MatchRequest::post("/").with_body("plain text");
        let result = engine.render(r#"<{{jsonPath request.body "$.a"}}>"#, &not_json);
        assert_eq!(result, "<>");
    }

    #[test]
    fn test_missing_variable_renders_empty() {
        let engine = TemplateEngine::new();
        let result = engine.render("x{{request.nope}}y", &MatchRequest::get("/"));
        assert_eq!(result, "xy");
    }

    #[test]
    fn test_pick_random_stays_within_alternatives() {
        let engine = TemplateEngine::new();
        let request = MatchRequest::get("/nspk/technikum/diceroller");
        let faces: HashSet<&str> = ["1", "2", "3", "4", "5", "6"].into_iter().collect();

        let mut seen = HashSet::new();
        for _ in 0..600 {
            let roll = engine.render(r#"{{pickRandom "1" "2" "3" "4" "5" "6"}}"#, &request);
            assert!(faces.contains(roll.as_str()), "unexpected roll {roll}");
            seen.insert(roll);
        }
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn test_pick_random_without_alternatives_passes_through() {
        let engine = TemplateEngine::new();
        let result = engine.render("roll: {{pickRandom}}", &MatchRequest::get("/"));
        assert_eq!(result, "roll: {{pickRandom}}");
    }

    #[test]
    fn test_unknown_helper_passes_through() {
        let engine = TemplateEngine::new();
        let result = engine.render(
            r#"{{request.method}} {{noSuchHelper "x"}} {{request.path}}"#,
            &MatchRequest::get("/hello"),
        );
        assert_eq!(result, r#"GET {{noSuchHelper "x"}} /hello"#);
    }

    #[test]
    fn test_unterminated_directive_passes_through() {
        let engine = TemplateEngine::new();
        let result = engine.render("value: {{request.path", &MatchRequest::get("/hello"));
        assert_eq!(result, "value: {{request.path");
    }

    #[test]
    fn test_request_fields() {
        let engine = TemplateEngine::new();
        let request = MatchRequest::get("/list?page=2").with_header("User-Agent", "test-client");
        let result = engine.render(
            "{{request.method}} {{request.url}} page={{request.query.page}} ua={{request.headers.user-agent}}",
            &request,
        );
        assert_eq!(result, "GET /list?page=2 page=2 ua=test-client");
    }

    #[test]
    fn test_default_and_case_helpers() {
        let engine = TemplateEngine::new();
        let result = engine.render(
            r#"{{default request.query.missing "fallback"}} {{upper "ivan"}} {{lower "IVAN"}}"#,
            &MatchRequest::get("/"),
        );
        assert_eq!(result, "fallback IVAN ivan");
    }

    #[test]
    fn test_uuid_helper() {
        let engine = TemplateEngine::new();
        let result = engine.render("ID: {{uuid}}", &MatchRequest::get("/"));
        let id = result.strip_prefix("ID: ").unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());
    }

    #[test]
    fn test_render_json() {
        let engine = TemplateEngine::new();
        let json = serde_json::json!({
            "surname": "{{jsonPath request.body \"$.secondName\"}}",
            "greeting": ["Hello {{jsonPath request.body \"$.name\"}}"],
            "static": "no template",
            "count": 3
        });

        let result = engine.render_json(&json, &student_request());

        assert_eq!(result["surname"], "Orlova");
        assert_eq!(result["greeting"][0], "Hello Elena");
        assert_eq!(result["static"], "no template");
        assert_eq!(result["count"], 3);
    }
}
