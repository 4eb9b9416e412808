//! HTTP surface tests over the in-memory harness.

use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use superplane::crypto::{default_token_ttl, signature};
use superplane::model::{Canvas, ExecutionState, SourceType};
use superplane::DomainKind;
use superplane_server::{app, AppState};
use superplane_testing::{connection, reference_for, stage_spec, Harness, OWNER};

// ============================================================================
// Helpers
// ============================================================================

struct Api {
    harness: Harness,
    router: Router,
}

impl Api {
    async fn new() -> Result<Self> {
        let harness = Harness::new().await?;
        let router = app(AppState::new(harness.core.clone(), "http://superplane.test/"));
        Ok(Self { harness, router })
    }

    fn token(&self, user: &str) -> Result<String> {
        Ok(self.harness.core.signer.generate(user, default_token_ttl())?)
    }

    async fn call(&self, request: Request<Body>) -> Result<(StatusCode, Value)> {
        let response = self.router.clone().oneshot(request).await?;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        Ok((status, body))
    }

    /// JSON call authenticated as `user`.
    async fn as_user(&self, user: &str, method: Method, uri: &str, body: Option<Value>) -> Result<(StatusCode, Value)> {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token(user)?))
            .header(header::CONTENT_TYPE, "application/json")
            .body(json_body(body))?;
        self.call(request).await
    }

    async fn webhook(&self, uri: &str, signature_header: Option<(&str, String)>, body: &[u8]) -> Result<StatusCode> {
        let mut request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, body.len());
        if let Some((name, value)) = signature_header {
            request = request.header(name, value);
        }
        let (status, _) = self.call(request.body(Body::from(body.to_vec()))?).await?;
        Ok(status)
    }
}

fn json_body(body: Option<Value>) -> Body {
    match body {
        Some(value) => Body::from(value.to_string()),
        None => Body::empty(),
    }
}

/// A canvas with one event source; returns the source id and its key.
async fn canvas_with_source(api: &Api) -> Result<(Canvas, Uuid, String)> {
    let canvas = api.harness.canvas().await?;
    let created = api
        .harness
        .core
        .service
        .create_event_source(canvas.id, "github")
        .await?;
    Ok((canvas, created.source.id, created.key))
}

// ============================================================================
// Health and ingress
// ============================================================================

#[tokio::test]
async fn health_is_ok() -> Result<()> {
    let api = Api::new().await?;
    let request = Request::builder().uri("/health").body(Body::empty())?;
    let (status, body) = api.call(request).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));
    Ok(())
}

#[tokio::test]
async fn webhook_for_unknown_source_is_not_found() -> Result<()> {
    let api = Api::new().await?;
    let body = br#"{"ref":"main"}"#;

    let uri = format!("/api/v1/sources/{}/webhook", Uuid::new_v4());
    let sig = ("x-signature-256", signature::sign(b"whatever", body));
    assert_eq!(api.webhook(&uri, Some(sig), body).await?, StatusCode::NOT_FOUND);

    let sig = ("x-signature-256", signature::sign(b"whatever", body));
    assert_eq!(
        api.webhook("/api/v1/sources/not-a-uuid/webhook", Some(sig), body).await?,
        StatusCode::NOT_FOUND
    );
    Ok(())
}

#[tokio::test]
async fn webhook_signature_is_required() -> Result<()> {
    let api = Api::new().await?;
    let (_, source_id, key) = canvas_with_source(&api).await?;
    let body = br#"{"ref":"main"}"#;
    let uri = format!("/api/v1/sources/{source_id}/github");

    assert_eq!(api.webhook(&uri, None, body).await?, StatusCode::UNAUTHORIZED);

    let wrong = ("x-hub-signature-256", signature::sign(b"not-the-key", body));
    assert_eq!(api.webhook(&uri, Some(wrong), body).await?, StatusCode::UNAUTHORIZED);

    // Signature from the right key but sent in another provider's header.
    let misplaced = ("x-signature-256", signature::sign(key.as_bytes(), body));
    assert_eq!(api.webhook(&uri, Some(misplaced), body).await?, StatusCode::UNAUTHORIZED);

    assert!(api.harness.store.events().is_empty());
    Ok(())
}

#[tokio::test]
async fn signed_webhook_is_persisted_with_headers() -> Result<()> {
    let api = Api::new().await?;
    let (_, source_id, key) = canvas_with_source(&api).await?;
    let body = br#"{"ref":"refs/heads/main"}"#;

    let sig = ("x-hub-signature-256", format!("sha256={}", signature::sign(key.as_bytes(), body)));
    let uri = format!("/api/v1/sources/{source_id}/github");
    assert_eq!(api.webhook(&uri, Some(sig), body).await?, StatusCode::OK);

    let events = api.harness.store.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].source_id, source_id);
    assert_eq!(events[0].raw, json!({"ref": "refs/heads/main"}));
    assert!(events[0].headers.contains_key("x-hub-signature-256"));
    Ok(())
}

#[tokio::test]
async fn oversized_webhook_is_rejected() -> Result<()> {
    let api = Api::new().await?;
    let (_, source_id, key) = canvas_with_source(&api).await?;
    let body = format!(r#"{{"blob":"{}"}}"#, "x".repeat(64 * 1024));

    let sig = ("x-signature-256", signature::sign(key.as_bytes(), body.as_bytes()));
    let uri = format!("/api/v1/sources/{source_id}/webhook");
    assert_eq!(
        api.webhook(&uri, Some(sig), body.as_bytes()).await?,
        StatusCode::PAYLOAD_TOO_LARGE
    );
    Ok(())
}

#[tokio::test]
async fn malformed_json_body_is_bad_request() -> Result<()> {
    let api = Api::new().await?;
    let (_, source_id, key) = canvas_with_source(&api).await?;
    let body = b"not json";

    let sig = ("x-signature-256", signature::sign(key.as_bytes(), body));
    let uri = format!("/api/v1/sources/{source_id}/webhook");
    assert_eq!(api.webhook(&uri, Some(sig), body).await?, StatusCode::BAD_REQUEST);
    Ok(())
}

// ============================================================================
// Authentication and authorization
// ============================================================================

#[tokio::test]
async fn api_requires_a_session() -> Result<()> {
    let api = Api::new().await?;
    let request = Request::builder().uri("/api/v1/organizations").body(Body::empty())?;
    let (status, body) = api.call(request).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthenticated");

    let request = Request::builder()
        .uri("/api/v1/organizations")
        .header(header::AUTHORIZATION, "Bearer garbage")
        .body(Body::empty())?;
    let (status, _) = api.call(request).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn session_cookie_is_accepted() -> Result<()> {
    let api = Api::new().await?;
    let request = Request::builder()
        .uri("/api/v1/organizations")
        .header(header::COOKIE, format!("auth_token={}", api.token(OWNER)?))
        .body(Body::empty())?;
    let (status, _) = api.call(request).await?;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn outsider_sees_not_found() -> Result<()> {
    let api = Api::new().await?;
    let canvas = api.harness.canvas().await?;
    let stages = format!("/api/v1/canvases/{}/stages", canvas.id);

    let (status, _) = api.as_user(OWNER, Method::GET, &stages, None).await?;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = api.as_user("mallory@example.com", Method::GET, &stages, None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    // Same answer as for a canvas that does not exist.
    let missing = format!("/api/v1/canvases/{}/stages", Uuid::new_v4());
    let (status, _) = api.as_user("mallory@example.com", Method::GET, &missing, None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn canvas_admin_but_not_viewer_creates_stages() -> Result<()> {
    let api = Api::new().await?;
    let canvas = api.harness.canvas().await?;
    api.harness
        .core
        .service
        .add_canvas_member(canvas.id, "viewer@example.com")
        .await?;

    let stages = format!("/api/v1/canvases/{}/stages", canvas.id);
    let (status, _) = api.as_user("viewer@example.com", Method::GET, &stages, None).await?;
    assert_eq!(status, StatusCode::OK);

    let spec = json!({"name": "build", "run_template": {"type": "recording"}});
    let (status, _) = api
        .as_user("viewer@example.com", Method::POST, &stages, Some(spec.clone()))
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(api.harness.core.service.list_stages(canvas.id).await?.is_empty());

    api.harness
        .core
        .service
        .assign_role(DomainKind::Canvas, canvas.id, "viewer@example.com", "canvas_admin")
        .await?;
    let (status, stage) = api
        .as_user("viewer@example.com", Method::POST, &stages, Some(spec))
        .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(stage["name"], "build");
    Ok(())
}

#[tokio::test]
async fn unhyphenated_canvas_ids_get_the_same_checks() -> Result<()> {
    let api = Api::new().await?;
    let canvas = api.harness.canvas().await?;
    api.harness
        .core
        .service
        .add_canvas_member(canvas.id, "viewer@example.com")
        .await?;

    let id = canvas.id.simple();
    let stages = format!("/api/v1/canvases/{id}/stages");
    let spec = json!({"name": "build", "run_template": {"type": "recording"}});
    let (status, _) = api
        .as_user("viewer@example.com", Method::POST, &stages, Some(spec))
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(api.harness.core.service.list_stages(canvas.id).await?.is_empty());

    let secrets = format!("/api/v1/canvases/{id}/secrets");
    let (status, _) = api.as_user("mallory@example.com", Method::GET, &secrets, None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Members still reach the canvas through the short form.
    let (status, _) = api.as_user("viewer@example.com", Method::GET, &stages, None).await?;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

// ============================================================================
// Resources
// ============================================================================

#[tokio::test]
async fn duplicate_organization_name_is_bad_request() -> Result<()> {
    let api = Api::new().await?;
    let body = json!({"name": "acme", "display_name": "Acme"});

    let (status, org) = api
        .as_user(OWNER, Method::POST, "/api/v1/organizations", Some(body.clone()))
        .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(org["name"], "acme");

    let (status, err) = api
        .as_user(OWNER, Method::POST, "/api/v1/organizations", Some(body))
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["message"], "organization name already used");
    Ok(())
}

#[tokio::test]
async fn canvas_routes_take_the_organization_header() -> Result<()> {
    let api = Api::new().await?;
    let (_, org) = api
        .as_user(OWNER, Method::POST, "/api/v1/organizations", Some(json!({"name": "acme"})))
        .await?;
    let org_id = org["id"].as_str().unwrap_or_default().to_string();

    let create = |name: &str| {
        Request::builder()
            .method(Method::POST)
            .uri("/api/v1/canvases")
            .header(header::AUTHORIZATION, format!("Bearer {}", api.token(OWNER).unwrap()))
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-organization-id", org_id.as_str())
            .body(Body::from(json!({"name": name}).to_string()))
            .unwrap()
    };
    let (status, canvas) = api.call(create("delivery")).await?;
    assert_eq!(status, StatusCode::CREATED);

    let describe = Request::builder()
        .uri("/api/v1/canvases/delivery")
        .header(header::AUTHORIZATION, format!("Bearer {}", api.token(OWNER)?))
        .header("x-organization-id", org_id.as_str())
        .body(Body::empty())?;
    let (status, found) = api.call(describe).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found["id"], canvas["id"]);

    // Without the header the route has no domain and is denied.
    let (status, _) = api.as_user(OWNER, Method::GET, "/api/v1/canvases", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn event_source_key_is_returned_once() -> Result<()> {
    let api = Api::new().await?;
    let canvas = api.harness.canvas().await?;
    let uri = format!("/api/v1/canvases/{}/event-sources", canvas.id);

    let (status, created) = api
        .as_user(OWNER, Method::POST, &uri, Some(json!({"name": "github"})))
        .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["key"].as_str().map(str::len), Some(64));
    let id = created["event_source"]["id"].as_str().unwrap_or_default().to_string();
    assert_eq!(
        created["webhook_url"],
        format!("http://superplane.test/api/v1/sources/{id}/webhook")
    );

    let (status, described) = api.as_user(OWNER, Method::GET, &format!("{uri}/github"), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(described.get("key").is_none());
    Ok(())
}

#[tokio::test]
async fn secret_values_are_never_returned() -> Result<()> {
    let api = Api::new().await?;
    let canvas = api.harness.canvas().await?;
    let uri = format!("/api/v1/canvases/{}/secrets", canvas.id);
    let body = json!({"name": "deploy", "data": {"token": "s3cr3t", "user": "ci"}});

    let (status, created) = api.as_user(OWNER, Method::POST, &uri, Some(body)).await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["keys"], json!(["token", "user"]));

    let (status, described) = api.as_user(OWNER, Method::GET, &format!("{uri}/deploy"), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(described["keys"], json!(["token", "user"]));
    assert!(!described.to_string().contains("s3cr3t"));
    Ok(())
}

// ============================================================================
// Execution callbacks
// ============================================================================

#[tokio::test]
async fn runner_finishes_execution_with_its_token() -> Result<()> {
    let api = Api::new().await?;
    let canvas = api.harness.canvas().await?;
    let source = api.harness.source(&canvas, "github").await?;
    let mut spec = stage_spec("build");
    spec.connections.push(connection("github", SourceType::EventSource));
    let stage = api.harness.stage(&canvas, spec).await?;

    api.harness.send(&source, json!({"ref": "main"})).await?;
    api.harness.settle().await?;

    let request = api.harness.executor.last_request().expect("dispatched");
    let finish = |token: &str| {
        Request::builder()
            .method(Method::POST)
            .uri("/api/v1/executions/finish")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({"reference_id": reference_for(&request), "result": "passed"}).to_string(),
            ))
            .unwrap()
    };

    // A session token is not an execution token.
    let (status, _) = api.call(finish(&api.token(OWNER)?)).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, execution) = api.call(finish(&request.execution_token)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(execution["result"], "passed");

    let executions = api.harness.executions(&stage).await?;
    assert_eq!(executions[0].state, ExecutionState::Finished);

    let (status, _) = api.call(finish(&request.execution_token)).await?;
    assert_eq!(status, StatusCode::CONFLICT);
    Ok(())
}

#[tokio::test]
async fn runner_pushes_outputs_before_finishing() -> Result<()> {
    let api = Api::new().await?;
    let canvas = api.harness.canvas().await?;
    let source = api.harness.source(&canvas, "github").await?;
    let mut spec = stage_spec("build");
    spec.connections.push(connection("github", SourceType::EventSource));
    spec.outputs.push(serde_json::from_value(json!({"name": "image", "required": true}))?);
    let stage = api.harness.stage(&canvas, spec).await?;

    api.harness.send(&source, json!({})).await?;
    api.harness.settle().await?;
    let request = api.harness.executor.last_request().expect("dispatched");

    let push = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/outputs")
        .header(header::AUTHORIZATION, format!("Bearer {}", request.execution_token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "execution_id": request.execution_id,
                "outputs": {"image": "app:1.2.3", "undeclared": true}
            })
            .to_string(),
        ))?;
    let (status, execution) = api.call(push).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(execution["outputs"], json!({"image": "app:1.2.3"}));

    let executions = api.harness.executions(&stage).await?;
    assert_eq!(executions[0].outputs.get("image"), Some(&json!("app:1.2.3")));
    Ok(())
}
