use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, Bytes},
    http::{Request, StatusCode, header},
};
use caption_gate::{
    app,
    config::Config,
    error::{AppError, Result},
    services::{
        captioner::{Captioner, ModelInfo},
        identity::IdTokenVerifier,
    },
    state::AppState,
};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, encode};
use serde_json::{Value, json};
use tower::ServiceExt;

const CLIENT_ID: &str = "test-client.apps.googleusercontent.com";
const IDP_SECRET: &[u8] = b"integration-idp-secret";
const BOUNDARY: &str = "XCAPTIONBOUNDARY";
const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D, b'I', b'H', b'D', b'R'];

#[derive(Default)]
struct StubCaptioner {
    calls: AtomicUsize,
}

#[async_trait]
impl Captioner for StubCaptioner {
    async fn generate(&self, image: Bytes, model: Option<&str>) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if model == Some("broken") {
            return Err(AppError::Generation("model crashed".to_string()));
        }
        Ok(format!("a cat on a mat ({} bytes)", image.len()))
    }

    fn models(&self) -> Vec<ModelInfo> {
        vec![ModelInfo {
            id: "caption_model_epoch_250.pth".to_string(),
            kind: "checkpoint".to_string(),
        }]
    }
}

struct TestContext {
    _dir: tempfile::TempDir,
    app: Router,
    captioner: Arc<StubCaptioner>,
}

impl TestContext {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_development(dir.path().join("history_db.json"), b"integration-session-secret");
        config.google_client_id = Some(CLIENT_ID.to_string());

        let verifier = IdTokenVerifier::with_static_key(
            config.google_client_id.clone(),
            config.google_issuers.clone(),
            DecodingKey::from_secret(IDP_SECRET),
            Algorithm::HS256,
        );
        let captioner = Arc::new(StubCaptioner::default());
        let state = AppState::with_components(&config, verifier, captioner.clone()).unwrap();

        Self {
            _dir: dir,
            app: app::router(state).unwrap(),
            captioner,
        }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Vec<String>, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let cookies = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, cookies, body)
    }
}

fn id_token(sub: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    encode(
        &Header::new(Algorithm::HS256),
        &json!({
            "sub": sub,
            "email": format!("{sub}@example.com"),
            "aud": CLIENT_ID,
            "iss": "accounts.google.com",
            "iat": now,
            "exp": now + 600,
        }),
        &EncodingKey::from_secret(IDP_SECRET),
    )
    .unwrap()
}

fn upload(file: &[u8], model: Option<&str>, bearer: Option<&str>, anon: Option<&str>) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"cat.png\"\r\nContent-Type: image/png\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(file);
    body.extend_from_slice(b"\r\n");
    if let Some(model) = model {
        body.extend_from_slice(
            format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\n{model}\r\n").as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    let builder = Request::post("/api/generate")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"));
    with_identity(builder, bearer, anon).body(Body::from(body)).unwrap()
}

fn json_request(method: &str, uri: &str, body: Value, bearer: Option<&str>, anon: Option<&str>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    with_identity(builder, bearer, anon)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str, bearer: Option<&str>, anon: Option<&str>) -> Request<Body> {
    with_identity(Request::get(uri), bearer, anon).body(Body::empty()).unwrap()
}

fn with_identity(
    mut builder: axum::http::request::Builder,
    bearer: Option<&str>,
    anon: Option<&str>,
) -> axum::http::request::Builder {
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    if let Some(anon) = anon {
        builder = builder.header(header::COOKIE, format!("anon_id={anon}"));
    }
    builder
}

fn anon_cookie_value(cookies: &[String]) -> Option<String> {
    cookies.iter().find_map(|c| {
        let value = c.strip_prefix("anon_id=")?.split(';').next()?;
        (!value.is_empty()).then(|| value.to_string())
    })
}

#[tokio::test]
async fn anonymous_caller_gets_one_free_caption_then_merges_on_sign_in() {
    let ctx = TestContext::new();

    // Step 1: first anonymous generation succeeds and hands out a cookie
    let (status, cookies, body) = ctx.send(upload(PNG, None, None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["caption"], "a cat on a mat (16 bytes)");
    assert_eq!(body["historySaved"], true);
    let anon = anon_cookie_value(&cookies).expect("anon_id cookie issued");
    assert!(cookies[0].contains("HttpOnly"));

    // Step 2: the second one is refused before the captioner runs
    let (status, _, body) = ctx.send(upload(PNG, None, None, Some(&anon))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["error"].as_str().unwrap().contains("sign in"));
    assert_eq!(ctx.captioner.calls.load(Ordering::SeqCst), 1);

    let (status, _, body) = ctx.send(get("/api/history", None, Some(&anon))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["history"].as_array().unwrap().len(), 1);

    // Step 3: sign-in moves the anonymous history and clears the cookie
    let (status, cookies, body) = ctx
        .send(json_request("POST", "/api/auth/google", json!({ "token": id_token("user-1") }), None, Some(&anon)))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["sub"], "user-1");
    assert_eq!(body["user"]["email"], "user-1@example.com");
    assert!(cookies.iter().any(|c| c.starts_with("anon_id=;") || c.starts_with("anon_id=\"\"") || c.contains("Max-Age=0")));
    let token = body["token"].as_str().unwrap().to_string();

    let (status, _, body) = ctx.send(get("/api/history", Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    let history = body["history"].as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["caption"], "a cat on a mat (16 bytes)");

    // Step 4: signed-in users are never quota limited
    for _ in 0..3 {
        let (status, cookies, _) = ctx.send(upload(PNG, Some("caption_model_epoch_250.pth"), Some(&token), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(anon_cookie_value(&cookies).is_none());
    }
    let (_, _, body) = ctx.send(get("/api/history", Some(&token), None)).await;
    let history = body["history"].as_array().unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[0]["model"], "caption_model_epoch_250.pth");
}

#[tokio::test]
async fn sign_in_merges_an_uppercase_anonymous_cookie() {
    let ctx = TestContext::new();

    let (status, cookies, _) = ctx.send(upload(PNG, None, None, None)).await;
    assert_eq!(status, StatusCode::OK);
    let anon = anon_cookie_value(&cookies).expect("anon_id cookie issued").to_uppercase();

    let (status, _, body) = ctx
        .send(json_request("POST", "/api/auth/google", json!({ "token": id_token("user-9") }), None, Some(&anon)))
        .await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap().to_string();

    let (_, _, body) = ctx.send(get("/api/history", Some(&token), None)).await;
    assert_eq!(body["history"].as_array().unwrap().len(), 1);

    // Nothing is left behind under the anonymous key.
    let (status, _, body) = ctx.send(get("/api/history", None, Some(&anon))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["history"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn history_requires_an_identity() {
    let ctx = TestContext::new();

    let (status, _, body) = ctx.send(get("/api/history", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    // A forged token without a cookie is the same as no token at all.
    let (status, _, _) = ctx.send(get("/api/history", Some("forged.token.value"), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn history_append_is_for_signed_in_users_only() {
    let ctx = TestContext::new();
    let item = json!({ "caption": "sunset over a lake", "imageUrl": "https://cdn.example.com/a.jpg" });

    let (status, _, _) = ctx.send(json_request("POST", "/api/history", item.clone(), None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, _, body) = ctx
        .send(json_request("POST", "/api/auth/google", json!({ "token": id_token("user-2") }), None, None))
        .await;
    let token = body["token"].as_str().unwrap().to_string();

    let (status, _, body) = ctx.send(json_request("POST", "/api/history", item, Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    let (status, _, _) = ctx
        .send(json_request("POST", "/api/history", json!({ "caption": "x", "arbitrary": true }), Some(&token), None))
        .await;
    assert!(status.is_client_error());

    let (_, _, body) = ctx.send(get("/api/history", Some(&token), None)).await;
    let history = body["history"].as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["imageUrl"], "https://cdn.example.com/a.jpg");
}

#[tokio::test]
async fn invalid_sign_in_is_rejected() {
    let ctx = TestContext::new();
    let (status, _, body) = ctx
        .send(json_request("POST", "/api/auth/google", json!({ "token": "not-a-google-token" }), None, None))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Sign-in failed");
}

#[tokio::test]
async fn rejected_uploads_do_not_consume_the_free_caption() {
    let ctx = TestContext::new();

    let (status, cookies, _) = ctx.send(upload(b"plain text, not an image", None, None, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(anon_cookie_value(&cookies).is_none());

    let (status, cookies, _) = ctx.send(upload(PNG, Some("broken"), None, None)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(anon_cookie_value(&cookies).is_none());

    let (status, _, _) = ctx.send(upload(PNG, None, None, None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn generate_url_rejects_private_targets() {
    let ctx = TestContext::new();
    let (status, _, _) = ctx
        .send(json_request(
            "POST",
            "/api/generate_url",
            json!({ "image_url": "http://169.254.169.254/latest/meta-data" }),
            None,
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(ctx.captioner.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn models_are_listed_and_selectable() {
    let ctx = TestContext::new();

    let (status, _, body) = ctx.send(get("/api/models", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["models"][0]["id"], "caption_model_epoch_250.pth");
    assert_eq!(body["models"][0]["type"], "checkpoint");

    let (status, _, body) = ctx
        .send(json_request("POST", "/api/models/select", json!({ "model": "caption_model_epoch_250.pth" }), None, None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["selected"], "caption_model_epoch_250.pth");

    let (status, _, _) = ctx
        .send(json_request("POST", "/api/models/select", json!({ "model": "missing.pth" }), None, None))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
