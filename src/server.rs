//!
//! supportline HTTP server
//! -----------------------
//! Axum routes for the support chat: sign-in flows, the OAuth code callback, resource
//! creation for the signed-in identity, and the streamed answer proxy.
//!
//! Responsibilities:
//! - Read the session cookie once per request into a `RequestContext`.
//! - Delegate sign-in and code exchange to the controllers; turn outcomes into 303
//!   redirects plus `Set-Cookie`, or `{ "message" }` bodies on failure.
//! - Create conversations and messages owned by the current identity.
//! - Proxy the answer stream chunk by chunk.

use std::sync::Arc;

use anyhow::Context;
use axum::body::Body;
use axum::extract::{Form, Path, Query, State};
use axum::http::header::{CONTENT_TYPE, LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::answer::{AnswerClient, AnswerRequest};
use crate::config::{secure_origin, DirectoryBackend, IdentityBackend, ServiceConfig};
use crate::directory::{MemoryDirectory, NewResource, ResourceDirectory, ResourceKind, RestDirectory};
use crate::error::{AppError, AppResult};
use crate::exchange::{CallbackParams, SessionExchange};
use crate::identity::{
    HttpIdentityGateway, Identity, IdentityGateway, LocalIdentityGateway, Registration, RequestContext, Session,
};
use crate::migration::{MigrationEngine, OwnershipMigrator};
use crate::signin::{CredentialSignIn, FailureMessage, LoginForm, SignInFailure};

pub const SESSION_COOKIE: &str = "supportline_session";
/// Holds the PKCE verifier between `/auth/oauth` and the callback; only sent to the callback.
pub const PKCE_COOKIE: &str = "supportline_pkce";
const PKCE_COOKIE_MAX_AGE_SECS: u64 = 600;

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<dyn IdentityGateway>,
    pub directory: Arc<dyn ResourceDirectory>,
    pub exchange: Arc<SessionExchange>,
    pub signin: Arc<CredentialSignIn>,
    pub answers: Arc<AnswerClient>,
    pub secure_cookies: bool,
}

impl AppState {
    pub fn new(
        gateway: Arc<dyn IdentityGateway>,
        directory: Arc<dyn ResourceDirectory>,
        answers: AnswerClient,
        public_url: &str,
    ) -> Self {
        let migrator: Arc<dyn OwnershipMigrator> = Arc::new(MigrationEngine::new(directory.clone()));
        Self {
            exchange: Arc::new(SessionExchange::new(gateway.clone(), migrator.clone())),
            signin: Arc::new(CredentialSignIn::new(gateway.clone(), migrator, public_url)),
            gateway,
            directory,
            answers: Arc::new(answers),
            secure_cookies: secure_origin(public_url),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> AppResult<Self> {
        let client = config.http_client()?;
        let gateway: Arc<dyn IdentityGateway> = match &config.identity {
            IdentityBackend::Local => Arc::new(LocalIdentityGateway::default()),
            IdentityBackend::Remote { url, api_key } => Arc::new(HttpIdentityGateway::new(url, api_key, client.clone())?),
        };
        let directory: Arc<dyn ResourceDirectory> = match &config.directory {
            DirectoryBackend::Memory => Arc::new(MemoryDirectory::new()),
            DirectoryBackend::Rest { url, api_key } => Arc::new(RestDirectory::new(url, api_key, client)?),
        };
        let answers = AnswerClient::new(&config.generation_url, config.streaming_client()?)?;
        Ok(Self::new(gateway, directory, answers, &config.public_url))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "supportline ok" }))
        .route("/auth/callback", get(auth_callback))
        .route("/auth/oauth", get(oauth_start))
        .route("/login", post(login))
        .route("/login/anonymous", post(login_anonymous))
        .route("/signup", post(signup))
        .route("/logout", post(logout))
        .route("/me", get(me))
        .route("/conversations", post(create_conversation))
        .route("/conversations/{id}/messages", post(create_message))
        .route("/api/answer", post(answer))
        .with_state(state)
}

/// Start the HTTP server with the given configuration and serve until shutdown.
pub async fn run(config: ServiceConfig) -> anyhow::Result<()> {
    info!(
        target: "startup",
        local_identity = matches!(config.identity, IdentityBackend::Local),
        memory_directory = matches!(config.directory, DirectoryBackend::Memory),
        generation_url = %config.generation_url,
        "building application state"
    );
    let state = AppState::from_config(&config).context("While building application state from configuration")?;
    let app = router(state);

    let addr = config.bind_addr();
    info!(target: "startup", "Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", addr))?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie = headers.get("cookie").or_else(|| headers.get("Cookie"))?;
    let s = cookie.to_str().ok()?;
    for part in s.split(';') {
        let p = part.trim();
        if let Some(eq) = p.find('=') {
            let (k, v) = p.split_at(eq);
            if k == name { return Some(v[1..].to_string()); }
        }
    }
    None
}

fn request_context(headers: &HeaderMap) -> RequestContext {
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    RequestContext::new(parse_cookie(headers, SESSION_COOKIE))
        .with_request_id(request_id)
        .with_code_verifier(parse_cookie(headers, PKCE_COOKIE))
}

fn set_session_cookie(token: &str, secure: bool) -> Option<HeaderValue> {
    let secure = if secure { "; Secure" } else { "" };
    HeaderValue::from_str(&format!("{}={}; HttpOnly; SameSite=Lax; Path=/{}", SESSION_COOKIE, token, secure)).ok()
}

fn clear_session_cookie(secure: bool) -> HeaderValue {
    let v = if secure {
        "supportline_session=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; SameSite=Lax; Path=/; Secure"
    } else {
        "supportline_session=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; SameSite=Lax; Path=/"
    };
    HeaderValue::from_static(v)
}

fn set_pkce_cookie(verifier: &str, secure: bool) -> Option<HeaderValue> {
    let secure = if secure { "; Secure" } else { "" };
    HeaderValue::from_str(&format!(
        "{}={}; HttpOnly; SameSite=Lax; Path=/auth/callback; Max-Age={}{}",
        PKCE_COOKIE, verifier, PKCE_COOKIE_MAX_AGE_SECS, secure
    ))
    .ok()
}

fn clear_pkce_cookie(secure: bool) -> HeaderValue {
    let v = if secure {
        "supportline_pkce=deleted; Max-Age=0; HttpOnly; SameSite=Lax; Path=/auth/callback; Secure"
    } else {
        "supportline_pkce=deleted; Max-Age=0; HttpOnly; SameSite=Lax; Path=/auth/callback"
    };
    HeaderValue::from_static(v)
}

fn redirect(location: &str, cookies: Vec<HeaderValue>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(LOCATION, HeaderValue::from_str(location).unwrap_or_else(|_| HeaderValue::from_static("/")));
    for c in cookies {
        headers.append(SET_COOKIE, c);
    }
    (StatusCode::SEE_OTHER, headers).into_response()
}

fn session_cookie_for(state: &AppState, session: &Session) -> Option<HeaderValue> {
    let cookie = set_session_cookie(&session.token, state.secure_cookies);
    if cookie.is_none() {
        error!(target: "auth", identity = %session.identity.id, "session token is not a valid cookie value");
    }
    cookie
}

fn redirect_with_session(state: &AppState, location: &str, session: &Session) -> Response {
    redirect(location, session_cookie_for(state, session).into_iter().collect())
}

fn status_of(err: &AppError) -> StatusCode {
    StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn failure(err: &AppError) -> Response {
    (status_of(err), Json(FailureMessage { message: err.public_message() })).into_response()
}

fn sign_in_failure(f: SignInFailure) -> Response {
    (status_of(&f.error), Json(f.message)).into_response()
}

async fn current_identity(state: &AppState, ctx: &RequestContext) -> AppResult<Identity> {
    state.gateway.current_identity(ctx.credential()).await?.ok_or(AppError::NotSignedIn)
}

async fn auth_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Response {
    let ctx = request_context(&headers);
    let outcome = state.exchange.handle(&ctx, params).await;
    if let Some(err) = &outcome.error {
        info!(target: "auth", request_id = ?ctx.request_id, code = err.code_str(), "callback failed");
    }
    let mut cookies = Vec::new();
    match &outcome.session {
        Some(session) => cookies.extend(session_cookie_for(&state, session)),
        None if outcome.clear_credential => cookies.push(clear_session_cookie(state.secure_cookies)),
        None => {}
    }
    // the verifier is single-use whatever the outcome
    if ctx.code_verifier().is_some() {
        cookies.push(clear_pkce_cookie(state.secure_cookies));
    }
    redirect(&outcome.redirect, cookies)
}

#[derive(Debug, Deserialize)]
struct OAuthParams {
    provider: String,
    #[serde(default)]
    next: Option<String>,
}

async fn oauth_start(State(state): State<AppState>, Query(params): Query<OAuthParams>) -> Response {
    match state.signin.oauth_start(&params.provider, params.next.as_deref()) {
        Ok(start) => match set_pkce_cookie(&start.code_verifier, state.secure_cookies) {
            Some(cookie) => redirect(&start.url, vec![cookie]),
            None => {
                let e = AppError::transport("PKCE verifier is not a valid cookie value");
                error!(target: "auth", provider = %params.provider, "{}", e);
                failure(&e)
            }
        },
        Err(e) => {
            warn!(target: "auth", provider = %params.provider, error = %e, "oauth start failed");
            failure(&e)
        }
    }
}

async fn login(State(state): State<AppState>, headers: HeaderMap, Form(form): Form<LoginForm>) -> Response {
    let ctx = request_context(&headers);
    match state.signin.password_sign_in(&ctx, &form.credentials(), form.path.as_deref()).await {
        Ok(out) => redirect_with_session(&state, &out.redirect, &out.session),
        Err(f) => sign_in_failure(f),
    }
}

async fn login_anonymous(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let ctx = request_context(&headers);
    match state.signin.anonymous_sign_in(&ctx).await {
        Ok(out) => redirect_with_session(&state, &out.redirect, &out.session),
        Err(f) => sign_in_failure(f),
    }
}

async fn signup(State(state): State<AppState>, headers: HeaderMap, Form(reg): Form<Registration>) -> Response {
    let ctx = request_context(&headers);
    match state.signin.sign_up(&ctx, &reg).await {
        Ok(out) => redirect_with_session(&state, &out.redirect, &out.session),
        Err(f) => sign_in_failure(f),
    }
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let ctx = request_context(&headers);
    match state.signin.sign_out(&ctx).await {
        Ok(to) => redirect(&to, vec![clear_session_cookie(state.secure_cookies)]),
        Err(f) => sign_in_failure(f),
    }
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let ctx = request_context(&headers);
    match current_identity(&state, &ctx).await {
        Ok(identity) => Json(identity).into_response(),
        Err(e) => failure(&e),
    }
}

async fn create_conversation(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let ctx = request_context(&headers);
    let identity = match current_identity(&state, &ctx).await {
        Ok(i) => i,
        Err(e) => return failure(&e),
    };
    match state.directory.insert(NewResource::conversation(identity.id.as_str())).await {
        Ok(r) => (StatusCode::CREATED, Json(serde_json::json!({ "id": r.id }))).into_response(),
        Err(e) => {
            error!(target: "directory", identity = %identity.id, error = %e, "create conversation failed");
            failure(&e)
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagePayload {
    text: String,
}

async fn create_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(payload): Json<MessagePayload>,
) -> Response {
    let ctx = request_context(&headers);
    let identity = match current_identity(&state, &ctx).await {
        Ok(i) => i,
        Err(e) => return failure(&e),
    };
    let not_found = AppError::ResourceNotFound { kind: ResourceKind::Conversation, id: conversation_id.clone() };
    match state.directory.fetch(ResourceKind::Conversation, &conversation_id).await {
        Ok(Some(c)) if c.owner_identity_id == identity.id => {}
        Ok(_) => return failure(&not_found),
        Err(e) => return failure(&e),
    }
    let new = NewResource::message(identity.id, conversation_id, payload.text);
    match state.directory.insert(new).await {
        Ok(r) => (StatusCode::CREATED, Json(serde_json::json!({ "id": r.id }))).into_response(),
        Err(e) => {
            error!(target: "directory", error = %e, "create message failed");
            failure(&e)
        }
    }
}

async fn answer(State(state): State<AppState>, headers: HeaderMap, Json(req): Json<AnswerRequest>) -> Response {
    let ctx = request_context(&headers);
    match state.answers.open(&req).await {
        Ok(stream) => {
            info!(target: "answer", request_id = ?ctx.request_id, messages = req.messages.len(), "proxying answer stream");
            let mut h = HeaderMap::new();
            h.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
            (StatusCode::OK, h, Body::from_stream(stream.into_body_stream())).into_response()
        }
        Err(e) => {
            warn!(target: "answer", request_id = ?ctx.request_id, code = e.code_str(), error = %e, "answer request failed");
            failure(&e)
        }
    }
}
