//! Identity gateway backed by a GoTrue-compatible REST service.
//! Every call carries the project `apikey`; calls acting on a session also send the
//! session credential as a bearer token.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::base_url;
use crate::error::{AppError, AppResult};

use super::pkce::PKCE_METHOD;
use super::principal::Identity;
use super::provider::{Credentials, IdentityGateway, Registration};
use super::session::Session;

#[derive(Debug, Deserialize)]
struct RemoteUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    is_anonymous: bool,
}

impl RemoteUser {
    fn into_identity(self) -> Identity {
        if self.is_anonymous {
            Identity::guest(self.id)
        } else {
            Identity::authenticated(self.id, self.email.filter(|e| !e.is_empty()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    user: RemoteUser,
}

/// Pull a human-readable message out of the service's error body; GoTrue has used
/// several field names over time.
fn error_message(status: StatusCode, body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let from_json = parsed.as_ref().and_then(|v| {
        ["msg", "message", "error_description", "error"]
            .iter()
            .find_map(|k| v.get(*k).and_then(|m| m.as_str()).map(|s| s.to_string()))
    });
    from_json.unwrap_or_else(|| {
        if body.trim().is_empty() { format!("identity service returned HTTP {}", status) } else { body.trim().to_string() }
    })
}

#[derive(Clone)]
pub struct HttpIdentityGateway {
    base: Url,
    api_key: String,
    client: reqwest::Client,
}

impl HttpIdentityGateway {
    pub fn new(base: &str, api_key: &str, client: reqwest::Client) -> AppResult<Self> {
        let base = base_url(base, "identity service")?;
        Ok(Self { base, api_key: api_key.to_string(), client })
    }

    /// `path` is relative so a base such as `https://proxy/identity/` keeps its prefix.
    fn endpoint(&self, path: &str) -> AppResult<Url> {
        self.base.join(path).map_err(|e| AppError::config(format!("invalid identity endpoint {}: {}", path, e)))
    }

    async fn post_token(&self, grant_type: &str, body: serde_json::Value, on_client_error: AppError) -> AppResult<Session> {
        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", grant_type);
        let resp = self.client.post(url).header("apikey", &self.api_key).json(&body).send().await?;
        self.session_from(resp, Some(on_client_error)).await
    }

    /// `on_client_error` is the verdict for a 4xx answer; `None` treats every failure as the service's.
    async fn session_from(&self, resp: reqwest::Response, on_client_error: Option<AppError>) -> AppResult<Session> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            // 429 is the service shedding load, not a verdict on the input.
            let rejected = status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS;
            if let Some(err) = on_client_error.filter(|_| rejected) {
                debug!(target: "auth", %status, body = %body, "identity service rejected request");
                return Err(err);
            }
            return Err(AppError::transport(error_message(status, &body)));
        }
        let tr: TokenResponse = resp.json().await?;
        let Some(token) = tr.access_token else {
            return Err(AppError::transport("identity service did not return a session (e-mail confirmation pending?)"));
        };
        Ok(Session { identity: tr.user.into_identity(), established_at: Utc::now(), token })
    }
}

#[async_trait]
impl IdentityGateway for HttpIdentityGateway {
    async fn current_identity(&self, credential: Option<&str>) -> AppResult<Option<Identity>> {
        let Some(token) = credential else { return Ok(None); };
        let resp = self
            .client
            .get(self.endpoint("auth/v1/user")?)
            .header("apikey", &self.api_key)
            .bearer_auth(token)
            .send()
            .await?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN || status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::transport(error_message(status, &body)));
        }
        let user: RemoteUser = resp.json().await?;
        Ok(Some(user.into_identity()))
    }

    async fn exchange_code(&self, code: &str, code_verifier: Option<&str>) -> AppResult<Session> {
        let mut body = serde_json::json!({ "auth_code": code });
        // Without a verifier the service refuses the code, which classifies as expired.
        if let Some(v) = code_verifier {
            body["code_verifier"] = serde_json::Value::String(v.to_string());
        }
        self.post_token("pkce", body, AppError::InvalidOrExpiredCode).await
    }

    async fn password_sign_in(&self, credentials: &Credentials) -> AppResult<Session> {
        self.post_token(
            "password",
            serde_json::json!({ "email": credentials.email, "password": credentials.password }),
            AppError::InvalidCredentials,
        )
        .await
    }

    async fn anonymous_sign_in(&self) -> AppResult<Session> {
        let resp = self
            .client
            .post(self.endpoint("auth/v1/signup")?)
            .header("apikey", &self.api_key)
            .json(&serde_json::json!({ "data": {} }))
            .send()
            .await?;
        // Anonymous sign-in has no caller input to reject: any failure is the service's.
        self.session_from(resp, None).await
    }

    async fn sign_up(&self, registration: &Registration) -> AppResult<Session> {
        let mut data = serde_json::Map::new();
        if let Some(name) = &registration.name {
            data.insert("name".into(), serde_json::Value::String(name.clone()));
        }
        let resp = self
            .client
            .post(self.endpoint("auth/v1/signup")?)
            .header("apikey", &self.api_key)
            .json(&serde_json::json!({
                "email": registration.email,
                "password": registration.password,
                "data": data,
            }))
            .send()
            .await?;
        self.session_from(resp, Some(AppError::RegistrationRejected)).await
    }

    async fn sign_out(&self, credential: &str) -> AppResult<()> {
        let resp = self
            .client
            .post(self.endpoint("auth/v1/logout")?)
            .header("apikey", &self.api_key)
            .bearer_auth(credential)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() || status.is_client_error() {
            // An already-invalid credential is as signed out as it gets.
            if status.is_client_error() {
                warn!(target: "auth", %status, "sign-out of stale credential");
            }
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(AppError::transport(error_message(status, &body)))
    }

    fn authorize_url(&self, provider: &str, redirect_to: &str, code_challenge: &str) -> AppResult<String> {
        let mut url = self.endpoint("auth/v1/authorize")?;
        url.query_pairs_mut()
            .append_pair("provider", provider)
            .append_pair("redirect_to", redirect_to)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", PKCE_METHOD);
        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKind;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(server: &MockServer) -> HttpIdentityGateway {
        HttpIdentityGateway::new(&server.uri(), "anon-key", reqwest::Client::new()).unwrap()
    }

    fn token_body(id: &str, anonymous: bool) -> serde_json::Value {
        serde_json::json!({
            "access_token": format!("tok-{}", id),
            "refresh_token": "r",
            "user": { "id": id, "email": if anonymous { "" } else { "ana@example.com" }, "is_anonymous": anonymous }
        })
    }

    #[tokio::test]
    async fn exchange_code_maps_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "pkce"))
            .and(header("apikey", "anon-key"))
            .and(body_partial_json(serde_json::json!({ "auth_code": "abc", "code_verifier": "verifier-1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("u1", false)))
            .mount(&server)
            .await;

        let session = gateway(&server).exchange_code("abc", Some("verifier-1")).await.unwrap();
        assert_eq!(session.token, "tok-u1");
        assert_eq!(session.identity.kind, IdentityKind::Authenticated);
        assert_eq!(session.identity.email.as_deref(), Some("ana@example.com"));
    }

    #[tokio::test]
    async fn rejected_code_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({ "msg": "Flow state not found" })))
            .mount(&server)
            .await;
        assert_eq!(gateway(&server).exchange_code("used", Some("v")).await.unwrap_err(), AppError::InvalidOrExpiredCode);
    }

    #[tokio::test]
    async fn service_failure_is_verbatim_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({ "message": "database is down" })))
            .mount(&server)
            .await;
        let creds = Credentials { email: "ana@example.com".into(), password: "pw".into() };
        let err = gateway(&server).password_sign_in(&creds).await.unwrap_err();
        assert_eq!(err, AppError::transport("database is down"));
    }

    #[tokio::test]
    async fn bad_password_is_invalid_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({ "error": "invalid_grant" })))
            .mount(&server)
            .await;
        let creds = Credentials { email: "ana@example.com".into(), password: "pw".into() };
        assert_eq!(gateway(&server).password_sign_in(&creds).await.unwrap_err(), AppError::InvalidCredentials);
    }

    #[tokio::test]
    async fn current_identity_uses_bearer_and_maps_unauthorized_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .and(header("authorization", "Bearer guest-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "g1", "is_anonymous": true })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .and(header("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let gw = gateway(&server);
        assert_eq!(gw.current_identity(Some("guest-token")).await.unwrap(), Some(Identity::guest("g1")));
        assert_eq!(gw.current_identity(Some("stale")).await.unwrap(), None);
        assert_eq!(gw.current_identity(None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn anonymous_sign_in_yields_guest() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/signup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("g9", true)))
            .mount(&server)
            .await;
        let session = gateway(&server).anonymous_sign_in().await.unwrap();
        assert!(session.identity.is_guest());
        assert_eq!(session.identity.email, None);
    }

    #[test]
    fn authorize_url_encodes_redirect_and_challenge() {
        let gw = HttpIdentityGateway::new("https://id.example.com", "k", reqwest::Client::new()).unwrap();
        let url = gw.authorize_url("google", "https://app.example.com/auth/callback?next=/chat", "chal-1").unwrap();
        assert!(url.starts_with("https://id.example.com/auth/v1/authorize?provider=google&redirect_to="));
        assert!(url.contains("redirect_to=https%3A%2F%2Fapp.example.com%2Fauth%2Fcallback%3Fnext%3D%2Fchat"));
        assert!(url.ends_with("&code_challenge=chal-1&code_challenge_method=s256"));
    }

    #[tokio::test]
    async fn service_mounted_under_a_path_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/identity/auth/v1/token"))
            .and(query_param("grant_type", "pkce"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("u1", false)))
            .mount(&server)
            .await;
        let gw = HttpIdentityGateway::new(&format!("{}/identity", server.uri()), "k", reqwest::Client::new()).unwrap();
        assert_eq!(gw.exchange_code("abc", Some("v")).await.unwrap().token, "tok-u1");
        let url = gw.authorize_url("github", "http://app/auth/callback", "c").unwrap();
        assert!(url.starts_with(&format!("{}/identity/auth/v1/authorize?", server.uri())));
    }

    #[test]
    fn error_message_prefers_json_fields() {
        assert_eq!(error_message(StatusCode::BAD_GATEWAY, r#"{"error_description":"upstream"}"#), "upstream");
        assert_eq!(error_message(StatusCode::BAD_GATEWAY, "plain text"), "plain text");
        assert!(error_message(StatusCode::BAD_GATEWAY, "").contains("502"));
    }
}
