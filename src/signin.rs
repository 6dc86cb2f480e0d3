//! Password, anonymous and registration sign-in, plus sign-out and OAuth start.
//!
//! Every authenticating path captures the channel's guest identity before calling the
//! gateway, then migrates from that captured id once the new session exists.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::exchange::{sanitize_next, DEFAULT_REDIRECT};
use crate::identity::{Credentials, IdentityGateway, PkcePair, Registration, RequestContext, Session};
use crate::migration::{MigratedCount, OwnershipMigrator};

pub const LOGIN_PATH: &str = "/login";
pub const CALLBACK_PATH: &str = "/auth/callback";

#[derive(Debug)]
pub struct SignInOutcome {
    pub session: Session,
    pub redirect: String,
    pub migrated: Option<MigratedCount>,
    pub migration_deficiency: Option<AppError>,
}

/// What the user is shown when sign-in fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureMessage {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignInFailure {
    pub error: AppError,
    pub message: FailureMessage,
}

impl From<AppError> for SignInFailure {
    fn from(error: AppError) -> Self {
        let message = FailureMessage { message: error.public_message() };
        SignInFailure { error, message }
    }
}

/// Where to send the browser to start a provider login, and the PKCE verifier it must
/// hold until the callback.
#[derive(Debug, Clone)]
pub struct OAuthStart {
    pub url: String,
    pub code_verifier: String,
}

/// Form body accepted by `POST /login`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub path: Option<String>,
}

impl LoginForm {
    pub fn credentials(&self) -> Credentials {
        Credentials { email: self.email.clone(), password: self.password.clone() }
    }
}

/// Destination after a successful password sign-in. Coming from the login page itself
/// lands on the home page.
pub fn post_login_redirect(origin_path: Option<&str>) -> String {
    let path = sanitize_next(origin_path);
    if path == LOGIN_PATH || path.starts_with("/login?") {
        DEFAULT_REDIRECT.to_string()
    } else {
        path
    }
}

pub struct CredentialSignIn {
    gateway: Arc<dyn IdentityGateway>,
    migrator: Arc<dyn OwnershipMigrator>,
    public_url: String,
}

impl CredentialSignIn {
    pub fn new(gateway: Arc<dyn IdentityGateway>, migrator: Arc<dyn OwnershipMigrator>, public_url: &str) -> Self {
        Self { gateway, migrator, public_url: public_url.trim_end_matches('/').to_string() }
    }

    pub async fn password_sign_in(
        &self,
        ctx: &RequestContext,
        credentials: &Credentials,
        origin_path: Option<&str>,
    ) -> Result<SignInOutcome, SignInFailure> {
        let guest_id = ctx.capture_guest(self.gateway.as_ref()).await;
        let session = match self.gateway.password_sign_in(credentials).await {
            Ok(s) => s,
            Err(e) => {
                warn!(target: "auth", request_id = ?ctx.request_id, error = %e, "password sign-in failed");
                return Err(e.into());
            }
        };
        Ok(self.finish(ctx, guest_id, session, post_login_redirect(origin_path)).await)
    }

    /// New guest session regardless of what the channel carried before. Never migrates;
    /// the replaced credential is still signed out.
    pub async fn anonymous_sign_in(&self, ctx: &RequestContext) -> Result<SignInOutcome, SignInFailure> {
        let session = self.gateway.anonymous_sign_in().await.map_err(|e| {
            warn!(target: "auth", request_id = ?ctx.request_id, error = %e, "anonymous sign-in failed");
            SignInFailure::from(e)
        })?;
        self.retire_prior(ctx, &session).await;
        info!(target: "auth", request_id = ?ctx.request_id, identity = %session.identity.id, "guest session started");
        Ok(SignInOutcome { session, redirect: DEFAULT_REDIRECT.to_string(), migrated: None, migration_deficiency: None })
    }

    pub async fn sign_up(
        &self,
        ctx: &RequestContext,
        registration: &Registration,
    ) -> Result<SignInOutcome, SignInFailure> {
        let guest_id = ctx.capture_guest(self.gateway.as_ref()).await;
        let session = self.gateway.sign_up(registration).await.map_err(|e| {
            warn!(target: "auth", request_id = ?ctx.request_id, error = %e, "sign-up failed");
            SignInFailure::from(e)
        })?;
        Ok(self.finish(ctx, guest_id, session, DEFAULT_REDIRECT.to_string()).await)
    }

    /// Returns the path to send the client to.
    pub async fn sign_out(&self, ctx: &RequestContext) -> Result<String, SignInFailure> {
        if let Some(credential) = ctx.credential() {
            self.gateway.sign_out(credential).await.map_err(SignInFailure::from)?;
        }
        Ok(LOGIN_PATH.to_string())
    }

    pub fn oauth_start(&self, provider: &str, origin_path: Option<&str>) -> AppResult<OAuthStart> {
        let next = sanitize_next(origin_path);
        let redirect_to = format!("{}{}?next={}", self.public_url, CALLBACK_PATH, urlencoding::encode(&next));
        let pkce = PkcePair::generate()?;
        let url = self.gateway.authorize_url(provider, &redirect_to, &pkce.challenge)?;
        Ok(OAuthStart { url, code_verifier: pkce.verifier })
    }

    /// Sign out the credential the request arrived with, unless it is the new session.
    async fn retire_prior(&self, ctx: &RequestContext, session: &Session) {
        if let Some(old) = ctx.credential().filter(|c| *c != session.token) {
            if let Err(e) = self.gateway.sign_out(old).await {
                warn!(target: "auth", request_id = ?ctx.request_id, error = %e, "could not invalidate prior session");
            }
        }
    }

    async fn finish(
        &self,
        ctx: &RequestContext,
        guest_id: Option<String>,
        session: Session,
        redirect: String,
    ) -> SignInOutcome {
        let mut migrated = None;
        let mut deficiency = None;
        if let Some(guest) = guest_id.as_deref().filter(|g| *g != session.identity.id) {
            match self.migrator.migrate(Some(guest), &session.identity.id).await {
                Ok(n) => migrated = Some(n),
                Err(e) => {
                    warn!(
                        target: "auth",
                        request_id = ?ctx.request_id,
                        guest,
                        identity = %session.identity.id,
                        error = %e,
                        "guest migration failed; completing sign-in anyway"
                    );
                    deficiency = Some(e);
                }
            }
        }

        self.retire_prior(ctx, &session).await;

        info!(
            target: "auth",
            request_id = ?ctx.request_id,
            identity = %session.identity.id,
            guest = ?guest_id,
            migrated = ?migrated,
            "signed in"
        );
        SignInOutcome { session, redirect, migrated, migration_deficiency: deficiency }
    }
}
