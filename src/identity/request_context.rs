use tracing::warn;

use super::provider::IdentityGateway;
use super::session::SessionToken;

/// Per-request view of the transport channel, captured once when the request arrives.
/// Controllers read the prior session from here instead of asking "who is signed in"
/// after they have already replaced the session.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub credential: Option<SessionToken>,
    pub request_id: Option<String>,
    /// PKCE verifier stored when the OAuth flow started; required to redeem the code.
    pub code_verifier: Option<String>,
}

impl RequestContext {
    pub fn new(credential: Option<SessionToken>) -> Self {
        Self { credential: credential.filter(|c| !c.is_empty()), request_id: None, code_verifier: None }
    }

    pub fn with_request_id<S: Into<String>>(mut self, id: S) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_code_verifier(mut self, verifier: Option<String>) -> Self {
        self.code_verifier = verifier.filter(|v| !v.is_empty());
        self
    }

    pub fn credential(&self) -> Option<&str> { self.credential.as_deref() }

    pub fn code_verifier(&self) -> Option<&str> { self.code_verifier.as_deref() }

    /// Resolve the guest identity bound to this channel, if any.
    /// Must run before any gateway call that replaces the session. A lookup failure is
    /// treated as "no guest": it must not block sign-in.
    pub async fn capture_guest(&self, gateway: &dyn IdentityGateway) -> Option<String> {
        let credential = self.credential()?;
        match gateway.current_identity(Some(credential)).await {
            Ok(Some(identity)) if identity.is_guest() => Some(identity.id),
            Ok(_) => None,
            Err(e) => {
                warn!(target: "auth", request_id = ?self.request_id, error = %e, "guest lookup failed; continuing without migration source");
                None
            }
        }
    }
}
