use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use password_hash::{PasswordHash, SaltString};
use serde::Deserialize;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::tprintln;

use super::pkce::challenge_s256;
use super::principal::Identity;
use super::session::{gen_token, Session, SessionManager};

#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("email", &self.email).field("password", &"<redacted>").finish()
    }
}

#[derive(Clone, Deserialize)]
pub struct Registration {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("email", &self.email)
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Operations this service needs from the external identity service.
#[async_trait]
pub trait IdentityGateway: Send + Sync {
    /// `Ok(None)` when no session is bound to `credential`; that is not an error.
    async fn current_identity(&self, credential: Option<&str>) -> AppResult<Option<Identity>>;
    /// Redeem a one-time authorization code. `code_verifier` is the PKCE verifier stored
    /// when the flow started; the service rejects the code without it.
    async fn exchange_code(&self, code: &str, code_verifier: Option<&str>) -> AppResult<Session>;
    async fn password_sign_in(&self, credentials: &Credentials) -> AppResult<Session>;
    async fn anonymous_sign_in(&self) -> AppResult<Session>;
    async fn sign_up(&self, registration: &Registration) -> AppResult<Session>;
    async fn sign_out(&self, credential: &str) -> AppResult<()>;
    /// URL of the provider login page. `code_challenge` is the S256 challenge of the
    /// verifier kept by the browser.
    fn authorize_url(&self, provider: &str, redirect_to: &str, code_challenge: &str) -> AppResult<String>;
}

fn hash_password(password: &str) -> AppResult<String> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|e| AppError::transport(e.to_string()))?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| AppError::transport(e.to_string()))?;
    let phc = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AppError::transport(e.to_string()))?
        .to_string();
    Ok(phc)
}

fn verify_password(hash: &str, password: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(_) => false,
    }
}

#[derive(Debug)]
struct Account {
    identity_id: String,
    password_hash: String,
}

#[derive(Debug)]
struct PendingCode {
    identity_id: String,
    expires_at: Instant,
    challenge: Option<String>,
}

/// In-process identity service stand-in for development and tests.
/// Satisfies the same contract as the remote gateway: single-use codes, argon2 accounts,
/// opaque bearer tokens.
pub struct LocalIdentityGateway {
    sm: SessionManager,
    code_ttl: Duration,
    accounts: RwLock<HashMap<String, Account>>,
    identities: RwLock<HashMap<String, Identity>>,
    codes: Mutex<HashMap<String, PendingCode>>,
}

impl Default for LocalIdentityGateway {
    fn default() -> Self { Self::new(SessionManager::default()) }
}

impl LocalIdentityGateway {
    pub fn new(sm: SessionManager) -> Self {
        Self {
            sm,
            code_ttl: Duration::from_secs(5 * 60),
            accounts: RwLock::new(HashMap::new()),
            identities: RwLock::new(HashMap::new()),
            codes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_code_ttl(mut self, ttl: Duration) -> Self {
        self.code_ttl = ttl;
        self
    }

    /// Create an authenticated account. Emails are matched case-insensitively.
    pub fn register_account(&self, email: &str, password: &str) -> AppResult<Identity> {
        let key = email.trim().to_lowercase();
        if self.accounts.read().contains_key(&key) {
            return Err(AppError::RegistrationRejected);
        }
        let phc = hash_password(password)?;
        let identity = Identity::authenticated(uuid::Uuid::new_v4().to_string(), Some(email.trim().to_string()));
        {
            let mut accounts = self.accounts.write();
            if accounts.contains_key(&key) {
                return Err(AppError::RegistrationRejected);
            }
            accounts.insert(key, Account { identity_id: identity.id.clone(), password_hash: phc });
        }
        self.identities.write().insert(identity.id.clone(), identity.clone());
        tprintln!("local.register identity={}", identity.id);
        Ok(identity)
    }

    /// Mint a single-use authorization code for an existing identity, as the provider
    /// would after a successful external login.
    pub fn issue_code(&self, identity_id: &str) -> AppResult<String> { self.mint_code(identity_id, None) }

    /// Like [`issue_code`](Self::issue_code), but the code only redeems together with the
    /// verifier whose S256 challenge is given here.
    pub fn issue_code_with_challenge(&self, identity_id: &str, challenge: &str) -> AppResult<String> {
        self.mint_code(identity_id, Some(challenge.to_string()))
    }

    fn mint_code(&self, identity_id: &str, challenge: Option<String>) -> AppResult<String> {
        if !self.identities.read().contains_key(identity_id) {
            return Err(AppError::transport(format!("unknown identity {}", identity_id)));
        }
        let code = gen_token()?;
        let now = Instant::now();
        let mut codes = self.codes.lock();
        // never-redeemed codes would otherwise accumulate forever
        codes.retain(|_, p| p.expires_at > now);
        codes.insert(
            code.clone(),
            PendingCode { identity_id: identity_id.to_string(), expires_at: now + self.code_ttl, challenge },
        );
        Ok(code)
    }

    fn identity(&self, id: &str) -> Option<Identity> { self.identities.read().get(id).cloned() }
}

#[async_trait]
impl IdentityGateway for LocalIdentityGateway {
    async fn current_identity(&self, credential: Option<&str>) -> AppResult<Option<Identity>> {
        Ok(credential.and_then(|c| self.sm.validate(c)))
    }

    async fn exchange_code(&self, code: &str, code_verifier: Option<&str>) -> AppResult<Session> {
        // Removing first makes the code single-use even when it turns out to be expired.
        let pending = self.codes.lock().remove(code).ok_or(AppError::InvalidOrExpiredCode)?;
        if pending.expires_at <= Instant::now() {
            return Err(AppError::InvalidOrExpiredCode);
        }
        if let Some(expected) = &pending.challenge {
            match code_verifier {
                Some(v) if challenge_s256(v) == *expected => {}
                _ => return Err(AppError::InvalidOrExpiredCode),
            }
        }
        let identity = self.identity(&pending.identity_id).ok_or(AppError::InvalidOrExpiredCode)?;
        let session = self.sm.issue(identity)?;
        info!(target: "auth", identity = %session.identity.id, "local.exchange_code");
        Ok(session)
    }

    async fn password_sign_in(&self, credentials: &Credentials) -> AppResult<Session> {
        let key = credentials.email.trim().to_lowercase();
        let (identity_id, phc) = {
            let accounts = self.accounts.read();
            let Some(acct) = accounts.get(&key) else { return Err(AppError::InvalidCredentials); };
            (acct.identity_id.clone(), acct.password_hash.clone())
        };
        if !verify_password(&phc, &credentials.password) {
            return Err(AppError::InvalidCredentials);
        }
        let identity = self.identity(&identity_id).ok_or(AppError::InvalidCredentials)?;
        self.sm.issue(identity)
    }

    async fn anonymous_sign_in(&self) -> AppResult<Session> {
        let identity = Identity::guest(uuid::Uuid::new_v4().to_string());
        self.identities.write().insert(identity.id.clone(), identity.clone());
        self.sm.issue(identity)
    }

    async fn sign_up(&self, registration: &Registration) -> AppResult<Session> {
        let identity = self.register_account(&registration.email, &registration.password)?;
        self.sm.issue(identity)
    }

    async fn sign_out(&self, credential: &str) -> AppResult<()> {
        self.sm.logout(credential);
        Ok(())
    }

    fn authorize_url(&self, provider: &str, _redirect_to: &str, _code_challenge: &str) -> AppResult<String> {
        Err(AppError::transport(format!("provider '{}' is not available with the local identity gateway", provider)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKind;

    fn creds(email: &str, password: &str) -> Credentials {
        Credentials { email: email.into(), password: password.into() }
    }

    #[tokio::test]
    async fn code_redeems_exactly_once() {
        let gw = LocalIdentityGateway::default();
        let user = gw.register_account("ana@example.com", "s3cret").unwrap();
        let code = gw.issue_code(&user.id).unwrap();

        let session = gw.exchange_code(&code, None).await.unwrap();
        assert_eq!(session.identity, user);
        let current = gw.current_identity(Some(&session.token)).await.unwrap();
        assert_eq!(current, Some(user));

        assert_eq!(gw.exchange_code(&code, None).await.unwrap_err(), AppError::InvalidOrExpiredCode);
    }

    #[tokio::test]
    async fn expired_code_is_rejected() {
        let gw = LocalIdentityGateway::default().with_code_ttl(Duration::from_millis(0));
        let user = gw.register_account("ana@example.com", "s3cret").unwrap();
        let code = gw.issue_code(&user.id).unwrap();
        assert_eq!(gw.exchange_code(&code, None).await.unwrap_err(), AppError::InvalidOrExpiredCode);
        assert_eq!(gw.exchange_code("never-issued", None).await.unwrap_err(), AppError::InvalidOrExpiredCode);
    }

    #[test]
    fn expired_codes_are_purged_when_new_ones_are_minted() {
        let gw = LocalIdentityGateway::default().with_code_ttl(Duration::from_millis(0));
        let user = gw.register_account("ana@example.com", "s3cret").unwrap();
        for _ in 0..20 {
            gw.issue_code(&user.id).unwrap();
        }
        assert_eq!(gw.codes.lock().len(), 1);
    }

    #[tokio::test]
    async fn challenged_code_needs_the_matching_verifier() {
        let gw = LocalIdentityGateway::default();
        let user = gw.register_account("ana@example.com", "s3cret").unwrap();
        let pkce = crate::identity::PkcePair::generate().unwrap();

        let code = gw.issue_code_with_challenge(&user.id, &pkce.challenge).unwrap();
        assert_eq!(gw.exchange_code(&code, None).await.unwrap_err(), AppError::InvalidOrExpiredCode);
        // a failed attempt still consumes the code
        assert_eq!(gw.exchange_code(&code, Some(&pkce.verifier)).await.unwrap_err(), AppError::InvalidOrExpiredCode);

        let code = gw.issue_code_with_challenge(&user.id, &pkce.challenge).unwrap();
        assert_eq!(gw.exchange_code(&code, Some("wrong-verifier")).await.unwrap_err(), AppError::InvalidOrExpiredCode);

        let code = gw.issue_code_with_challenge(&user.id, &pkce.challenge).unwrap();
        let session = gw.exchange_code(&code, Some(&pkce.verifier)).await.unwrap();
        assert_eq!(session.identity, user);
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_account_look_identical() {
        let gw = LocalIdentityGateway::default();
        gw.register_account("ana@example.com", "s3cret").unwrap();
        let wrong = gw.password_sign_in(&creds("ana@example.com", "nope")).await.unwrap_err();
        let unknown = gw.password_sign_in(&creds("bob@example.com", "s3cret")).await.unwrap_err();
        assert_eq!(wrong, AppError::InvalidCredentials);
        assert_eq!(wrong, unknown);

        let ok = gw.password_sign_in(&creds("ANA@example.com", "s3cret")).await.unwrap();
        assert_eq!(ok.identity.kind, IdentityKind::Authenticated);
    }

    #[tokio::test]
    async fn anonymous_sign_in_creates_fresh_guests() {
        let gw = LocalIdentityGateway::default();
        let a = gw.anonymous_sign_in().await.unwrap();
        let b = gw.anonymous_sign_in().await.unwrap();
        assert!(a.identity.is_guest());
        assert_ne!(a.identity.id, b.identity.id);
        assert_eq!(gw.current_identity(None).await.unwrap(), None);
        assert_eq!(gw.current_identity(Some("bogus")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_sign_up_is_rejected() {
        let gw = LocalIdentityGateway::default();
        let reg = Registration { email: "ana@example.com".into(), password: "pw".into(), name: None };
        let first = gw.sign_up(&reg).await.unwrap();
        assert_eq!(first.identity.email.as_deref(), Some("ana@example.com"));
        assert_eq!(gw.sign_up(&reg).await.unwrap_err(), AppError::RegistrationRejected);
    }

    #[tokio::test]
    async fn sign_out_invalidates_token() {
        let gw = LocalIdentityGateway::default();
        let s = gw.anonymous_sign_in().await.unwrap();
        gw.sign_out(&s.token).await.unwrap();
        assert_eq!(gw.current_identity(Some(&s.token)).await.unwrap(), None);
        // unknown credential is a no-op
        gw.sign_out("unknown").await.unwrap();
    }

    #[test]
    fn debug_output_redacts_password() {
        let out = format!("{:?}", creds("ana@example.com", "hunter2"));
        assert!(!out.contains("hunter2"));
    }
}
