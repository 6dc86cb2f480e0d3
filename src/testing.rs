//! Collaborator doubles shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::directory::{NewResource, Resource, ResourceDirectory, ResourceKind};
use crate::error::{AppError, AppResult};
use crate::identity::{Credentials, Identity, IdentityGateway, Registration, Session};
use crate::migration::{MigratedCount, OwnershipMigrator};

pub struct CountingDirectory<D> {
    inner: D,
    calls: AtomicUsize,
    reassigns: AtomicUsize,
}

impl<D: ResourceDirectory> CountingDirectory<D> {
    pub fn new(inner: D) -> Self { Self { inner, calls: AtomicUsize::new(0), reassigns: AtomicUsize::new(0) } }
    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
    pub fn reassign_calls(&self) -> usize { self.reassigns.load(Ordering::SeqCst) }
}

#[async_trait]
impl<D: ResourceDirectory> ResourceDirectory for CountingDirectory<D> {
    async fn insert(&self, new: NewResource) -> AppResult<Resource> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.insert(new).await
    }
    async fn fetch(&self, kind: ResourceKind, id: &str) -> AppResult<Option<Resource>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(kind, id).await
    }
    async fn count_owned(&self, kind: ResourceKind, owner: &str) -> AppResult<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.count_owned(kind, owner).await
    }
    async fn reassign_owner(&self, kind: ResourceKind, from: &str, to: &str) -> AppResult<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reassigns.fetch_add(1, Ordering::SeqCst);
        self.inner.reassign_owner(kind, from, to).await
    }
}

/// Fails `reassign_owner` for one kind for the first `failures` attempts.
pub struct FlakyDirectory {
    inner: Arc<dyn ResourceDirectory>,
    kind: ResourceKind,
    remaining: AtomicUsize,
}

impl FlakyDirectory {
    pub fn new(inner: Arc<dyn ResourceDirectory>, kind: ResourceKind, failures: usize) -> Self {
        Self { inner, kind, remaining: AtomicUsize::new(failures) }
    }
}

#[async_trait]
impl ResourceDirectory for FlakyDirectory {
    async fn insert(&self, new: NewResource) -> AppResult<Resource> { self.inner.insert(new).await }
    async fn fetch(&self, kind: ResourceKind, id: &str) -> AppResult<Option<Resource>> { self.inner.fetch(kind, id).await }
    async fn count_owned(&self, kind: ResourceKind, owner: &str) -> AppResult<u64> { self.inner.count_owned(kind, owner).await }
    async fn reassign_owner(&self, kind: ResourceKind, from: &str, to: &str) -> AppResult<u64> {
        if kind == self.kind
            && self.remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
        {
            return Err(AppError::transport("directory timed out"));
        }
        self.inner.reassign_owner(kind, from, to).await
    }
}

/// Wraps a gateway and counts every call that would reach the identity service.
pub struct CountingGateway {
    inner: Arc<dyn IdentityGateway>,
    calls: Mutex<Vec<&'static str>>,
}

impl CountingGateway {
    pub fn new(inner: Arc<dyn IdentityGateway>) -> Self { Self { inner, calls: Mutex::new(Vec::new()) } }
    pub fn calls(&self) -> Vec<&'static str> { self.calls.lock().clone() }
    pub fn count(&self) -> usize { self.calls.lock().len() }
    fn record(&self, op: &'static str) { self.calls.lock().push(op); }
}

#[async_trait]
impl IdentityGateway for CountingGateway {
    async fn current_identity(&self, credential: Option<&str>) -> AppResult<Option<Identity>> {
        self.record("current_identity");
        self.inner.current_identity(credential).await
    }
    async fn exchange_code(&self, code: &str, code_verifier: Option<&str>) -> AppResult<Session> {
        self.record("exchange_code");
        self.inner.exchange_code(code, code_verifier).await
    }
    async fn password_sign_in(&self, credentials: &Credentials) -> AppResult<Session> {
        self.record("password_sign_in");
        self.inner.password_sign_in(credentials).await
    }
    async fn anonymous_sign_in(&self) -> AppResult<Session> {
        self.record("anonymous_sign_in");
        self.inner.anonymous_sign_in().await
    }
    async fn sign_up(&self, registration: &Registration) -> AppResult<Session> {
        self.record("sign_up");
        self.inner.sign_up(registration).await
    }
    async fn sign_out(&self, credential: &str) -> AppResult<()> {
        self.record("sign_out");
        self.inner.sign_out(credential).await
    }
    fn authorize_url(&self, provider: &str, redirect_to: &str, code_challenge: &str) -> AppResult<String> {
        self.record("authorize_url");
        self.inner.authorize_url(provider, redirect_to, code_challenge)
    }
}

/// Identity service that is reachable for lookups but rejects every sign-in with `error`.
pub struct FailingGateway {
    pub error: AppError,
}

#[async_trait]
impl IdentityGateway for FailingGateway {
    async fn current_identity(&self, _credential: Option<&str>) -> AppResult<Option<Identity>> { Ok(None) }
    async fn exchange_code(&self, _code: &str, _code_verifier: Option<&str>) -> AppResult<Session> {
        Err(self.error.clone())
    }
    async fn password_sign_in(&self, _credentials: &Credentials) -> AppResult<Session> { Err(self.error.clone()) }
    async fn anonymous_sign_in(&self) -> AppResult<Session> { Err(self.error.clone()) }
    async fn sign_up(&self, _registration: &Registration) -> AppResult<Session> { Err(self.error.clone()) }
    async fn sign_out(&self, _credential: &str) -> AppResult<()> { Err(self.error.clone()) }
    fn authorize_url(&self, _provider: &str, _redirect_to: &str, _code_challenge: &str) -> AppResult<String> {
        Err(self.error.clone())
    }
}

/// Records every migrate call; succeeds with 0 or fails with `fail_with`.
pub struct RecordingMigrator {
    fail_with: Option<AppError>,
    calls: Mutex<Vec<(Option<String>, String)>>,
}

impl RecordingMigrator {
    pub fn noop() -> Self { Self { fail_with: None, calls: Mutex::new(Vec::new()) } }
    pub fn failing(err: AppError) -> Self { Self { fail_with: Some(err), calls: Mutex::new(Vec::new()) } }
    pub fn calls(&self) -> Vec<(Option<String>, String)> { self.calls.lock().clone() }
}

#[async_trait]
impl OwnershipMigrator for RecordingMigrator {
    async fn migrate(&self, from: Option<&str>, to: &str) -> AppResult<MigratedCount> {
        self.calls.lock().push((from.map(|s| s.to_string()), to.to_string()));
        match &self.fail_with {
            Some(err) => Err(err.clone()),
            None => Ok(0),
        }
    }
}
