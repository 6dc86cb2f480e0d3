//! Authorization-code callback: trade a provider code for a session and move the guest's
//! resources onto the new identity.
//!
//! One [`ExchangeRun`] per callback request walks
//! `Start -> (NoCode | Invalidating -> Exchanging -> (Failed | Migrating -> Completed))`.
//! The guest identity is read from the request's channel credential before anything that
//! replaces the session, and carried as a local value from then on.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::identity::{IdentityGateway, RequestContext, Session};
use crate::migration::{MigratedCount, OwnershipMigrator};

pub const DEFAULT_REDIRECT: &str = "/";
pub const EXCHANGE_ERROR_PATH: &str = "/auth/auth-code-error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Start,
    NoCode,
    Invalidating,
    Exchanging,
    Migrating,
    Completed,
    Failed,
}

impl ExchangeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExchangeState::NoCode | ExchangeState::Completed | ExchangeState::Failed)
    }

    fn can_advance_to(self, next: ExchangeState) -> bool {
        use ExchangeState::*;
        matches!(
            (self, next),
            (Start, NoCode)
                | (Start, Invalidating)
                | (Start, Failed)
                | (Invalidating, Exchanging)
                | (Exchanging, Failed)
                | (Exchanging, Migrating)
                | (Migrating, Completed)
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub next: Option<String>,
}

/// Only same-origin absolute paths are honoured as post-login destinations.
pub fn sanitize_next(next: Option<&str>) -> String {
    match next.map(str::trim) {
        Some(p) if p.starts_with('/') && !p.starts_with("//") && !p.contains('\\') && !p.chars().any(char::is_control) => {
            p.to_string()
        }
        _ => DEFAULT_REDIRECT.to_string(),
    }
}

/// Codes currently being redeemed by this process.
#[derive(Default)]
pub struct InFlightCodes {
    codes: Mutex<HashSet<String>>,
}

impl InFlightCodes {
    pub fn new() -> Self { Self::default() }

    /// `None` when the code is already being exchanged by another request.
    pub fn claim(&self, code: &str) -> Option<CodeClaim<'_>> {
        if self.codes.lock().insert(code.to_string()) {
            Some(CodeClaim { owner: self, code: code.to_string() })
        } else {
            None
        }
    }

    pub fn len(&self) -> usize { self.codes.lock().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

pub struct CodeClaim<'a> {
    owner: &'a InFlightCodes,
    code: String,
}

impl Drop for CodeClaim<'_> {
    fn drop(&mut self) {
        self.owner.codes.lock().remove(&self.code);
    }
}

#[derive(Debug)]
pub struct ExchangeOutcome {
    pub state: ExchangeState,
    pub redirect: String,
    pub session: Option<Session>,
    /// The channel's old credential was torn down and must be cleared from the client.
    pub clear_credential: bool,
    pub migrated: Option<MigratedCount>,
    /// Migration failed after a successful exchange; login still completed.
    pub migration_deficiency: Option<AppError>,
    pub error: Option<AppError>,
    trace: Vec<ExchangeState>,
}

impl ExchangeOutcome {
    pub fn trace(&self) -> &[ExchangeState] { &self.trace }
}

/// State of one callback request.
struct ExchangeRun {
    state: ExchangeState,
    trace: Vec<ExchangeState>,
}

impl ExchangeRun {
    fn new() -> Self { Self { state: ExchangeState::Start, trace: vec![ExchangeState::Start] } }

    fn advance(&mut self, next: ExchangeState) {
        debug_assert!(self.state.can_advance_to(next), "illegal exchange transition {:?} -> {:?}", self.state, next);
        self.state = next;
        self.trace.push(next);
    }

    fn finish(self, redirect: String) -> ExchangeOutcome {
        ExchangeOutcome {
            state: self.state,
            redirect,
            session: None,
            clear_credential: false,
            migrated: None,
            migration_deficiency: None,
            error: None,
            trace: self.trace,
        }
    }
}

pub struct SessionExchange {
    gateway: Arc<dyn IdentityGateway>,
    migrator: Arc<dyn OwnershipMigrator>,
    in_flight: Arc<InFlightCodes>,
}

impl SessionExchange {
    pub fn new(gateway: Arc<dyn IdentityGateway>, migrator: Arc<dyn OwnershipMigrator>) -> Self {
        Self { gateway, migrator, in_flight: Arc::new(InFlightCodes::new()) }
    }

    pub fn with_in_flight(mut self, in_flight: Arc<InFlightCodes>) -> Self {
        self.in_flight = in_flight;
        self
    }

    pub async fn handle(&self, ctx: &RequestContext, params: CallbackParams) -> ExchangeOutcome {
        let mut run = ExchangeRun::new();

        let Some(code) = params.code.filter(|c| !c.trim().is_empty()) else {
            run.advance(ExchangeState::NoCode);
            debug!(target: "auth", request_id = ?ctx.request_id, "callback without code");
            return run.finish(DEFAULT_REDIRECT.to_string());
        };
        let next = sanitize_next(params.next.as_deref());

        let Some(_claim) = self.in_flight.claim(&code) else {
            warn!(target: "auth", request_id = ?ctx.request_id, "authorization code already being redeemed");
            run.advance(ExchangeState::Failed);
            let mut out = run.finish(EXCHANGE_ERROR_PATH.to_string());
            out.error = Some(AppError::InvalidOrExpiredCode);
            return out;
        };

        // Read before anything replaces the session; never re-derived afterwards.
        let guest_id = ctx.capture_guest(self.gateway.as_ref()).await;

        run.advance(ExchangeState::Invalidating);
        let had_credential = match ctx.credential() {
            Some(old) => {
                if let Err(e) = self.gateway.sign_out(old).await {
                    warn!(target: "auth", request_id = ?ctx.request_id, error = %e, "could not invalidate prior session");
                }
                true
            }
            None => false,
        };

        run.advance(ExchangeState::Exchanging);
        let session = match self.gateway.exchange_code(&code, ctx.code_verifier()).await {
            Ok(s) => s,
            Err(e) => {
                warn!(target: "auth", request_id = ?ctx.request_id, error = %e, "code exchange failed");
                run.advance(ExchangeState::Failed);
                let mut out = run.finish(EXCHANGE_ERROR_PATH.to_string());
                out.clear_credential = had_credential;
                out.error = Some(e);
                return out;
            }
        };

        run.advance(ExchangeState::Migrating);
        let mut migrated = None;
        let mut deficiency = None;
        if let Some(guest) = guest_id.as_deref() {
            match self.migrator.migrate(Some(guest), &session.identity.id).await {
                Ok(n) => migrated = Some(n),
                Err(e) => {
                    warn!(
                        target: "auth",
                        request_id = ?ctx.request_id,
                        guest,
                        identity = %session.identity.id,
                        error = %e,
                        "guest migration failed; completing login anyway"
                    );
                    deficiency = Some(e);
                }
            }
        }

        run.advance(ExchangeState::Completed);
        info!(
            target: "auth",
            request_id = ?ctx.request_id,
            identity = %session.identity.id,
            guest = ?guest_id,
            migrated = ?migrated,
            "session exchanged"
        );
        let mut out = run.finish(next);
        out.session = Some(session);
        out.migrated = migrated;
        out.migration_deficiency = deficiency;
        out
    }
}
