use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{AppError, AppResult};
use crate::tprintln;

use super::principal::Identity;

/// Opaque credential carried by the session cookie.
pub type SessionToken = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub identity: Identity,
    pub established_at: DateTime<Utc>,
    pub token: SessionToken,
}

#[derive(Debug)]
struct SessionEntry {
    session: Session,
    expires_at: Instant,
}

/// 256-bit random token, base64url without padding. Errors when the OS RNG is unavailable.
pub(crate) fn gen_token() -> AppResult<String> {
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf).map_err(|e| AppError::transport(format!("random source unavailable: {}", e)))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

/// In-process session table used by the local identity gateway.
/// A token is valid while its entry exists and has not expired.
pub struct SessionManager {
    pub ttl: Duration,
    sessions: RwLock<HashMap<SessionToken, SessionEntry>>,
}

impl Default for SessionManager {
    fn default() -> Self { Self::with_ttl(Duration::from_secs(60 * 60)) }
}

impl SessionManager {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl, sessions: RwLock::new(HashMap::new()) }
    }

    pub fn issue(&self, identity: Identity) -> AppResult<Session> {
        let token = gen_token()?;
        let now = Instant::now();
        let sess = Session { identity, established_at: Utc::now(), token: token.clone() };
        let entry = SessionEntry { session: sess.clone(), expires_at: now + self.ttl };
        {
            let mut map = self.sessions.write();
            map.retain(|_, e| e.expires_at > now);
            map.insert(token, entry);
        }
        tprintln!(
            "session.issue identity={} kind={:?} ttl_secs={}",
            sess.identity.id,
            sess.identity.kind,
            self.ttl.as_secs()
        );
        Ok(sess)
    }

    pub fn validate(&self, token: &str) -> Option<Identity> {
        let now = Instant::now();
        let expired = {
            let map = self.sessions.read();
            match map.get(token) {
                Some(ent) if ent.expires_at > now => return Some(ent.session.identity.clone()),
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            self.sessions.write().remove(token);
        }
        None
    }

    /// Drop the session bound to `token`. Returns whether one existed.
    pub fn logout(&self, token: &str) -> bool { self.sessions.write().remove(token).is_some() }

    pub fn len(&self) -> usize { self.sessions.read().len() }

    pub fn is_empty(&self) -> bool { self.sessions.read().is_empty() }
}
