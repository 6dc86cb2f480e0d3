//! Identity gateway and session types.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod session;
mod provider;
mod http;
mod request_context;
mod pkce;

pub use principal::{Identity, IdentityKind};
pub use session::{Session, SessionToken, SessionManager};
pub use provider::{Credentials, IdentityGateway, LocalIdentityGateway, Registration};
pub use http::HttpIdentityGateway;
pub use request_context::RequestContext;
pub use pkce::{challenge_s256, PkcePair, PKCE_METHOD};
