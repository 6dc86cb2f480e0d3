use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Guest,
    Authenticated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub kind: IdentityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Identity {
    pub fn guest<S: Into<String>>(id: S) -> Self {
        Self { id: id.into(), kind: IdentityKind::Guest, email: None }
    }

    pub fn authenticated<S: Into<String>>(id: S, email: Option<String>) -> Self {
        Self { id: id.into(), kind: IdentityKind::Authenticated, email }
    }

    pub fn is_guest(&self) -> bool { self.kind == IdentityKind::Guest }
}
