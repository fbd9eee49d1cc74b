//! Client session identity and connection target paths.
//!
//! Identity is an explicit value handed to the channel. Nothing here reads
//! process-wide state.

use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

const CLIENT_ID_PREFIX: &str = "client_";
const CLIENT_ID_SUFFIX_LEN: usize = 9;

/// Per-client random token that disambiguates tabs/devices of one account.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ClientId(String);

impl ClientId {
    /// Generates a fresh `client_xxxxxxxxx` token.
    pub fn generate() -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .map(|byte| char::from(byte).to_ascii_lowercase())
            .take(CLIENT_ID_SUFFIX_LEN)
            .collect();
        Self(format!("{CLIENT_ID_PREFIX}{suffix}"))
    }

    /// Wraps an existing token.
    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Account role as reported by the identity API.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserRole {
    User,
    Admin,
}

/// Role-derived channel target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChannelTarget {
    /// Personal channel of one user.
    User { user_id: String },
    /// Shared admin channel.
    Admin,
}

impl ChannelTarget {
    /// Returns the websocket path for this target and client.
    pub fn path(&self, client_id: &ClientId) -> String {
        match self {
            Self::User { user_id } => format!("/ws/user/{user_id}/{client_id}"),
            Self::Admin => format!("/ws/admin/{client_id}"),
        }
    }
}

/// Immutable identity of the logged-in account.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionIdentity {
    /// Business user id used in the user channel path.
    pub user_id: String,
    /// Account role, selects the admin or user channel.
    pub role: UserRole,
}

impl SessionIdentity {
    pub fn new(user_id: impl Into<String>, role: UserRole) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    /// Admins connect to the admin channel, everyone else to their own.
    pub fn target(&self) -> ChannelTarget {
        match self.role {
            UserRole::Admin => ChannelTarget::Admin,
            UserRole::User => ChannelTarget::User {
                user_id: self.user_id.clone(),
            },
        }
    }
}
