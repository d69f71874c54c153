//! Identity verification for sockets and REST calls.
//!
//! Tokens are issued by the external auth service; this crate only verifies them.

pub mod jwt;
pub mod middleware;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role carried by every verified identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Driver,
    /// A passenger.
    User,
    Admin,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Driver, Role::User, Role::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Driver => "driver",
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "driver" => Ok(Self::Driver),
            "user" | "passenger" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}
