//! Authentication and authorization module
//!
//! Bearer JWTs carry a user id and a role. Handlers receive them as an
//! explicit [`AuthContext`] and check the role themselves.

mod jwt;
mod middleware;

pub use jwt::{create_token, decode_token, Claims};
pub use middleware::{require_role, AuthContext};

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Registrar roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Self-registering student; no access to migration tooling
    Student,
    /// Can look at migration state and backups
    Bookkeeper,
    /// Can run steps, roll back and purge backups
    Admin,
}

impl Role {
    pub fn can_inspect(&self) -> bool {
        matches!(self, Role::Bookkeeper | Role::Admin)
    }

    pub fn can_migrate(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::Student
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Student => write!(f, "student"),
            Role::Bookkeeper => write!(f, "bookkeeper"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "student" => Ok(Role::Student),
            "bookkeeper" => Ok(Role::Bookkeeper),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role `{}`", other)),
        }
    }
}
