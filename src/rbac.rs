//! Role based authorization.
//!
//! Roles form a chain `guest < user < admin < super_admin`; each role holds
//! every permission of the roles below it. The lookup is pure and fails closed
//! on any role name it does not recognise.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Guest,
    User,
    Admin,
    SuperAdmin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ReadFiles,
    WriteFiles,
    DeleteFiles,
    AdminPanel,
    UserManagement,
}

impl Permission {
    pub const ALL: [Self; 5] = [
        Self::ReadFiles,
        Self::WriteFiles,
        Self::DeleteFiles,
        Self::AdminPanel,
        Self::UserManagement,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadFiles => "read_files",
            Self::WriteFiles => "write_files",
            Self::DeleteFiles => "delete_files",
            Self::AdminPanel => "admin_panel",
            Self::UserManagement => "user_management",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Role {
    pub const ALL: [Self; 4] = [Self::Guest, Self::User, Self::Admin, Self::SuperAdmin];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Guest => "guest",
            Self::User => "user",
            Self::Admin => "admin",
            Self::SuperAdmin => "super_admin",
        }
    }

    #[must_use]
    pub const fn permissions(self) -> &'static [Permission] {
        use Permission::{AdminPanel, DeleteFiles, ReadFiles, WriteFiles};
        match self {
            Self::Guest => &[ReadFiles],
            Self::User => &[ReadFiles, WriteFiles],
            Self::Admin => &[ReadFiles, WriteFiles, DeleteFiles, AdminPanel],
            Self::SuperAdmin => &Permission::ALL,
        }
    }

    #[must_use]
    pub fn allows(self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| UnknownRole(s.to_string()))
    }
}

/// Lookup by role name. Unknown names hold no permission.
#[must_use]
pub fn has_permission(role: &str, permission: Permission) -> bool {
    role.parse::<Role>()
        .is_ok_and(|role| role.allows(permission))
}
