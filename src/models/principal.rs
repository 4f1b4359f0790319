use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Which side of the relay a connection speaks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Desktop,
    Mobile,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Desktop => f.write_str("desktop"),
            Role::Mobile => f.write_str("mobile"),
        }
    }
}

/// Authenticated identity of one connection, fixed at handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub account_id: Uuid,
    pub role: Role,
    pub device_id: Option<Uuid>,
    pub device_name: Option<String>,
}

impl Principal {
    pub fn mobile(account_id: Uuid) -> Self {
        Self {
            account_id,
            role: Role::Mobile,
            device_id: None,
            device_name: None,
        }
    }

    pub fn desktop(account_id: Uuid, device_id: Uuid, device_name: impl Into<String>) -> Self {
        Self {
            account_id,
            role: Role::Desktop,
            device_id: Some(device_id),
            device_name: Some(device_name.into()),
        }
    }

    pub fn is_desktop(&self) -> bool {
        self.role == Role::Desktop
    }
}
