use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// Maximum device name length, in characters.
pub const MAX_DEVICE_NAME_CHARS: usize = 63;

/// Stable identity of a device on the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Generates a fresh random identity.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    Offline,
    Connectable,
    Connected,
}

/// A known peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// Address of the peer's session listener.
    pub address: SocketAddr,
    pub reachability: Reachability,
}

impl Device {
    #[must_use]
    pub fn new(id: DeviceId, name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            id,
            name: name.into(),
            address,
            reachability: Reachability::Connectable,
        }
    }
}

/// Change notifications about the set of known peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Appeared(Device),
    Updated(Device),
    Disappeared(DeviceId),
}

impl DeviceEvent {
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        match self {
            Self::Appeared(d) | Self::Updated(d) => &d.id,
            Self::Disappeared(id) => id,
        }
    }
}

/// Validates a display name and returns it trimmed.
///
/// # Errors
///
/// Returns [`ErrorCode::InvalidDeviceName`] unless the trimmed name has
/// between 1 and [`MAX_DEVICE_NAME_CHARS`] characters.
pub fn validate_device_name(name: &str) -> Result<String, ErrorCode> {
    let trimmed = name.trim();
    let chars = trimmed.chars().count();
    if chars == 0 || chars > MAX_DEVICE_NAME_CHARS {
        return Err(ErrorCode::InvalidDeviceName);
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_empty_or_blank_name_when_validated_then_rejected() {
        assert_eq!(validate_device_name(""), Err(ErrorCode::InvalidDeviceName));
        assert_eq!(validate_device_name("   "), Err(ErrorCode::InvalidDeviceName));
    }

    #[test]
    fn given_63_char_name_when_validated_then_accepted_and_64_rejected() {
        let ok = "a".repeat(63);
        assert_eq!(validate_device_name(&ok).unwrap(), ok);
        assert_eq!(
            validate_device_name(&"a".repeat(64)),
            Err(ErrorCode::InvalidDeviceName)
        );
    }

    #[test]
    fn given_multibyte_name_when_validated_then_counts_characters_not_bytes() {
        let name = "设".repeat(63);
        assert!(name.len() > 63);
        assert!(validate_device_name(&name).is_ok());
    }

    #[test]
    fn given_padded_name_when_validated_then_trimmed() {
        assert_eq!(validate_device_name("  desk  ").unwrap(), "desk");
    }

    #[test]
    fn given_generated_ids_when_compared_then_distinct() {
        assert_ne!(DeviceId::generate(), DeviceId::generate());
    }
}
