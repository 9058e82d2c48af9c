//! Settings consumed from the external settings store.
//!
//! The store itself is out of scope; settings arrive either as a TOML file
//! (see [`Settings::load`]) or are assembled by the host application.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::device::{DeviceId, validate_device_name};
use crate::error::ErrorCode;
use crate::fs::validate_save_dir;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Broadcast beacons so everyone on the LAN can see this device.
    #[default]
    Everyone,
    /// Listen only.
    Hidden,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderAllowList {
    #[default]
    EveryoneOnLan,
    OnlyActiveCollaborators,
    None,
}

impl SenderAllowList {
    /// Whether an incoming transfer offer over a connected session may be
    /// surfaced to the user at all.
    #[must_use]
    pub fn admits_offers(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Which physical screen edge hands input over to the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenEdge {
    Left,
    #[default]
    Right,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Pick `name (N).ext` when the destination exists.
    #[default]
    Rename,
    Overwrite,
}

/// Directional policy applied by the peripheral/clipboard bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharePolicy {
    pub input_sharing: bool,
    pub clipboard_sharing: bool,
    pub screen_edge: ScreenEdge,
    pub sender_allow_list: SenderAllowList,
}

impl Default for SharePolicy {
    fn default() -> Self {
        Self {
            input_sharing: true,
            clipboard_sharing: true,
            screen_edge: ScreenEdge::default(),
            sender_allow_list: SenderAllowList::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub device_name: String,
    /// Generated on first use when absent.
    pub device_id: Option<DeviceId>,
    pub discovery_mode: DiscoveryMode,
    pub sender_allow_list: SenderAllowList,
    pub save_dir: PathBuf,
    pub collision_policy: CollisionPolicy,
    pub input_sharing: bool,
    pub clipboard_sharing: bool,
    pub screen_edge: ScreenEdge,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_name: "cooplink".into(),
            device_id: None,
            discovery_mode: DiscoveryMode::default(),
            sender_allow_list: SenderAllowList::default(),
            save_dir: std::env::temp_dir().join("cooplink"),
            collision_policy: CollisionPolicy::default(),
            input_sharing: true,
            clipboard_sharing: true,
            screen_edge: ScreenEdge::default(),
        }
    }
}

impl Settings {
    /// Reads settings from a TOML file. Keys missing from the file keep
    /// their default values.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse settings file {}", path.display()))
    }

    /// Validates user-editable values.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidDeviceName`] for a name outside 1–63 characters,
    /// [`ErrorCode::InvalidSaveLocation`] if the save directory is missing
    /// or not writable.
    pub fn validate(&self) -> Result<(), ErrorCode> {
        validate_device_name(&self.device_name)?;
        validate_save_dir(&self.save_dir)
    }

    /// Returns the configured device id, generating one if unset.
    pub fn device_id_or_generate(&mut self) -> DeviceId {
        self.device_id.get_or_insert_with(DeviceId::generate).clone()
    }

    #[must_use]
    pub fn share_policy(&self) -> SharePolicy {
        SharePolicy {
            input_sharing: self.input_sharing,
            clipboard_sharing: self.clipboard_sharing,
            screen_edge: self.screen_edge,
            sender_allow_list: self.sender_allow_list,
        }
    }
}
