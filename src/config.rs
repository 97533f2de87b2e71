use serde::{Deserialize, Serialize};

use crate::error::{TfsError, TfsResult};

/// Runtime knobs of a TFS context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TfsConfig {
    /// Number of open-file slots.
    pub max_open: usize,
    /// Treat a record whose flags word reads zero as a valid, deleted
    /// record (older monitors deleted by zeroing the flags).
    pub legacy_delete_compat: bool,
    /// Allow add() and the control call to run the defragmenter.
    pub defrag_enabled: bool,
    /// Resolve `0x<addr>[,<size>]` names to synthetic headers.
    pub fake_headers: bool,
    /// Access level (0..=3) of the current user.
    pub user_level: u8,
}

impl Default for TfsConfig {
    fn default() -> Self {
        Self {
            max_open: 10,
            legacy_delete_compat: false,
            defrag_enabled: true,
            fake_headers: false,
            user_level: 3,
        }
    }
}

impl TfsConfig {
    /// Parse a JSON configuration document; missing keys keep their defaults.
    pub fn from_json(data: &[u8]) -> TfsResult<Self> {
        let cfg: TfsConfig = serde_json::from_slice(data).map_err(|e| {
            log::error!("tfs config: {}", e);
            TfsError::BadArgument
        })?;
        if cfg.max_open == 0 || cfg.user_level > 3 {
            return Err(TfsError::BadArgument);
        }
        Ok(cfg)
    }
}
