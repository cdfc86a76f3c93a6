//! Wallet configuration.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::types::U256;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("writing config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("chain_request_retry_after_secs must be at most {max}, got {value}")]
    RetryWindowTooLarge { value: u64, max: u64 },
}

/// Largest retry window a [chrono::Duration] can hold.
const MAX_RETRY_AFTER_SECS: u64 = i64::MAX as u64 / 1000;

/// Knobs of a [Wallet][crate::Wallet]. Every field is optional in the TOML
/// file.
///
/// ```toml
/// chain_id = "0x539"
/// skip_evm_validation = true
/// chain_request_retry_after_secs = 600
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub chain_id: U256,
    /// Don't ask the [TransitionValidator][crate::app::TransitionValidator]
    /// about incoming states.
    pub skip_evm_validation: bool,
    /// How long a submitted chain transaction blocks resubmission.
    pub chain_request_retry_after_secs: u64,
    /// Used when a channel is created without a challenge duration.
    pub default_challenge_duration: u64,
    /// Approve close objectives proposed by the other participants.
    pub auto_approve_close: bool,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            chain_id: U256::from(1337u64),
            skip_evm_validation: false,
            chain_request_retry_after_secs: 600,
            default_challenge_duration: 86400,
            auto_approve_close: true,
        }
    }
}

impl WalletConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        if config.chain_request_retry_after_secs > MAX_RETRY_AFTER_SECS {
            return Err(ConfigError::RetryWindowTooLarge {
                value: config.chain_request_retry_after_secs,
                max: MAX_RETRY_AFTER_SECS,
            });
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    pub fn retry_after(&self) -> chrono::Duration {
        let secs = self.chain_request_retry_after_secs.min(MAX_RETRY_AFTER_SECS);
        chrono::Duration::seconds(secs as i64)
    }
}
