// src/config.rs
// Environment-style configuration. The variable set is closed; anything
// else a deployment needs is a compile-time constant in its owning module.

use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::crypto::{SecretSeed, SeedError};

pub const DEFAULT_CHAIN_ID: u32 = 31337;
pub const DEFAULT_HTTP_PORT: u16 = 5000;
pub const DEFAULT_P2P_PORT: u16 = 30303;

/// Directories a data_dir must never resolve into.
const FORBIDDEN_DATA_DIRS: &[&str] = &[
    "/", "/bin", "/boot", "/dev", "/etc", "/lib", "/proc", "/root", "/run", "/sbin", "/sys",
    "/usr", "/var",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not a valid {expected}: {value}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("validator_key invalid: {0}")]
    BadValidatorKey(#[from] SeedError),
    #[error("data_dir '{0}' resolves to a system directory")]
    ForbiddenDataDir(String),
    #[error("validator_index {0} exceeds the 64-validator bound")]
    ValidatorIndexOutOfRange(i64),
}

#[derive(Debug)]
pub struct Config {
    pub chain_id: u32,
    pub network_name: String,
    /// Negative disables consensus participation (observer mode).
    pub validator_index: i64,
    pub validator_address: Option<[u8; 20]>,
    pub validator_key: Option<SecretSeed>,
    pub http_port: u16,
    pub p2p_port: u16,
    pub data_dir: PathBuf,
    pub peers: Vec<String>,
    pub use_pipelining: bool,
    pub use_sandbox: bool,
}

impl Config {
    pub fn consensus_enabled(&self) -> bool {
        self.validator_index >= 0 && self.validator_key.is_some()
    }

    pub fn validator_slot(&self) -> Option<u8> {
        if self.validator_index >= 0 {
            Some(self.validator_index as u8)
        } else {
            None
        }
    }

    /// Read the closed variable set from the environment. Every failure
    /// here is fatal at start-up (exit code 1).
    pub fn from_env() -> Result<Self, ConfigError> {
        let chain_id = parse_or("chain_id", DEFAULT_CHAIN_ID, "u32")?;
        let network_name = env_var("network_name").unwrap_or_else(|| "basalt".to_string());

        let validator_index: i64 = parse_or("validator_index", -1, "integer")?;
        if validator_index >= crate::validators::MAX_VALIDATORS as i64 {
            return Err(ConfigError::ValidatorIndexOutOfRange(validator_index));
        }

        let validator_address = match env_var("validator_address") {
            Some(raw) => Some(parse_address(&raw)?),
            None => None,
        };
        let validator_key = match env_var("validator_key") {
            Some(raw) => Some(SecretSeed::from_hex(&raw)?),
            None => None,
        };

        let http_port = parse_or("http_port", DEFAULT_HTTP_PORT, "port")?;
        let p2p_port = parse_or("p2p_port", DEFAULT_P2P_PORT, "port")?;

        let data_dir = PathBuf::from(env_var("data_dir").unwrap_or_else(|| "./data".to_string()));
        check_data_dir(&data_dir)?;

        let peers = env_var("peers")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            chain_id,
            network_name,
            validator_index,
            validator_address,
            validator_key,
            http_port,
            p2p_port,
            data_dir,
            peers,
            use_pipelining: parse_bool("use_pipelining"),
            use_sandbox: parse_bool("use_sandbox"),
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    // accept both spellings; deployments use upper-case
    env::var(name)
        .or_else(|_| env::var(name.to_uppercase()))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn parse_or<T: std::str::FromStr>(
    var: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match env_var(var) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            var,
            expected,
            value: raw,
        }),
        None => Ok(default),
    }
}

fn parse_bool(var: &'static str) -> bool {
    env_var(var)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn parse_address(raw: &str) -> Result<[u8; 20], ConfigError> {
    let invalid = || ConfigError::Invalid {
        var: "validator_address",
        expected: "20-byte hex",
        value: raw.to_string(),
    };
    let decoded = hex::decode(raw.trim().trim_start_matches("0x")).map_err(|_| invalid())?;
    decoded.try_into().map_err(|_| invalid())
}

fn check_data_dir(dir: &Path) -> Result<(), ConfigError> {
    // canonicalise when possible so "../.." tricks do not slip through
    let resolved = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    for forbidden in FORBIDDEN_DATA_DIRS {
        if resolved == Path::new(forbidden) {
            return Err(ConfigError::ForbiddenDataDir(dir.display().to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_dirs_are_rejected() {
        assert!(check_data_dir(Path::new("/etc")).is_err());
        assert!(check_data_dir(Path::new("/")).is_err());
        assert!(check_data_dir(Path::new("./data")).is_ok());
        assert!(check_data_dir(Path::new("/etc/../etc")).is_err());
    }

    #[test]
    fn address_parsing() {
        assert!(parse_address(&"ab".repeat(20)).is_ok());
        assert!(parse_address(&format!("0x{}", "ab".repeat(20))).is_ok());
        assert!(parse_address("zz").is_err());
        assert!(parse_address(&"ab".repeat(19)).is_err());
    }
}
