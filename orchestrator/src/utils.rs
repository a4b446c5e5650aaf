//! Utility functions

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Version information for the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
    pub target: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("FLEETPLANE_GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("FLEETPLANE_BUILD_TIME").unwrap_or("unknown").to_string(),
        target: option_env!("FLEETPLANE_TARGET").unwrap_or("unknown").to_string(),
    }
}

/// Cooldown options for exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct CooldownOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for CooldownOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300), // 5 minutes
            multiplier: 2.0,
        }
    }
}

/// Calculate exponential backoff delay
pub fn calc_exp_backoff(options: &CooldownOptions, attempt: u32) -> Duration {
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let delay_secs = options.base_delay.as_secs_f64() * options.multiplier.powi(exponent);
    let capped_delay = delay_secs.min(options.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped_delay)
}

/// Calculate SHA256 hash of data
pub fn sha256_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Lowercase DNS-label form of `name`, at most `max_len` characters.
///
/// Characters outside `[a-z0-9-]` become `-`. Names that do not fit are cut
/// and suffixed with the first 8 hex digits of their sha256, so distinct
/// inputs stay distinct.
pub fn dns_label(name: &str, max_len: usize) -> String {
    let mut label: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();

    if label.len() > max_len {
        let suffix = &sha256_hash(name.as_bytes())[..8];
        label.truncate(max_len.saturating_sub(suffix.len() + 1));
        label = format!("{}-{}", label.trim_end_matches('-'), suffix);
    }

    label.trim_matches('-').to_string()
}

/// DNS-label name built from `parts` joined with `-`.
///
/// A part holding a `-` or anything [`dns_label`] rewrites makes the join
/// ambiguous (`a-b`/`c` and `a`/`b-c`), so such names carry the first 8 hex
/// digits of the sha256 of the raw parts.
pub fn joined_label(parts: &[&str], max_len: usize) -> String {
    let joined = parts.join("-");
    let plain = parts.iter().all(|part| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    });
    if plain {
        return dns_label(&joined, max_len);
    }

    let suffix = &sha256_hash(parts.join("\0").as_bytes())[..8];
    let head = dns_label(&joined, max_len.saturating_sub(suffix.len() + 1));
    if head.is_empty() {
        return suffix.to_string();
    }
    format!("{}-{}", head, suffix)
}

/// Hex encoding utilities
mod hex {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

    pub fn encode(data: impl AsRef<[u8]>) -> String {
        let data = data.as_ref();
        let mut result = String::with_capacity(data.len() * 2);
        for byte in data {
            result.push(HEX_CHARS[(byte >> 4) as usize] as char);
            result.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
        }
        result
    }
}
