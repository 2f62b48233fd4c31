use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("environment error: {0}")]
    Env(#[from] envy::Error),

    #[error("invalid size suffix: {0}")]
    InvalidSize(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Byte count parsed from a suffix string such as `500M`, `1.5G` or a
/// plain number of bytes. Suffixes are binary (K = 1024).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeSuffix(pub u64);

impl SizeSuffix {
    pub fn bytes(&self) -> u64 {
        self.0
    }
}

impl FromStr for SizeSuffix {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConfigError::InvalidSize(s.to_string()));
        }

        let lower = s.to_ascii_lowercase();
        let lower = lower.strip_suffix('b').unwrap_or(lower.as_str());

        let (num, multiplier) = match lower.chars().last() {
            Some('k') => (&lower[..lower.len() - 1], 1u64 << 10),
            Some('m') => (&lower[..lower.len() - 1], 1u64 << 20),
            Some('g') => (&lower[..lower.len() - 1], 1u64 << 30),
            Some('t') => (&lower[..lower.len() - 1], 1u64 << 40),
            _ => (lower, 1u64),
        };

        let value: f64 = num
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidSize(s.to_string()))?;
        if value < 0.0 {
            return Err(ConfigError::InvalidSize(s.to_string()));
        }

        Ok(SizeSuffix((value * multiplier as f64) as u64))
    }
}

impl fmt::Display for SizeSuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for SizeSuffix {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

fn default_part_size() -> SizeSuffix {
    // 1000 MiB
    SizeSuffix(1000 * (1u64 << 20))
}

fn default_workers() -> usize {
    4
}

fn default_transfers() -> usize {
    4
}

fn default_randomise_part() -> bool {
    true
}

/// Runtime configuration, loaded from `upload.env` and the process
/// environment. Field names map one-to-one to upper-case variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub api_url: String,
    pub session_token: String,

    #[serde(default = "default_part_size")]
    pub part_size: SizeSuffix,

    #[serde(default)]
    pub channel_id: i64,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_transfers")]
    pub transfers: usize,

    #[serde(default = "default_randomise_part")]
    pub randomise_part: bool,

    #[serde(default)]
    pub encrypt_files: bool,

    #[serde(default)]
    pub delete_after_upload: bool,

    #[serde(default)]
    pub debug: bool,
}

impl Config {
    /// Load configuration, sourcing `upload.env` first when present so a
    /// plain process environment keeps working without one.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::from_filename("upload.env");
        Ok(envy::from_env::<Config>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_suffix_parsing() {
        assert_eq!("500M".parse::<SizeSuffix>().unwrap().bytes(), 500 << 20);
        assert_eq!("1G".parse::<SizeSuffix>().unwrap().bytes(), 1 << 30);
        assert_eq!("64k".parse::<SizeSuffix>().unwrap().bytes(), 64 << 10);
        assert_eq!("1024".parse::<SizeSuffix>().unwrap().bytes(), 1024);
        assert_eq!("2GB".parse::<SizeSuffix>().unwrap().bytes(), 2 << 30);
        assert_eq!(
            "1.5G".parse::<SizeSuffix>().unwrap().bytes(),
            (1.5 * (1u64 << 30) as f64) as u64
        );
    }

    #[test]
    fn test_size_suffix_rejects_garbage() {
        assert!("".parse::<SizeSuffix>().is_err());
        assert!("-5M".parse::<SizeSuffix>().is_err());
        assert!("abc".parse::<SizeSuffix>().is_err());
    }

    #[test]
    fn test_config_defaults() {
        let vars = vec![
            ("API_URL".to_string(), "http://localhost:8080".to_string()),
            ("SESSION_TOKEN".to_string(), "secret".to_string()),
        ];
        let config: Config = envy::from_iter(vars).unwrap();

        assert_eq!(config.part_size.bytes(), 1000 << 20);
        assert_eq!(config.workers, 4);
        assert_eq!(config.transfers, 4);
        assert!(config.randomise_part);
        assert!(!config.encrypt_files);
        assert!(!config.delete_after_upload);
        assert!(!config.debug);
        assert_eq!(config.channel_id, 0);
    }

    #[test]
    fn test_config_overrides() {
        let vars = vec![
            ("API_URL".to_string(), "http://localhost:8080".to_string()),
            ("SESSION_TOKEN".to_string(), "secret".to_string()),
            ("PART_SIZE".to_string(), "16M".to_string()),
            ("WORKERS".to_string(), "8".to_string()),
            ("RANDOMISE_PART".to_string(), "false".to_string()),
        ];
        let config: Config = envy::from_iter(vars).unwrap();

        assert_eq!(config.part_size.bytes(), 16 << 20);
        assert_eq!(config.workers, 8);
        assert!(!config.randomise_part);
    }

    #[test]
    fn test_missing_required_vars() {
        let vars = vec![("API_URL".to_string(), "http://localhost".to_string())];
        assert!(envy::from_iter::<_, Config>(vars).is_err());
    }
}
