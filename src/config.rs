use std::path::PathBuf;

use anyhow::{anyhow, Result};

pub const DEFAULT_PORT: u16 = 10000;
pub const DEFAULT_MODEL_DIR: &str = "./models";
pub const DEFAULT_MODEL_NAME: &str = "examsathi-model";
pub const DEFAULT_MAX_NEW_TOKENS: usize = 256;
pub const DEFAULT_DRIVE_URL: &str = "https://drive.google.com/uc";

/// Server settings, read once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Google Drive file id (or share link) of the zipped model.
    pub model_file_id: Option<String>,
    pub model_dir: PathBuf,
    pub model_name: String,
    /// `cpu`, `cuda`, `cuda:N`; unset picks CUDA when present.
    pub device: Option<String>,
    pub generation_seed: Option<u64>,
    pub max_new_tokens: usize,
    pub drive_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            model_file_id: None,
            model_dir: PathBuf::from(DEFAULT_MODEL_DIR),
            model_name: DEFAULT_MODEL_NAME.into(),
            device: None,
            generation_seed: None,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            drive_url: DEFAULT_DRIVE_URL.into(),
        }
    }
}

impl ServerConfig {
    /// Loads `.env` when present, then reads the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| dotenvy::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let defaults = Self::default();

        Ok(Self {
            host: get("HOST").unwrap_or(defaults.host),
            port: parse_or("PORT", get("PORT"), defaults.port)?,
            model_file_id: get("MODEL_FILE_ID"),
            model_dir: get("MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_dir),
            model_name: get("MODEL_NAME").unwrap_or(defaults.model_name),
            device: get("DEVICE"),
            generation_seed: get("GENERATION_SEED")
                .map(|raw| parse_value("GENERATION_SEED", &raw))
                .transpose()?,
            max_new_tokens: parse_or(
                "MAX_NEW_TOKENS",
                get("MAX_NEW_TOKENS"),
                defaults.max_new_tokens,
            )?,
            drive_url: get("DRIVE_DOWNLOAD_URL").unwrap_or(defaults.drive_url),
        })
    }

    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(&self.model_name)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T> {
    match raw {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| anyhow!("{key} has an invalid value: {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<ServerConfig> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_env_is_empty() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.port, 10000);
        assert!(cfg.model_file_id.is_none());
        assert_eq!(cfg.model_path(), PathBuf::from("./models/examsathi-model"));
        assert_eq!(cfg.bind_addr(), "0.0.0.0:10000");
        assert_eq!(cfg.max_new_tokens, 256);
    }

    #[test]
    fn blank_file_id_counts_as_unset() {
        let cfg = config_from(&[("MODEL_FILE_ID", "   ")]).unwrap();
        assert!(cfg.model_file_id.is_none());
    }

    #[test]
    fn reads_overrides() {
        let cfg = config_from(&[
            ("MODEL_FILE_ID", "abc123"),
            ("PORT", "8080"),
            ("MODEL_DIR", "/srv/models"),
            ("MODEL_NAME", "tuned"),
            ("DEVICE", "cpu"),
            ("GENERATION_SEED", "42"),
        ])
        .unwrap();
        assert_eq!(cfg.model_file_id.as_deref(), Some("abc123"));
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.model_path(), PathBuf::from("/srv/models/tuned"));
        assert_eq!(cfg.device.as_deref(), Some("cpu"));
        assert_eq!(cfg.generation_seed, Some(42));
    }

    #[test]
    fn rejects_bad_port() {
        let err = config_from(&[("PORT", "not-a-port")]).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }
}
