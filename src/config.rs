use std::{path::PathBuf, str::FromStr, time::Duration};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Where uploaded assets are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageMode {
    /// In process memory, served at `/assets`. Useful for demos and tests.
    Memory,
    /// Files under `assets_root`, served at `/assets`.
    Local,
    /// An S3 bucket, served by S3 itself.
    ObjectStorage { bucket: String, region: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub assets_root: PathBuf,
    pub storage: StorageMode,
    pub database_url: String,
    pub ffprobe_path: PathBuf,
    pub probe_timeout: Duration,
}

impl Config {
    /// Reads the process environment, after loading `.env` if there is one.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| dotenv::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = parse_or(&lookup, "PORT", 8091)?;
        let assets_root = lookup("ASSETS_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("assets"));
        let storage = match lookup("STORAGE_MODE").as_deref().unwrap_or("local") {
            "memory" => StorageMode::Memory,
            "local" => StorageMode::Local,
            "s3" => StorageMode::ObjectStorage {
                bucket: lookup("S3_BUCKET").ok_or(Error::Missing("S3_BUCKET"))?,
                region: lookup("S3_REGION").ok_or(Error::Missing("S3_REGION"))?,
            },
            other => {
                return Err(Error::Invalid {
                    name: "STORAGE_MODE",
                    value: other.to_string(),
                })
            }
        };
        let database_url = lookup("DATABASE_URL").ok_or(Error::Missing("DATABASE_URL"))?;
        let ffprobe_path = lookup("FFPROBE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("ffprobe"));
        let probe_timeout = Duration::from_secs(parse_or(&lookup, "PROBE_TIMEOUT_SECS", 30)?);
        Ok(Self {
            port,
            assets_root,
            storage,
            database_url,
            ffprobe_path,
            probe_timeout,
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T> {
    match lookup(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| Error::Invalid { name, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = config(&[("DATABASE_URL", "sqlite::memory:")]).unwrap();
        assert_eq!(config.port, 8091);
        assert_eq!(config.assets_root, PathBuf::from("assets"));
        assert_eq!(config.storage, StorageMode::Local);
        assert_eq!(config.ffprobe_path, PathBuf::from("ffprobe"));
        assert_eq!(config.probe_timeout, Duration::from_secs(30));
    }

    #[test]
    fn object_storage_needs_bucket_and_region() {
        let err = config(&[("DATABASE_URL", "sqlite::memory:"), ("STORAGE_MODE", "s3")])
            .unwrap_err();
        assert!(matches!(err, Error::Missing("S3_BUCKET")));

        let config = config(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("STORAGE_MODE", "s3"),
            ("S3_BUCKET", "tubely-1234"),
            ("S3_REGION", "us-east-2"),
        ])
        .unwrap();
        assert_eq!(
            config.storage,
            StorageMode::ObjectStorage {
                bucket: "tubely-1234".to_string(),
                region: "us-east-2".to_string()
            }
        );
    }

    #[test]
    fn invalid_values() {
        assert!(matches!(config(&[]), Err(Error::Missing("DATABASE_URL"))));
        assert!(matches!(
            config(&[("DATABASE_URL", "x"), ("PORT", "eighty")]),
            Err(Error::Invalid { name: "PORT", .. })
        ));
        assert!(matches!(
            config(&[("DATABASE_URL", "x"), ("STORAGE_MODE", "ftp")]),
            Err(Error::Invalid { name: "STORAGE_MODE", .. })
        ));
    }
}
