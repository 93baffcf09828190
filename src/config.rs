use std::path::Path;

use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};

/// Environment variable holding the path of a JSON [`StoreConfig`].
pub const PATH_ENV: &str = "S3_STORE_CONFIG";

fn default_force_path_style() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    #[serde(default = "default_force_path_style")]
    pub force_path_style: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            endpoint: None,
            region: None,
            access_key: None,
            secret_key: None,
            force_path_style: default_force_path_style(),
        }
    }
}

impl StoreConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            Error::configuration(format!("can't open {}: {}", path.display(), e))
        })?;
        serde_json::from_reader(file)
            .map_err(|e| Error::configuration(format!("can't parse {}: {}", path.display(), e)))
    }

    /// Reads the file named by [`PATH_ENV`], or returns the defaults when it isn't set.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(PATH_ENV) {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

/// Checks that the blob service endpoint is present and is an absolute URL.
pub fn parse_endpoint(endpoint: Option<&str>) -> Result<Url> {
    let endpoint = match endpoint.map(str::trim) {
        Some(e) if !e.is_empty() => e,
        _ => return Err(Error::configuration("the blob service URL is missing")),
    };

    let url = Url::parse(endpoint).map_err(|e| {
        Error::configuration(format!(
            "the blob service URL was not valid {}: {}",
            endpoint, e
        ))
    })?;

    if url.cannot_be_a_base() {
        return Err(Error::configuration(format!(
            "the blob service URL was not valid {}: not a hierarchical URL",
            endpoint
        )));
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_parse_endpoint() {
        let url = parse_endpoint(Some("http://localhost:9000")).unwrap();
        assert_eq!(url.host_str(), Some("localhost"));
        assert_eq!(url.port(), Some(9000));

        assert!(parse_endpoint(Some("https://s3.eu-west-1.amazonaws.com/")).is_ok());
    }

    #[test]
    fn test_parse_endpoint_rejects_garbage() {
        for endpoint in [None, Some(""), Some("   "), Some("not-a-url"), Some("/relative/path"), Some("mailto:someone")] {
            assert!(
                matches!(parse_endpoint(endpoint), Err(Error::Configuration { .. })),
                "{:?} should be rejected",
                endpoint
            );
        }
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"endpoint": "http://127.0.0.1:9000", "region": "eu-west-1", "access_key": "ak", "secret_key": "sk"}}"#
        )
        .unwrap();

        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.endpoint.as_deref(), Some("http://127.0.0.1:9000"));
        assert_eq!(config.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.access_key.as_deref(), Some("ak"));
        assert!(config.force_path_style);
    }

    #[test]
    fn test_config_from_bad_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            StoreConfig::from_file(file.path()),
            Err(Error::Configuration { .. })
        ));

        assert!(StoreConfig::from_file("/definitely/not/here.json").is_err());
    }
}
