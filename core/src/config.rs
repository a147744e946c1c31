use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BakeError, Result};

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BakeConfig {
    /// URL of the gzip-compressed tar archive to embed
    pub fetch_url: String,

    /// Destination reference (`docker://`, `containers-storage:` or `oci:`)
    pub destination: String,

    /// Base image the working container starts from (`scratch` for an empty image)
    pub base_image: String,

    /// Build-time path inside the image that receives the archive contents
    pub content_dir: String,

    /// Runtime path the default command copies the contents to
    pub mount_path: String,

    /// File name the downloaded archive is saved under
    pub archive_name: String,

    /// Parent directory for the per-run scratch directory (system temp dir if unset)
    pub work_dir: Option<PathBuf>,

    /// Local image store directory
    pub store_dir: PathBuf,

    /// Ownership applied to every entry of the injected layer
    pub owner: Ownership,

    /// How the archive is turned into a layer
    pub layer_source: LayerSource,

    /// Capabilities recorded for the working container
    pub capabilities: Vec<String>,

    /// Registries reached over plain HTTP (e.g. "localhost:5000")
    pub insecure_registries: Vec<String>,

    /// Log level
    pub log_level: LogLevel,
}

impl Default for BakeConfig {
    fn default() -> Self {
        Self {
            fetch_url: "https://api.openshift.com/api/upgrades_info/graph-data".to_string(),
            destination: "docker://localhost:5000/graph-image".to_string(),
            base_image: "registry.access.redhat.com/ubi9/ubi:latest".to_string(),
            content_dir: "/var/lib/cincinnati-graph-data/".to_string(),
            mount_path: "/var/lib/cincinnati/graph-data".to_string(),
            archive_name: "cincinnati-graph-data.tar.gz".to_string(),
            work_dir: None,
            store_dir: default_store_dir(),
            owner: Ownership::default(),
            layer_source: LayerSource::Extracted,
            capabilities: Self::default_capabilities(),
            insecure_registries: vec!["localhost:5000".to_string()],
            log_level: LogLevel::Info,
        }
    }
}

impl BakeConfig {
    /// Load configuration from a YAML file.
    ///
    /// Missing keys fall back to their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BakeError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: BakeConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Check that the configuration can drive a pipeline run.
    pub fn validate(&self) -> Result<()> {
        if self.fetch_url.trim().is_empty() {
            return Err(BakeError::ConfigError("fetch_url is empty".to_string()));
        }
        if self.base_image.trim().is_empty() {
            return Err(BakeError::ConfigError("base_image is empty".to_string()));
        }
        if !self.content_dir.starts_with('/') {
            return Err(BakeError::ConfigError(format!(
                "content_dir must be an absolute path, got '{}'",
                self.content_dir
            )));
        }
        if !self.mount_path.starts_with('/') {
            return Err(BakeError::ConfigError(format!(
                "mount_path must be an absolute path, got '{}'",
                self.mount_path
            )));
        }
        let name = Path::new(&self.archive_name);
        if self.archive_name.is_empty() || name.file_name() != Some(name.as_os_str()) {
            return Err(BakeError::ConfigError(format!(
                "archive_name must be a plain file name, got '{}'",
                self.archive_name
            )));
        }
        Ok(())
    }

    /// Default capability set granted to root in a build container.
    fn default_capabilities() -> Vec<String> {
        [
            "CAP_CHOWN",
            "CAP_DAC_OVERRIDE",
            "CAP_FOWNER",
            "CAP_FSETID",
            "CAP_KILL",
            "CAP_NET_BIND_SERVICE",
            "CAP_SETFCAP",
            "CAP_SETGID",
            "CAP_SETPCAP",
            "CAP_SETUID",
            "CAP_SYS_CHROOT",
        ]
        .iter()
        .map(|c| c.to_string())
        .collect()
    }
}

/// Return the default image store directory (~/.a3s/images).
pub fn default_store_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".a3s"))
        .unwrap_or_else(|| PathBuf::from(".a3s"))
        .join("images")
}

/// Owner applied to injected layer entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub uid: u64,
    pub gid: u64,
}

impl std::str::FromStr for Ownership {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (uid, gid) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid ownership '{}' (expected UID:GID)", s))?;
        let uid = uid
            .parse()
            .map_err(|_| format!("invalid uid in '{}'", s))?;
        let gid = gid
            .parse()
            .map_err(|_| format!("invalid gid in '{}'", s))?;
        Ok(Self { uid, gid })
    }
}

impl std::fmt::Display for Ownership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

/// Layer source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayerSource {
    /// Extract to disk, then build the layer from the extracted tree
    Extracted,
    /// Read archive entries into memory and build the layer directly
    Archive,
}

impl std::str::FromStr for LayerSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "extracted" => Ok(Self::Extracted),
            "archive" => Ok(Self::Archive),
            _ => Err(format!(
                "unknown layer source: '{}' (supported: extracted, archive)",
                s
            )),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "unknown log level: '{}' (supported: debug, info, warn, error)",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = BakeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.owner, Ownership { uid: 0, gid: 0 });
        assert_eq!(config.layer_source, LayerSource::Extracted);
        assert!(config.capabilities.contains(&"CAP_CHOWN".to_string()));
    }

    #[test]
    fn test_from_file_partial_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bake.yaml");
        std::fs::write(
            &path,
            "fetch_url: http://127.0.0.1:8080/data.tar.gz\n\
             destination: containers-storage:graph-image\n\
             owner:\n  uid: 1001\n  gid: 0\n\
             layer_source: archive\n\
             log_level: debug\n",
        )
        .unwrap();

        let config = BakeConfig::from_file(&path).unwrap();
        assert_eq!(config.fetch_url, "http://127.0.0.1:8080/data.tar.gz");
        assert_eq!(config.destination, "containers-storage:graph-image");
        assert_eq!(config.owner, Ownership { uid: 1001, gid: 0 });
        assert_eq!(config.layer_source, LayerSource::Archive);
        assert_eq!(config.log_level, LogLevel::Debug);
        // Unspecified keys keep their defaults
        assert_eq!(config.mount_path, "/var/lib/cincinnati/graph-data");
    }

    #[test]
    fn test_from_file_missing() {
        let tmp = TempDir::new().unwrap();
        let err = BakeConfig::from_file(&tmp.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, BakeError::ConfigError(_)));
    }

    #[test]
    fn test_from_file_invalid_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bake.yaml");
        std::fs::write(&path, "owner: [1, 2").unwrap();
        let err = BakeConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, BakeError::SerializationError(_)));
    }

    #[test]
    fn test_validate_relative_content_dir() {
        let config = BakeConfig {
            content_dir: "var/lib/data".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(BakeError::ConfigError(_))));
    }

    #[test]
    fn test_validate_relative_mount_path() {
        let config = BakeConfig {
            mount_path: "graph-data".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_archive_name_with_directory() {
        let config = BakeConfig {
            archive_name: "../data.tar.gz".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_url() {
        let config = BakeConfig {
            fetch_url: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ownership_parse() {
        let owner: Ownership = "1001:2002".parse().unwrap();
        assert_eq!(owner, Ownership { uid: 1001, gid: 2002 });
        assert_eq!(owner.to_string(), "1001:2002");
    }

    #[test]
    fn test_ownership_parse_invalid() {
        assert!("1001".parse::<Ownership>().is_err());
        assert!("root:root".parse::<Ownership>().is_err());
    }

    #[test]
    fn test_layer_source_parse() {
        assert_eq!("extracted".parse::<LayerSource>(), Ok(LayerSource::Extracted));
        assert_eq!("archive".parse::<LayerSource>(), Ok(LayerSource::Archive));
        assert!("tarball".parse::<LayerSource>().is_err());
    }

    #[test]
    fn test_log_level_parse_and_display() {
        assert_eq!("WARN".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!(LogLevel::Debug.to_string(), "debug");
        assert!("verbose".parse::<LogLevel>().is_err());
    }
}
