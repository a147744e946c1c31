use thiserror::Error;

/// Archive extraction failures.
#[derive(Error, Debug)]
pub enum ExtractionError {
    /// Entry path resolves outside the destination root
    #[error("entry '{entry}' escapes the destination root")]
    PathTraversal { entry: String },

    /// Corrupt gzip or tar framing
    #[error("malformed archive {archive}: {message}")]
    Malformed { archive: String, message: String },

    /// Filesystem failure while materializing an entry
    #[error("failed to write {path}: {message}")]
    Io { path: String, message: String },
}

/// A3S Bake error types
#[derive(Error, Debug)]
pub enum BakeError {
    /// Archive download failed
    #[error("Fetch failed: {url} - {message}")]
    NetworkFetchError { url: String, message: String },

    /// Downloaded archive could not be persisted
    #[error("Archive write failed: {path} - {message}")]
    ArchiveWriteError { path: String, message: String },

    /// Archive could not be unpacked
    #[error("Extraction failed: {0}")]
    ExtractionError(#[from] ExtractionError),

    /// Destination string is not a recognized image reference
    #[error("Invalid image reference '{reference}': {message}")]
    ReferenceParseError { reference: String, message: String },

    /// Base image could not be located or pulled
    #[error("Base image resolution failed: {image} - {message}")]
    ImageResolutionError { image: String, message: String },

    /// Layer could not be added to the working container
    #[error("Layer injection failed: {0}")]
    LayerInjectionError(String),

    /// Image could not be committed to its destination
    #[error("Commit failed: {destination} - {message}")]
    CommitError { destination: String, message: String },

    /// OCI image error
    #[error("OCI image error: {0}")]
    OciImageError(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<serde_json::Error> for BakeError {
    fn from(err: serde_json::Error) -> Self {
        BakeError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for BakeError {
    fn from(err: serde_yaml::Error) -> Self {
        BakeError::SerializationError(err.to_string())
    }
}

/// Result type alias for A3S Bake operations
pub type Result<T> = std::result::Result<T, BakeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_fetch_error_display() {
        let error = BakeError::NetworkFetchError {
            url: "https://example.com/data.tar.gz".to_string(),
            message: "HTTP 500 Internal Server Error".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Fetch failed: https://example.com/data.tar.gz - HTTP 500 Internal Server Error"
        );
    }

    #[test]
    fn test_archive_write_error_display() {
        let error = BakeError::ArchiveWriteError {
            path: "/tmp/data.tar.gz".to_string(),
            message: "No space left on device".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Archive write failed: /tmp/data.tar.gz - No space left on device"
        );
    }

    #[test]
    fn test_path_traversal_display() {
        let error: BakeError = ExtractionError::PathTraversal {
            entry: "../etc/passwd".to_string(),
        }
        .into();
        assert!(matches!(
            error,
            BakeError::ExtractionError(ExtractionError::PathTraversal { .. })
        ));
        assert_eq!(
            error.to_string(),
            "Extraction failed: entry '../etc/passwd' escapes the destination root"
        );
    }

    #[test]
    fn test_malformed_archive_display() {
        let error = ExtractionError::Malformed {
            archive: "data.tar.gz".to_string(),
            message: "invalid gzip header".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "malformed archive data.tar.gz: invalid gzip header"
        );
    }

    #[test]
    fn test_reference_parse_error_display() {
        let error = BakeError::ReferenceParseError {
            reference: "graph-image".to_string(),
            message: "missing transport".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid image reference 'graph-image': missing transport"
        );
    }

    #[test]
    fn test_image_resolution_error_display() {
        let error = BakeError::ImageResolutionError {
            image: "ubi9/ubi:latest".to_string(),
            message: "manifest unknown".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Base image resolution failed: ubi9/ubi:latest - manifest unknown"
        );
    }

    #[test]
    fn test_layer_injection_error_display() {
        let error = BakeError::LayerInjectionError("permission denied".to_string());
        assert_eq!(error.to_string(), "Layer injection failed: permission denied");
    }

    #[test]
    fn test_commit_error_display() {
        let error = BakeError::CommitError {
            destination: "docker://localhost:5000/graph-image".to_string(),
            message: "connection refused".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Commit failed: docker://localhost:5000/graph-image - connection refused"
        );
    }

    #[test]
    fn test_registry_error_display() {
        let error = BakeError::RegistryError {
            registry: "quay.io".to_string(),
            message: "manifest unknown".to_string(),
        };
        assert_eq!(error.to_string(), "Registry error: quay.io - manifest unknown");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: BakeError = io_error.into();
        assert!(matches!(error, BakeError::IoError(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let error: BakeError = result.unwrap_err().into();
        assert!(matches!(error, BakeError::SerializationError(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: BakeError = result.unwrap_err().into();
        assert!(matches!(error, BakeError::SerializationError(_)));
    }
}
