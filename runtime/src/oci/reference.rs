//! Image reference and destination parsing.
//!
//! Parses image names like `quay.io/openshift/graph-data:4.15` into structured
//! components, and transport-qualified destinations such as
//! `docker://localhost:5000/graph-image` into a [`Destination`].

use std::path::PathBuf;

use a3s_bake_core::error::{BakeError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Registry push transport.
pub const REGISTRY_TRANSPORT: &str = "docker://";

/// Local image store transport.
pub const LOCAL_STORE_TRANSPORT: &str = "containers-storage:";

/// OCI image layout transport, in its long and short forms.
pub const OCI_TRANSPORT: &str = "oci://";
pub const OCI_TRANSPORT_SHORT: &str = "oci:";

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (e.g., "quay.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "openshift/graph-data")
    pub repository: String,
    /// Tag (e.g., "latest", "4.15")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `graph-image` → docker.io/library/graph-image:latest
    /// - `openshift/graph-data:4.15` → docker.io/openshift/graph-data:4.15
    /// - `localhost:5000/graph-image` → localhost:5000/graph-image:latest
    /// - `quay.io/org/image@sha256:abc...` → quay.io/org/image@sha256:abc...
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(BakeError::OciImageError("Empty image reference".to_string()));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name_tag, digest)) => {
                if !digest.contains(':') {
                    return Err(BakeError::OciImageError(format!(
                        "Invalid digest format in reference '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (name_tag, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (name, tag) = split_tag(name_tag);
        let (registry, repository) = Self::split_registry_repository(name)?;

        // Apply default tag if no tag and no digest
        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag.map(str::to_string),
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        if name.is_empty() {
            return Err(BakeError::OciImageError(
                "Empty repository in image reference".to_string(),
            ));
        }

        // The first component is a registry if it looks like a hostname
        if let Some((first, rest)) = name.split_once('/') {
            if first.contains('.') || first.contains(':') || first == "localhost" {
                if rest.is_empty() {
                    return Err(BakeError::OciImageError(format!(
                        "Empty repository in reference '{}'",
                        name
                    )));
                }
                return Ok((first.to_string(), rest.to_string()));
            }
        }

        let repository = if name.contains('/') {
            name.to_string()
        } else {
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Split `name[:tag]`, where the tag colon must follow the last `/`.
///
/// A bare `host:port` (digits only after the colon, no slash) is not a tag.
fn split_tag(name_tag: &str) -> (&str, Option<&str>) {
    let last_segment_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
    match name_tag[last_segment_start..].rfind(':') {
        Some(colon) => {
            let colon = last_segment_start + colon;
            let tag = &name_tag[colon + 1..];
            if last_segment_start == 0 && !tag.is_empty() && tag.chars().all(|c| c.is_ascii_digit())
            {
                (name_tag, None)
            } else {
                (&name_tag[..colon], Some(tag))
            }
        }
        None => (name_tag, None),
    }
}

/// A transport-qualified commit target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Push to a registry (`docker://registry/repository[:tag]`)
    Registry(ImageReference),
    /// Name within the local image store (`containers-storage:name[:tag]`)
    LocalStore(ImageReference),
    /// OCI image layout directory (`oci:path[:tag]` or `oci://path[:tag]`)
    OciLayout { path: PathBuf, tag: Option<String> },
}

impl Destination {
    /// Parse a destination string.
    ///
    /// The transport prefix is mandatory; unknown or missing prefixes are
    /// rejected with `ReferenceParseError`.
    pub fn parse(destination: &str) -> Result<Self> {
        let trimmed = destination.trim();
        let invalid = |message: String| BakeError::ReferenceParseError {
            reference: destination.to_string(),
            message,
        };

        if let Some(location) = trimmed.strip_prefix(REGISTRY_TRANSPORT) {
            let reference = ImageReference::parse(location).map_err(|e| invalid(e.to_string()))?;
            if reference.digest.is_some() {
                return Err(invalid(
                    "digest references cannot be used as push targets".to_string(),
                ));
            }
            return Ok(Destination::Registry(reference));
        }

        if let Some(location) = trimmed.strip_prefix(LOCAL_STORE_TRANSPORT) {
            let reference = ImageReference::parse(location).map_err(|e| invalid(e.to_string()))?;
            return Ok(Destination::LocalStore(reference));
        }

        let oci_location = trimmed
            .strip_prefix(OCI_TRANSPORT)
            .or_else(|| trimmed.strip_prefix(OCI_TRANSPORT_SHORT));
        if let Some(location) = oci_location {
            let (path, tag) = split_tag(location);
            if path.is_empty() {
                return Err(invalid("empty OCI layout path".to_string()));
            }
            if tag == Some("") {
                return Err(invalid("empty tag".to_string()));
            }
            return Ok(Destination::OciLayout {
                path: PathBuf::from(path),
                tag: tag.map(str::to_string),
            });
        }

        Err(invalid(format!(
            "unrecognized transport (expected {}, {} or {})",
            REGISTRY_TRANSPORT, LOCAL_STORE_TRANSPORT, OCI_TRANSPORT_SHORT
        )))
    }

    /// Transport name of this destination.
    pub fn transport(&self) -> &'static str {
        match self {
            Destination::Registry(_) => "docker",
            Destination::LocalStore(_) => "containers-storage",
            Destination::OciLayout { .. } => "oci",
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Registry(r) => write!(f, "{}{}", REGISTRY_TRANSPORT, r),
            Destination::LocalStore(r) => write!(f, "{}{}", LOCAL_STORE_TRANSPORT, r),
            Destination::OciLayout { path, tag } => {
                write!(f, "{}{}", OCI_TRANSPORT_SHORT, path.display())?;
                if let Some(tag) = tag {
                    write!(f, ":{}", tag)?;
                }
                Ok(())
            }
        }
    }
}

impl std::str::FromStr for Destination {
    type Err = BakeError;

    fn from_str(s: &str) -> Result<Self> {
        Destination::parse(s)
    }
}
