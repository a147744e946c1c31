//! `a3s-bake build` command.

use std::path::PathBuf;
use std::sync::Arc;

use a3s_bake_core::config::{BakeConfig, LayerSource, LogLevel, Ownership};
use a3s_bake_runtime::Pipeline;
use clap::Args;

#[derive(Args, Debug, Default)]
pub struct BuildArgs {
    /// Destination (e.g. "docker://localhost:5000/graph-image",
    /// "containers-storage:graph-image:latest", "oci:/path/to/layout:tag")
    pub destination: Option<String>,

    /// YAML configuration file; flags override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// URL of the gzip tar archive to embed
    #[arg(long)]
    pub url: Option<String>,

    /// Base image ("scratch" for an empty image)
    #[arg(long = "from")]
    pub base_image: Option<String>,

    /// Path inside the image that receives the archive contents
    #[arg(long)]
    pub content_dir: Option<String>,

    /// Path the default command copies the contents to at run time
    #[arg(long)]
    pub mount_path: Option<String>,

    /// Owner of every injected entry, as UID:GID
    #[arg(long)]
    pub owner: Option<Ownership>,

    /// How the layer is built: "extracted" or "archive"
    #[arg(long)]
    pub layer_source: Option<LayerSource>,

    /// Parent directory for per-run scratch files
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Local image store directory
    #[arg(long)]
    pub store_dir: Option<PathBuf>,

    /// Registry reached over plain HTTP (repeatable)
    #[arg(long = "insecure-registry")]
    pub insecure_registries: Vec<String>,

    /// Log level: debug, info, warn, error
    #[arg(long)]
    pub log_level: Option<LogLevel>,

    /// Print only the image ID
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: BuildArgs) -> Result<(), Box<dyn std::error::Error>> {
    let quiet = args.quiet;
    let config = resolve_config(args)?;

    crate::init_tracing(if quiet { LogLevel::Error } else { config.log_level });

    let store = Arc::new(super::open_image_store(&config.store_dir)?);
    let mut pipeline = Pipeline::new(config, store.clone());
    let result = pipeline.run().await;
    drop(pipeline);

    if let Ok(store) = Arc::try_unwrap(store) {
        if let Err(e) = store.close().await {
            tracing::warn!(error = %e, "Failed to close image store");
        }
    }

    let commit = result?;
    if quiet {
        println!("{}", commit.image_id);
    } else {
        println!("Committed to {}", commit.destination);
        println!("Image ID: {}", commit.image_id);
    }
    Ok(())
}

/// Merge the config file (or defaults) with command-line overrides.
fn resolve_config(args: BuildArgs) -> Result<BakeConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => BakeConfig::from_file(path)?,
        None => BakeConfig::default(),
    };

    if let Some(destination) = args.destination {
        config.destination = destination;
    }
    if let Some(url) = args.url {
        config.fetch_url = url;
    }
    if let Some(base_image) = args.base_image {
        config.base_image = base_image;
    }
    if let Some(content_dir) = args.content_dir {
        config.content_dir = content_dir;
    }
    if let Some(mount_path) = args.mount_path {
        config.mount_path = mount_path;
    }
    if let Some(owner) = args.owner {
        config.owner = owner;
    }
    if let Some(layer_source) = args.layer_source {
        config.layer_source = layer_source;
    }
    if args.work_dir.is_some() {
        config.work_dir = args.work_dir;
    }
    if let Some(store_dir) = args.store_dir {
        config.store_dir = store_dir;
    }
    if !args.insecure_registries.is_empty() {
        config.insecure_registries = args.insecure_registries;
    }
    if let Some(log_level) = args.log_level {
        config.log_level = log_level;
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Cli, Command};
    use clap::Parser;
    use tempfile::TempDir;

    fn parse(argv: &[&str]) -> BuildArgs {
        let mut full = vec!["a3s-bake", "build"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Command::Build(args) => args,
            _ => panic!("expected build command"),
        }
    }

    #[test]
    fn test_defaults_without_flags() {
        let config = resolve_config(parse(&[])).unwrap();
        let defaults = BakeConfig::default();
        assert_eq!(config.destination, defaults.destination);
        assert_eq!(config.fetch_url, defaults.fetch_url);
        assert_eq!(config.owner, Ownership { uid: 0, gid: 0 });
    }

    #[test]
    fn test_flags_override() {
        let config = resolve_config(parse(&[
            "containers-storage:graph-image:test",
            "--url",
            "http://127.0.0.1:8080/data.tar.gz",
            "--from",
            "scratch",
            "--owner",
            "1001:0",
            "--layer-source",
            "archive",
            "--insecure-registry",
            "registry.local:5000",
            "--log-level",
            "debug",
        ]))
        .unwrap();

        assert_eq!(config.destination, "containers-storage:graph-image:test");
        assert_eq!(config.fetch_url, "http://127.0.0.1:8080/data.tar.gz");
        assert_eq!(config.base_image, "scratch");
        assert_eq!(config.owner, Ownership { uid: 1001, gid: 0 });
        assert_eq!(config.layer_source, LayerSource::Archive);
        assert_eq!(config.insecure_registries, vec!["registry.local:5000"]);
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_config_file_then_flags() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bake.yaml");
        std::fs::write(
            &path,
            "fetch_url: http://files.local/graph.tar.gz\nbase_image: scratch\nowner:\n  uid: 7\n  gid: 8\n",
        )
        .unwrap();

        let path_arg = path.display().to_string();
        let config = resolve_config(parse(&["-c", &path_arg, "--owner", "1001:0"])).unwrap();

        assert_eq!(config.fetch_url, "http://files.local/graph.tar.gz");
        assert_eq!(config.base_image, "scratch");
        assert_eq!(config.owner, Ownership { uid: 1001, gid: 0 });
    }

    #[test]
    fn test_invalid_owner_rejected_by_parser() {
        let result = Cli::try_parse_from(["a3s-bake", "build", "--owner", "root"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_mount_path_rejected() {
        let result = resolve_config(parse(&["--mount-path", "relative/path"]));
        assert!(result.is_err());
    }
}
