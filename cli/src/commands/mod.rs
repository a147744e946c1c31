//! CLI command definitions and dispatch.

mod build;
mod images;
mod rmi;
mod version;

use std::path::Path;

use clap::{Parser, Subcommand};

/// A3S Bake: embed a remote data archive into a container image.
#[derive(Parser)]
#[command(name = "a3s-bake", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Fetch an archive and bake it into a new image
    Build(build::BuildArgs),
    /// List images in the local store
    Images(images::ImagesArgs),
    /// Remove images from the local store
    Rmi(rmi::RmiArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Open the local image store at `dir`.
pub(crate) fn open_image_store(
    dir: &Path,
) -> Result<a3s_bake_runtime::ImageStore, Box<dyn std::error::Error>> {
    let store = a3s_bake_runtime::ImageStore::open(dir)?;
    Ok(store)
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build(args) => build::execute(args).await,
        Command::Images(args) => images::execute(args).await,
        Command::Rmi(args) => rmi::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}
