//! `a3s-bake rmi` command.

use std::path::PathBuf;

use a3s_bake_core::config::{default_store_dir, LogLevel};
use clap::Args;

#[derive(Args)]
pub struct RmiArgs {
    /// Image references to remove
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Ignore images that are not in the store
    #[arg(short, long)]
    pub force: bool,

    /// Image store directory (defaults to ~/.a3s/images)
    #[arg(long)]
    pub store_dir: Option<PathBuf>,
}

pub async fn execute(args: RmiArgs) -> Result<(), Box<dyn std::error::Error>> {
    crate::init_tracing(LogLevel::Warn);

    let store_dir = args.store_dir.unwrap_or_else(default_store_dir);
    let store = super::open_image_store(&store_dir)?;

    let mut errors: Vec<String> = Vec::new();
    for reference in &args.images {
        match store.remove(&store_key(reference)).await {
            Ok(()) => println!("Removed: {reference}"),
            Err(_) if args.force => {}
            Err(e) => errors.push(format!("{reference}: {e}")),
        }
    }

    store.close().await?;

    if errors.is_empty() {
        Ok(())
    } else {
        let msg = errors.join("\n");
        Err(format!("Failed to remove image(s):\n{msg}").into())
    }
}

/// Key an image is stored under: the fully qualified reference when it parses.
fn store_key(reference: &str) -> String {
    a3s_bake_runtime::ImageReference::parse(reference)
        .map(|r| r.full_reference())
        .unwrap_or_else(|_| reference.to_string())
}
