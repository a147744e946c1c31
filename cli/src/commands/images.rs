//! `a3s-bake images` command.

use std::path::PathBuf;

use a3s_bake_core::config::{default_store_dir, LogLevel};
use a3s_bake_runtime::StoredImage;
use clap::Args;

use crate::output;

/// Table columns; DIGEST is the manifest digest the store indexes by.
const HEADERS: [&str; 5] = ["REPOSITORY", "TAG", "DIGEST", "SIZE", "CREATED"];

#[derive(Args)]
pub struct ImagesArgs {
    /// Only show image references (one per line)
    #[arg(short, long)]
    pub quiet: bool,

    /// Image store directory (defaults to ~/.a3s/images)
    #[arg(long)]
    pub store_dir: Option<PathBuf>,
}

pub async fn execute(args: ImagesArgs) -> Result<(), Box<dyn std::error::Error>> {
    crate::init_tracing(LogLevel::Warn);

    let store_dir = args.store_dir.unwrap_or_else(default_store_dir);
    if !store_dir.exists() {
        if !args.quiet {
            println!("{}", output::new_table(&HEADERS));
        }
        return Ok(());
    }

    let store = super::open_image_store(&store_dir)?;
    let mut images = store.list().await;
    images.sort_by(|a, b| b.stored_at.cmp(&a.stored_at));

    if args.quiet {
        for image in &images {
            println!("{}", image.reference);
        }
        return Ok(());
    }

    let mut table = output::new_table(&HEADERS);
    for image in &images {
        table.add_row(image_row(image));
    }
    println!("{table}");
    Ok(())
}

/// Display cells for one stored image, in `HEADERS` order.
fn image_row(image: &StoredImage) -> Vec<String> {
    let (repository, tag) = split_reference(&image.reference);
    vec![
        repository,
        tag,
        output::short_digest(&image.digest),
        output::format_bytes(image.size_bytes),
        output::format_ago(&image.stored_at),
    ]
}

/// Split a stored reference into repository and tag columns.
fn split_reference(reference: &str) -> (String, String) {
    match a3s_bake_runtime::ImageReference::parse(reference) {
        Ok(r) => {
            let tag = r.tag.unwrap_or_else(|| "<none>".to_string());
            (format!("{}/{}", r.registry, r.repository), tag)
        }
        Err(_) => (reference.to_string(), "<none>".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_row_shows_manifest_digest() {
        let image = StoredImage {
            reference: "docker.io/library/graph-image:test".to_string(),
            digest: "sha256:0123456789abcdef0123456789abcdef".to_string(),
            size_bytes: 2048,
            stored_at: chrono::Utc::now(),
            path: PathBuf::from("/tmp/store/sha256/0123456789abcdef"),
        };

        let row = image_row(&image);
        assert_eq!(HEADERS[2], "DIGEST");
        assert_eq!(row[2], "sha256:0123456789ab");
        assert_eq!(row[0], "docker.io/library/graph-image");
        assert_eq!(row[1], "test");
        assert_eq!(row[3], "2.0 KB");
    }

    #[test]
    fn test_split_reference() {
        assert_eq!(
            split_reference("docker.io/library/graph-image:test"),
            (
                "docker.io/library/graph-image".to_string(),
                "test".to_string()
            )
        );
        assert_eq!(
            split_reference("localhost:5000/graph-image:latest"),
            ("localhost:5000/graph-image".to_string(), "latest".to_string())
        );
    }
}
