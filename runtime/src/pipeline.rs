//! Pipeline driver.
//!
//! Sequences Fetch → Extract → Inject → Configure → Commit. Each stage runs to
//! completion before the next starts; the first failure stops the run and is
//! returned together with the stage it happened in.

use std::path::Path;
use std::sync::Arc;

use a3s_bake_core::config::{BakeConfig, LayerSource};
use a3s_bake_core::error::{BakeError, Result};
use thiserror::Error;

use crate::archive::{extract_archive, read_archive};
use crate::fetch::ArchiveFetcher;
use crate::oci::{Destination, ImagePuller, ImageStore, RegistryPusher};
use crate::session::{default_command, BuildOptions, BuildSession, CommitResult, LayerPayload};

/// Pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Fetching,
    Extracting,
    Injecting,
    Configuring,
    Committing,
    Done,
    Failed,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineStage::Fetching => "fetch",
            PipelineStage::Extracting => "extract",
            PipelineStage::Injecting => "inject",
            PipelineStage::Configuring => "configure",
            PipelineStage::Committing => "commit",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// A run that stopped at `stage` because of `error`.
#[derive(Error, Debug)]
#[error("{stage} failed: {error}")]
pub struct PipelineFailure {
    /// Stage that was running when the error occurred
    pub stage: PipelineStage,
    /// The originating error
    #[source]
    pub error: BakeError,
}

/// Drives one image build from archive URL to committed image.
pub struct Pipeline {
    config: BakeConfig,
    store: Arc<ImageStore>,
    fetcher: ArchiveFetcher,
    stage: PipelineStage,
}

impl Pipeline {
    /// Create a pipeline over an open image store.
    pub fn new(config: BakeConfig, store: Arc<ImageStore>) -> Self {
        Self {
            config,
            store,
            fetcher: ArchiveFetcher::new(),
            stage: PipelineStage::Fetching,
        }
    }

    /// Current state.
    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// Run every stage in order.
    ///
    /// The per-run work directory is removed on return, whatever the outcome.
    /// A pipeline runs once; `Done` and `Failed` are terminal.
    pub async fn run(&mut self) -> std::result::Result<CommitResult, PipelineFailure> {
        if matches!(self.stage, PipelineStage::Done | PipelineStage::Failed) {
            return Err(PipelineFailure {
                stage: self.stage,
                error: BakeError::ConfigError(format!(
                    "pipeline already finished ({})",
                    self.stage
                )),
            });
        }

        let run_dir = self.create_run_dir();
        let run_dir = self.check(run_dir)?;

        let result = self.run_stages(run_dir.path()).await;

        let run_path = run_dir.path().to_path_buf();
        if let Err(e) = run_dir.close() {
            tracing::warn!(
                dir = %run_path.display(),
                error = %e,
                "Failed to remove run directory"
            );
        }

        match &result {
            Ok(commit) => {
                self.stage = PipelineStage::Done;
                tracing::info!(
                    image_id = %commit.image_id,
                    destination = %commit.destination,
                    "Pipeline finished"
                );
            }
            Err(failure) => {
                tracing::error!(stage = %failure.stage, error = %failure.error, "Pipeline failed");
            }
        }
        result
    }

    async fn run_stages(
        &mut self,
        run_dir: &Path,
    ) -> std::result::Result<CommitResult, PipelineFailure> {
        self.enter(PipelineStage::Fetching);
        let archive_path = run_dir.join(&self.config.archive_name);
        let fetched = self
            .fetcher
            .fetch(&self.config.fetch_url, &archive_path)
            .await;
        let archive = self.check(fetched)?;

        self.enter(PipelineStage::Extracting);
        let payload = match self.config.layer_source {
            LayerSource::Extracted => {
                extract_archive(&archive.path, &run_dir.join("extracted")).map(LayerPayload::Tree)
            }
            LayerSource::Archive => read_archive(&archive.path).map(LayerPayload::Entries),
        };
        let payload = self.check(payload)?;
        let removed = std::fs::remove_file(&archive.path).map_err(BakeError::from);
        self.check(removed)?;

        self.enter(PipelineStage::Injecting);
        let puller = ImagePuller::new(self.store.clone(), &self.config.insecure_registries);
        let options = BuildOptions {
            from_image: self.config.base_image.clone(),
            capabilities: self.config.capabilities.clone(),
            work_dir: Some(run_dir.to_path_buf()),
        };
        let session = BuildSession::from_image(&puller, options).await;
        let mut session = self.check(session)?;
        let added = session
            .add_layer(&payload, Path::new(&self.config.content_dir), self.config.owner)
            .map(|_| ());
        self.check(added)?;
        drop(payload);

        self.enter(PipelineStage::Configuring);
        let configured = session.set_cmd(default_command(
            &self.config.content_dir,
            &self.config.mount_path,
        ));
        self.check(configured)?;

        self.enter(PipelineStage::Committing);
        let destination = Destination::parse(&self.config.destination);
        let destination = self.check(destination)?;
        let pusher = RegistryPusher::new(&self.config.insecure_registries);
        let committed = session.commit(&destination, &self.store, &pusher).await;
        self.check(committed)
    }

    fn create_run_dir(&self) -> Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("a3s-bake-run-");
        let created = match &self.config.work_dir {
            Some(parent) => std::fs::create_dir_all(parent).and_then(|()| builder.tempdir_in(parent)),
            None => builder.tempdir(),
        };
        created.map_err(|e| BakeError::ArchiveWriteError {
            path: self
                .config
                .work_dir
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| std::env::temp_dir().display().to_string()),
            message: format!("Failed to create run directory: {}", e),
        })
    }

    fn enter(&mut self, stage: PipelineStage) {
        self.stage = stage;
        tracing::info!(stage = %stage, "Entering stage");
    }

    /// Record a stage outcome; an error moves the pipeline to `Failed`.
    fn check<T>(&mut self, result: Result<T>) -> std::result::Result<T, PipelineFailure> {
        result.map_err(|error| {
            let stage = self.stage;
            self.stage = PipelineStage::Failed;
            PipelineFailure { stage, error }
        })
    }
}
