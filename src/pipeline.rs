//! `PipeZip`: register entries, build the archive, release the workspace

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::orchestrator::{BuildResult, Orchestrator};
use crate::probe::{self, Capabilities};
use crate::registry::{EntrySource, Registry};
use crate::workspace::{Teardown, Workspace};
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;
use tracing::{debug, warn};

/// Builds one ZIP archive from registered byte sources through named pipes
///
/// An instance is single-shot: once [`build`](Self::build) started, further
/// registrations and builds fail with a contract violation. The workspace is
/// removed by [`teardown`](Self::teardown), or when the instance is dropped.
///
/// ```no_run
/// use pipe_zip::{PipeZip, PipelineConfig};
///
/// let mut zip = PipeZip::new(PipelineConfig::default())?;
/// zip.register_bytes("a.txt", b"hello".to_vec())?;
/// zip.register_bytes("dir/b.txt", b"world".to_vec())?;
///
/// let result = zip.build()?;
/// zip.teardown()?;
/// std::fs::write("out.zip", result.archive())?;
/// # Ok::<(), pipe_zip::PipeZipError>(())
/// ```
#[derive(Debug)]
pub struct PipeZip {
    config: PipelineConfig,
    workspace: Workspace,
    registry: Registry,
}

impl PipeZip {
    /// Create an instance with a fresh workspace under `config.workspace_base`
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let workspace = Workspace::create(&config.workspace_base)?;
        Ok(Self {
            config,
            workspace,
            registry: Registry::new(),
        })
    }

    /// Check that builds can run with `config` without creating an instance
    pub fn probe(config: &PipelineConfig) -> Result<Capabilities> {
        probe::probe(config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Canonical path of the workspace directory
    pub fn workspace_root(&self) -> &Path {
        self.workspace.root()
    }

    /// Registered entry names, in registration order
    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.registry.names()
    }

    /// Register `source` under the relative archive path `name`
    pub fn register(&mut self, name: &str, source: impl Into<EntrySource>) -> Result<()> {
        self.registry.register(&self.workspace, name, source.into())
    }

    /// Register an in-memory buffer
    pub fn register_bytes(&mut self, name: &str, data: impl Into<Vec<u8>>) -> Result<()> {
        self.register(name, EntrySource::Bytes(data.into()))
    }

    /// Register a sequential reader, consumed exactly once
    pub fn register_reader<R: Read + Send + 'static>(&mut self, name: &str, reader: R) -> Result<()> {
        self.register(name, EntrySource::stream(reader))
    }

    /// Register a reader that is rewound to its start before feeding
    pub fn register_seekable<R: Read + Seek + Send + 'static>(
        &mut self,
        name: &str,
        reader: R,
    ) -> Result<()> {
        self.register(name, EntrySource::seekable(reader))
    }

    /// Register the contents of the file at `path`
    ///
    /// The file is opened now and read at build time.
    pub fn register_file<P: AsRef<Path>>(&mut self, name: &str, path: P) -> Result<()> {
        let file = File::open(path)?;
        self.register_seekable(name, file)
    }

    /// Build the archive from every registered entry
    ///
    /// Blocks until every participant terminated. The workspace is left in
    /// place; call [`teardown`](Self::teardown) afterwards.
    pub fn build(&mut self) -> Result<BuildResult> {
        let entries = self.registry.seal()?;
        debug!(entries = entries.len(), root = %self.workspace.root().display(), "starting build");
        Orchestrator::new(&self.config, self.workspace.root()).run(entries)
    }

    /// Remove the workspace; repeated calls report [`Teardown::AlreadyRemoved`]
    pub fn teardown(&mut self) -> Result<Teardown> {
        self.workspace.teardown()
    }

    /// Build, then remove the workspace
    ///
    /// A teardown failure is logged and never replaces the build's outcome.
    pub fn build_and_teardown(mut self) -> Result<BuildResult> {
        let result = self.build();
        if let Err(e) = self.teardown() {
            warn!(error = %e, "workspace teardown failed after build");
        }
        result
    }

    /// Run [`build_and_teardown`](Self::build_and_teardown) on tokio's blocking pool
    #[cfg(feature = "async")]
    pub async fn build_async(self) -> Result<BuildResult> {
        tokio::task::spawn_blocking(move || self.build_and_teardown())
            .await
            .map_err(|e| std::io::Error::other(format!("build task failed: {e}")))?
    }
}
