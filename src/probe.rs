//! Environment checks before a build
//!
//! A build needs named pipes and a compressor that understands `-FI`. Older
//! `zip` releases silently skip FIFOs, which would produce an archive of empty
//! entries, so the option is looked up in the extended help text.

use crate::archiver;
use crate::channel;
use crate::config::PipelineConfig;
use crate::error::{PipeZipError, Result};
use std::io;
use tracing::debug;

/// What the probe found out about the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Compressor program as configured
    pub program: String,
    /// First line of the compressor's extended help, if it printed one
    pub banner: Option<String>,
    /// Whether the compressor advertises FIFO input
    pub fifo_input: bool,
}

/// Check that builds can run with `config`
///
/// Fails with [`PipeZipError::UnsupportedEnvironment`] when named pipes cannot
/// be created under `workspace_base` or the compressor is missing or lacks FIFO
/// support.
pub fn probe(config: &PipelineConfig) -> Result<Capabilities> {
    let program = config.program_display();

    if !channel::fifos_supported() {
        return Err(PipeZipError::UnsupportedEnvironment(
            "named pipes are not available on this platform".to_string(),
        ));
    }

    let scratch = tempfile::Builder::new()
        .prefix("pipe-zip-probe-")
        .tempdir_in(&config.workspace_base)
        .map_err(|e| unsupported("cannot create a scratch directory", &e))?;

    channel::make_fifo(&scratch.path().join("probe"))
        .map_err(|e| unsupported("cannot create a named pipe", &e))?;

    let output = archiver::run_sync(config, &["-h2"], scratch.path()).map_err(|e| {
        PipeZipError::UnsupportedEnvironment(format!("cannot run '{}': {}", program, e))
    })?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    let banner = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string);
    let fifo_input = text.contains("-FI");

    debug!(program = %program, fifo_input, banner = ?banner, "probed compressor");

    if !fifo_input {
        return Err(PipeZipError::UnsupportedEnvironment(format!(
            "'{}' does not support reading named pipes (-FI)",
            program
        )));
    }

    Ok(Capabilities {
        program,
        banner,
        fifo_input,
    })
}

fn unsupported(what: &str, e: &io::Error) -> PipeZipError {
    PipeZipError::UnsupportedEnvironment(format!("{}: {}", what, e))
}
