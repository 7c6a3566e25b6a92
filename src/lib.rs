//! # pipe-zip: ZIP archives from byte streams through named pipes
//!
//! `pipe-zip` builds a ZIP archive in memory from in-memory buffers and
//! arbitrary readers without staging the entry contents on disk. Every entry
//! gets a named pipe inside a private workspace; one worker thread per entry
//! streams the source into its pipe while a single external `zip` process
//! reads all pipes in turn and writes the archive to its stdout.
//!
//! ## Features
//!
//! - **No temp files for content**: only empty FIFOs ever touch the disk
//! - **Any source**: buffers, sequential streams, seekable handles, files
//! - **No deadlocks**: every pipe operation is non-blocking and every
//!   participant is supervised with idle and build timeouts
//! - **Verified output**: the produced central directory is checked against
//!   the bytes and CRC-32 values actually fed
//! - **Path safety**: entry names cannot escape the workspace
//!
//! ## Quick Start
//!
//! ```no_run
//! use pipe_zip::{PipeZip, PipelineConfig};
//!
//! let mut zip = PipeZip::new(PipelineConfig::default())?;
//! zip.register_bytes("a.txt", b"hello".to_vec())?;
//! zip.register_reader("logs/today.log", std::io::stdin())?;
//!
//! let result = zip.build()?;
//! println!("{} entries, {} bytes", result.entries().len(), result.archive().len());
//!
//! zip.teardown()?;
//! # Ok::<(), pipe_zip::PipeZipError>(())
//! ```
//!
//! ### Checking the environment first
//!
//! ```no_run
//! use pipe_zip::{PipeZip, PipelineConfig};
//!
//! let config = PipelineConfig::fast();
//! match PipeZip::probe(&config) {
//!     Ok(caps) => println!("using {}", caps.banner.unwrap_or(caps.program)),
//!     Err(e) => eprintln!("cannot build archives here: {e}"),
//! }
//! ```
//!
//! ### Inspecting an archive
//!
//! ```no_run
//! use pipe_zip::ArchiveListing;
//!
//! let bytes = std::fs::read("out.zip")?;
//! for entry in ArchiveListing::parse(&bytes)?.entries() {
//!     println!("{}: {} bytes", entry.name, entry.uncompressed_size);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod archiver;
pub mod channel;
pub mod config;
pub mod error;
pub mod feeder;
pub mod listing;
mod liveness;
pub mod orchestrator;
pub mod pipeline;
pub mod probe;
pub mod registry;
pub mod workspace;

pub use config::PipelineConfig;
pub use error::{PipeZipError, Result};
pub use feeder::FeedReport;
pub use listing::{ArchiveListing, ListedEntry};
pub use orchestrator::{BuildResult, BuildState, Participant};
pub use pipeline::PipeZip;
pub use probe::Capabilities;
pub use registry::EntrySource;
pub use workspace::Teardown;
