//! Entry registry: archive names and the sources that will feed them

use crate::error::{PipeZipError, Result};
use crate::workspace::Workspace;
use std::fmt;
use std::io::{Read, Seek};
use std::path::PathBuf;
use tracing::debug;

/// A readable source that can be rewound before feeding
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek> ReadSeek for T {}

/// Where the bytes of an entry come from
pub enum EntrySource {
    /// In-memory buffer
    Bytes(Vec<u8>),
    /// Strictly sequential, single-pass stream (sockets, pipes, decoders...)
    Stream(Box<dyn Read + Send>),
    /// Stream handle that is rewound to its start before feeding
    Seekable(Box<dyn ReadSeek + Send>),
}

impl EntrySource {
    /// Wrap a sequential reader
    pub fn stream<R: Read + Send + 'static>(reader: R) -> Self {
        EntrySource::Stream(Box::new(reader))
    }

    /// Wrap a seekable reader
    pub fn seekable<R: Read + Seek + Send + 'static>(reader: R) -> Self {
        EntrySource::Seekable(Box::new(reader))
    }

    /// Short name of the source kind, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            EntrySource::Bytes(_) => "bytes",
            EntrySource::Stream(_) => "stream",
            EntrySource::Seekable(_) => "seekable",
        }
    }
}

impl fmt::Debug for EntrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntrySource::Bytes(data) => write!(f, "Bytes({} bytes)", data.len()),
            EntrySource::Stream(_) => f.write_str("Stream(..)"),
            EntrySource::Seekable(_) => f.write_str("Seekable(..)"),
        }
    }
}

impl From<Vec<u8>> for EntrySource {
    fn from(data: Vec<u8>) -> Self {
        EntrySource::Bytes(data)
    }
}

impl From<&[u8]> for EntrySource {
    fn from(data: &[u8]) -> Self {
        EntrySource::Bytes(data.to_vec())
    }
}

impl From<String> for EntrySource {
    fn from(data: String) -> Self {
        EntrySource::Bytes(data.into_bytes())
    }
}

impl From<&str> for EntrySource {
    fn from(data: &str) -> Self {
        EntrySource::Bytes(data.as_bytes().to_vec())
    }
}

/// A registered archive entry
#[derive(Debug)]
pub struct Entry {
    /// Normalized archive name
    pub name: String,
    /// Absolute path of the entry's named pipe
    pub pipe: PathBuf,
    /// Bytes to feed
    pub source: EntrySource,
}

/// Registered entries, in registration order
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<Entry>,
    /// Canonical pipe locations, parallel to `entries`
    claimed: Vec<PathBuf>,
    sealed: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `source` under the archive name `name`
    ///
    /// Nothing is created on disk here; pipes are provisioned at build time.
    /// On error the registry is left unchanged.
    pub fn register(&mut self, workspace: &Workspace, name: &str, source: EntrySource) -> Result<()> {
        if self.sealed {
            return Err(PipeZipError::ContractViolation(
                "entries cannot be registered once a build has started".to_string(),
            ));
        }

        let resolved = workspace.resolve(name)?;

        // Same location, or one entry would need the other to be a directory.
        // Compared canonically so names aliased through a symlink collide too.
        let conflict = self.claimed.iter().any(|existing| {
            existing.starts_with(&resolved.canonical) || resolved.canonical.starts_with(existing)
        });
        if conflict || std::fs::symlink_metadata(&resolved.path).is_ok() {
            return Err(PipeZipError::DuplicateEntry {
                name: resolved.name,
            });
        }

        debug!(entry = %resolved.name, source = source.kind(), "registered entry");

        self.claimed.push(resolved.canonical);
        self.entries.push(Entry {
            name: resolved.name,
            pipe: resolved.path,
            source,
        });
        Ok(())
    }

    /// Number of registered entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered names in registration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    /// Whether the entries were already handed to a build
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Hand every entry over to a build; the registry accepts nothing afterwards
    pub fn seal(&mut self) -> Result<Vec<Entry>> {
        if self.sealed {
            return Err(PipeZipError::ContractViolation(
                "a pipeline can only be built once".to_string(),
            ));
        }
        self.sealed = true;
        self.claimed.clear();
        Ok(std::mem::take(&mut self.entries))
    }
}
