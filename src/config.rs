//! Pipeline configuration
//!
//! Everything the orchestrator needs from the outside world is injected here:
//! the compressor program, where the scratch workspace lives, and the timing
//! knobs of the liveness loop.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// Default compressor program
pub const DEFAULT_PROGRAM: &str = "zip";

/// Level bounds accepted in pipe mode
pub const MIN_COMPRESSION_LEVEL: u32 = 1;
pub const MAX_COMPRESSION_LEVEL: u32 = 9;

/// Configuration for building an archive through named pipes
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Compressor program (default: `zip`)
    pub program: OsString,
    /// Arguments placed before the compressor options, e.g. `["-c", script]` for a shell stub
    pub leading_args: Vec<OsString>,
    /// Compression level passed as `-<level>`, 1 to 9 (default: 6)
    ///
    /// `zip` rejects `-0` when reading named pipes, so there is no stored level.
    pub compression_level: u32,
    /// Directory under which the private workspace is created (default: system temp dir)
    pub workspace_base: PathBuf,
    /// Initial wait between liveness checks (default: 1ms)
    pub poll_interval: Duration,
    /// Upper bound for the adaptive wait between liveness checks (default: 50ms)
    pub max_poll_interval: Duration,
    /// Inactivity bound after which a feeder counts as stalled (default: 60s)
    pub idle_timeout: Option<Duration>,
    /// Overall bound on the archiver process (default: none)
    pub build_timeout: Option<Duration>,
    /// How long a failed build waits for participants to wind down (default: 2s)
    pub abort_grace: Duration,
    /// Check the produced central directory against what was fed (default: true)
    pub verify_listing: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            program: OsString::from(DEFAULT_PROGRAM),
            leading_args: Vec::new(),
            compression_level: 6,
            workspace_base: std::env::temp_dir(),
            poll_interval: Duration::from_millis(1),
            max_poll_interval: Duration::from_millis(50),
            idle_timeout: Some(Duration::from_secs(60)),
            build_timeout: None,
            abort_grace: Duration::from_secs(2),
            verify_listing: true,
        }
    }
}

impl PipelineConfig {
    /// Fastest compression
    pub fn fast() -> Self {
        Self::default().with_compression_level(1)
    }

    /// Best compression
    pub fn best() -> Self {
        Self::default().with_compression_level(9)
    }

    /// Set the compressor program
    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    /// Set the arguments placed before the compressor options
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set compression level
    pub fn with_compression_level(mut self, level: u32) -> Self {
        assert!(
            (MIN_COMPRESSION_LEVEL..=MAX_COMPRESSION_LEVEL).contains(&level),
            "compression_level must be between 1 and 9"
        );
        self.compression_level = level;
        self
    }

    /// Set the directory the workspace is created in
    pub fn with_workspace_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.workspace_base = base.into();
        self
    }

    /// Set the initial and maximum wait between liveness checks
    pub fn with_poll_interval(mut self, initial: Duration, max: Duration) -> Self {
        assert!(!initial.is_zero(), "poll_interval must be non-zero");
        assert!(max >= initial, "max_poll_interval must not be below poll_interval");
        self.poll_interval = initial;
        self.max_poll_interval = max;
        self
    }

    /// Set the feeder idle timeout (`None` disables stall detection)
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the overall archiver timeout
    pub fn with_build_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.build_timeout = timeout;
        self
    }

    /// Set how long a failed build waits for participants to wind down
    pub fn with_abort_grace(mut self, grace: Duration) -> Self {
        self.abort_grace = grace;
        self
    }

    /// Enable or disable central directory verification
    pub fn with_verify_listing(mut self, verify: bool) -> Self {
        self.verify_listing = verify;
        self
    }

    /// Human readable program name used in logs and error messages
    pub(crate) fn program_display(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}
