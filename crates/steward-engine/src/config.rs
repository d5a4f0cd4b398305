//! Engine configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use steward_types::{Result, StewardError};

/// Directory under the prefix that holds per-resource state.
pub const STATE_DIR: &str = "state";

fn default_event_capacity() -> usize {
    256
}

/// Process-wide settings handed to the engine at init time and, through
/// [`crate::Init`], to every resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub program: String,
    #[serde(default)]
    pub version: String,
    pub hostname: String,
    /// Root of all on-disk state. Must not be `/`.
    pub prefix: PathBuf,
    #[serde(default)]
    pub debug: bool,
    /// Capacity of the engine event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl EngineConfig {
    pub fn new(
        program: impl Into<String>,
        hostname: impl Into<String>,
        prefix: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            version: String::new(),
            hostname: hostname.into(),
            prefix: prefix.into(),
            debug: false,
            event_capacity: default_event_capacity(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Read a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.program.is_empty() {
            return Err(StewardError::EmptyProgram);
        }
        if self.hostname.is_empty() {
            return Err(StewardError::EmptyHostname);
        }
        if self.prefix.as_os_str().is_empty() || self.prefix == Path::new("/") {
            return Err(StewardError::InvalidPrefix(
                self.prefix.display().to_string(),
            ));
        }
        Ok(())
    }

    /// `<prefix>/state`
    pub fn state_prefix(&self) -> PathBuf {
        self.prefix.join(STATE_DIR)
    }
}
