//! Buffer size configuration.
//!
//! The configuration file is a JSON object keyed by memory level name,
//! each value giving the buffer size to reserve from a region of that
//! level:
//!
//! ```json
//! {
//!     "L2": { "buffer_size_bytes": 262144 },
//!     "L3": { "buffer_size_bytes": 1048576 }
//! }
//! ```
//!
//! Entries with an unrecognized level name or a missing or non-integer
//! `buffer_size_bytes` are skipped with a warning; an unparseable file is
//! an error and callers fall back to running without a configuration.

use std::{
    env, fs, io,
    path::{Path, PathBuf},
};

use snafu::{ResultExt as _, Snafu};

use crate::properties::MemoryLevel;

const ENV_CONFIG_PATH: &str = "TCC_CONFIG_PATH";
const ENV_HOME: &str = "HOME";
const CONFIG_SDK_PATH: &str = "/usr/share/tcc_tools/config";
const CONFIG_FILE: &str = ".tcc.config";

const SIZE_KEY: &str = "buffer_size_bytes";

/// Errors reading a configuration file.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("unable to open configuration file {}", path.display()))]
    OpenFile {
        path: PathBuf,
        source: io::Error,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("unable to parse configuration file {}", path.display()))]
    ParseFile {
        path: PathBuf,
        source: serde_json::Error,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("configuration root of {} is not a JSON object", path.display()))]
    NotAnObject {
        path: PathBuf,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// One configured buffer size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigItem {
    pub level: MemoryLevel,
    pub size: usize,
}

/// The parsed buffer size configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    items: Vec<ConfigItem>,
}

impl Config {
    /// An empty configuration; every region falls back to its full size.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Reads and parses a configuration file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be opened or its content is not a JSON
    /// object. Bad entries inside a well-formed object are skipped, not
    /// errors.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).context(OpenFileSnafu { path })?;
        let root: serde_json::Value =
            serde_json::from_str(&text).context(ParseFileSnafu { path })?;
        let Some(object) = root.as_object() else {
            return NotAnObjectSnafu { path }.fail();
        };

        let mut items = Vec::new();
        for (key, value) in object {
            let Some(level) = MemoryLevel::from_config_key(key) else {
                log::warn!("unknown memory level \"{key}\" in config, entry skipped");
                continue;
            };
            let Some(size) = value.get(SIZE_KEY).and_then(serde_json::Value::as_u64) else {
                log::warn!("config entry \"{key}\" has no integer {SIZE_KEY}, entry skipped");
                continue;
            };
            let Ok(size) = usize::try_from(size) else {
                log::warn!("config entry \"{key}\" size {size} out of range, entry skipped");
                continue;
            };
            // Duplicate JSON keys collapse during parsing, last one wins.
            items.push(ConfigItem { level, size });
        }
        log::debug!("read {} config entries from {}", items.len(), path.display());
        Ok(Self { items })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigItem> {
        self.items.iter()
    }

    /// The configured buffer size for a memory level, first entry wins.
    #[must_use]
    pub fn size_for(&self, level: MemoryLevel) -> Option<usize> {
        self.items
            .iter()
            .find(|item| item.level == level)
            .map(|item| item.size)
    }
}

/// Locates the configuration file: `$TCC_CONFIG_PATH`, then `$HOME`, then
/// the system-wide install path; the first readable `.tcc.config` wins.
#[must_use]
pub fn find_config_file() -> Option<PathBuf> {
    for dir in [
        env::var_os(ENV_CONFIG_PATH),
        env::var_os(ENV_HOME),
        Some(CONFIG_SDK_PATH.into()),
    ]
    .into_iter()
    .flatten()
    {
        let path = Path::new(&dir).join(CONFIG_FILE);
        if is_readable(&path) {
            return Some(path);
        }
        log::warn!("configuration file {} unavailable", path.display());
    }
    None
}

fn is_readable(path: &Path) -> bool {
    fs::File::open(path).is_ok()
}
