//! TOML configuration for cursors and arenas.
//!
//! ```toml
//! [cursor]
//! page_size = 4096
//! max_segment_size = 2048
//! max_num_segments = 8
//! single_copy_limit = 1500
//!
//! [arena]
//! cluster_size = 2048
//! max_clusters = 64
//! ```
//!
//! Missing tables and keys keep their defaults.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::ArenaOptions;
use crate::cursor::CursorOptions;

/// Errors raised while loading a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// Values parsed but describe an unusable layout.
    #[error("invalid config: {0}")]
    Invalid(String),
    /// Neither an explicit path nor a platform config directory exists.
    #[error("no config directory found; pass --config or set SGTOOL_CONFIG")]
    NoConfigPath,
}

/// `[cursor]` table.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CursorSection {
    /// Page size in bytes.
    pub page_size: Option<usize>,
    /// Segment length ceiling.
    pub max_segment_size: Option<usize>,
    /// Default segment budget.
    pub max_num_segments: Option<usize>,
    /// Ceiling for the single-segment copy.
    pub single_copy_limit: Option<usize>,
}

/// `[arena]` table.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ArenaSection {
    /// Plain node size.
    pub plain_size: Option<usize>,
    /// Cluster size.
    pub cluster_size: Option<usize>,
    /// First virtual address handed out.
    pub base_addr: Option<u64>,
    /// Live node ceiling.
    pub max_nodes: Option<usize>,
    /// Live cluster ceiling.
    pub max_clusters: Option<usize>,
}

/// Parsed configuration file.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SgConfig {
    /// Cursor settings.
    pub cursor: CursorSection,
    /// Arena settings.
    pub arena: ArenaSection,
}

impl SgConfig {
    /// Reads and parses `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `explicit` if given, else the default location if a file exists
    /// there, else defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Cursor options described by the `[cursor]` table. The page size is
    /// shared with the arena.
    pub fn cursor_options(&self) -> CursorOptions {
        let mut options = CursorOptions::default();
        if let Some(page_size) = self.cursor.page_size {
            options = options.page_size(page_size);
        }
        if let Some(bytes) = self.cursor.max_segment_size {
            options = options.max_segment_size(bytes);
        }
        if let Some(count) = self.cursor.max_num_segments {
            options = options.max_num_segments(count);
        }
        if let Some(limit) = self.cursor.single_copy_limit {
            options = options.single_copy_limit(limit);
        }
        options
    }

    /// Arena options described by the `[arena]` table, validated.
    pub fn arena_options(&self) -> Result<ArenaOptions, ConfigError> {
        let defaults = ArenaOptions::default();
        let options = ArenaOptions {
            page_size: self.cursor.page_size.unwrap_or(defaults.page_size),
            plain_size: self.arena.plain_size.unwrap_or(defaults.plain_size),
            cluster_size: self.arena.cluster_size.unwrap_or(defaults.cluster_size),
            base_addr: self.arena.base_addr.unwrap_or(defaults.base_addr),
            max_nodes: self.arena.max_nodes,
            max_clusters: self.arena.max_clusters,
        };
        options
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        Ok(options)
    }
}

/// Path a config would be read from: `explicit`, else the default location.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    explicit
        .map(Path::to_path_buf)
        .or_else(default_config_path)
        .ok_or(ConfigError::NoConfigPath)
}

/// `<config_dir>/sgcursor/sgtool.toml`, if the platform has a config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("sgcursor").join("sgtool.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_both_tables() {
        let file = write_config(
            "[cursor]\nmax_segment_size = 1024\nmax_num_segments = 6\n\n[arena]\ncluster_size = 1024\nmax_clusters = 3\n",
        );
        let config = SgConfig::load(file.path()).unwrap();
        let cursor = config.cursor_options();
        assert_eq!(cursor.max_segment_size, 1024);
        assert_eq!(cursor.max_num_segments, 6);
        assert_eq!(cursor.page_size, 4096);
        let arena = config.arena_options().unwrap();
        assert_eq!(arena.cluster_size, 1024);
        assert_eq!(arena.max_clusters, Some(3));
        assert_eq!(arena.plain_size, 256);
    }

    #[test]
    fn empty_file_means_defaults() {
        let file = write_config("");
        let config = SgConfig::load(file.path()).unwrap();
        assert_eq!(config, SgConfig::default());
        assert!(config.cursor_options().single_copy_limit.is_none());
    }

    #[test]
    fn parse_errors_name_the_file() {
        let file = write_config("[cursor]\nmax_segment_size = \"big\"\n");
        let err = SgConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = write_config("[cursor]\nmax_segs = 4\n");
        assert!(matches!(
            SgConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = SgConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn invalid_arena_layout_is_reported() {
        let file = write_config("[arena]\ncluster_size = 3000\n");
        let config = SgConfig::load(file.path()).unwrap();
        assert!(matches!(
            config.arena_options(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn explicit_path_wins() {
        let path = Path::new("/tmp/elsewhere.toml");
        assert_eq!(resolve_config_path(Some(path)).unwrap(), path);
    }

    #[test]
    fn default_path_ends_in_tool_name() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("sgcursor/sgtool.toml"));
        }
    }
}
