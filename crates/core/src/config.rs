//! Engine configuration: cache size, sort buffer, input and output
//! directories. Defaults are overridden by an optional `forgestat.toml` in
//! the working directory.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_CACHE_FRAMES: usize = 4096;
pub const DEFAULT_SORT_BUFFER_BYTES: usize = 128 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Directory holding the three text inputs.
    pub input_dir: PathBuf,
    /// Directory for query outputs and the persisted catalogue.
    pub output_dir: PathBuf,
    /// Page frames in the block cache (1 KiB each).
    pub cache_frames: usize,
    /// In-memory buffer cap for external sort runs.
    pub sort_buffer_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            input_dir: PathBuf::from("entrada"),
            output_dir: PathBuf::from("saida"),
            cache_frames: DEFAULT_CACHE_FRAMES,
            sort_buffer_bytes: DEFAULT_SORT_BUFFER_BYTES,
        }
    }
}

#[derive(Deserialize, Default)]
struct ConfigFile {
    input_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    cache_frames: Option<usize>,
    sort_buffer_mib: Option<usize>,
}

impl EngineConfig {
    /// Defaults, overridden field by field from `forgestat.toml` under `root`
    /// when present. A malformed file is ignored with a warning.
    pub fn load(root: &Path) -> Self {
        let mut cfg = EngineConfig::default();
        let path = root.join("forgestat.toml");
        let Ok(content) = std::fs::read_to_string(&path) else {
            return cfg;
        };
        match toml::from_str::<ConfigFile>(&content) {
            Ok(file) => {
                if let Some(v) = file.input_dir {
                    cfg.input_dir = v;
                }
                if let Some(v) = file.output_dir {
                    cfg.output_dir = v;
                }
                if let Some(v) = file.cache_frames {
                    cfg.cache_frames = v.max(1);
                }
                if let Some(v) = file.sort_buffer_mib {
                    cfg.sort_buffer_bytes = v.max(1) * 1024 * 1024;
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "ignoring malformed config file"),
        }
        cfg
    }

    pub fn input_path(&self, name: &str) -> PathBuf {
        self.input_dir.join(name)
    }

    pub fn output_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig::load(dir.path());
        assert_eq!(cfg.input_dir, PathBuf::from("entrada"));
        assert_eq!(cfg.output_dir, PathBuf::from("saida"));
        assert_eq!(cfg.cache_frames, DEFAULT_CACHE_FRAMES);
    }

    #[test]
    fn file_overrides_individual_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("forgestat.toml"),
            "cache_frames = 16\nsort_buffer_mib = 2\n",
        )
        .unwrap();
        let cfg = EngineConfig::load(dir.path());
        assert_eq!(cfg.cache_frames, 16);
        assert_eq!(cfg.sort_buffer_bytes, 2 * 1024 * 1024);
        assert_eq!(cfg.input_dir, PathBuf::from("entrada"));
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("forgestat.toml"), "cache_frames = \"lots\"").unwrap();
        let cfg = EngineConfig::load(dir.path());
        assert_eq!(cfg.cache_frames, DEFAULT_CACHE_FRAMES);
    }
}
