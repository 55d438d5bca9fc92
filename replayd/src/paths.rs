//! Cross-platform application paths

use std::fs;
use std::path::PathBuf;

use crate::CliError;

#[derive(Debug, Clone)]
pub struct AppPaths {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn new() -> Result<Self, CliError> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| CliError::Paths("could not determine config directory".into()))?
            .join("sleep-replay");
        let data_dir = dirs::data_dir()
            .ok_or_else(|| CliError::Paths("could not determine data directory".into()))?
            .join("sleep-replay");
        Ok(Self {
            config_dir,
            data_dir,
        })
    }

    /// Create both directories if they are missing.
    pub fn ensure(&self) -> Result<(), CliError> {
        for dir in [&self.config_dir, &self.data_dir] {
            fs::create_dir_all(dir).map_err(|source| CliError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn config_dir(&self) -> &PathBuf {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    /// Default telemetry trace location.
    pub fn trace_file(&self) -> PathBuf {
        self.data_dir.join("trace.jsonl")
    }
}
