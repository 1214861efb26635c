//! Test fixtures and environment helpers.

use stowdb_core::{CoreResult, Environment, EnvironmentConfig};
use stowdb_storage::MemoryStore;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

enum Backing {
    Memory(MemoryStore),
    File { _dir: TempDir, path: PathBuf },
}

/// A test environment that can be reopened over the same log.
pub struct TestEnvironment {
    /// The environment instance.
    pub env: Environment,
    config: EnvironmentConfig,
    backing: Backing,
}

impl TestEnvironment {
    /// Creates an in-memory environment with the default config.
    pub fn memory() -> Self {
        Self::memory_with_config(test_config())
    }

    /// Creates an in-memory environment.
    pub fn memory_with_config(config: EnvironmentConfig) -> Self {
        let store = MemoryStore::new();
        let env = Environment::open(config.clone(), Box::new(store.clone()))
            .expect("Failed to open in-memory environment");
        Self {
            env,
            config,
            backing: Backing::Memory(store),
        }
    }

    /// Creates a file-backed environment in a temporary directory.
    pub fn file() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let path = dir.path().join("stow.log");
        let config = test_config();
        let env = Environment::open_path_with_config(&path, config.clone())
            .expect("Failed to open file environment");
        Self {
            env,
            config,
            backing: Backing::File { _dir: dir, path },
        }
    }

    /// Path of the log file, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Memory(_) => None,
            Backing::File { path, .. } => Some(path),
        }
    }

    /// The shared memory store, if memory-backed.
    pub fn memory_store(&self) -> Option<&MemoryStore> {
        match &self.backing {
            Backing::Memory(store) => Some(store),
            Backing::File { .. } => None,
        }
    }

    /// Drops the environment and opens a new one over the same log, as a
    /// restart would. Open transactions are lost.
    pub fn reopen(&mut self) -> CoreResult<()> {
        let env = match &self.backing {
            Backing::Memory(store) => {
                Environment::open(self.config.clone(), Box::new(store.clone()))?
            }
            Backing::File { path, .. } => {
                self.env.close()?;
                Environment::open_path_with_config(path, self.config.clone())?
            }
        };
        self.env = env;
        Ok(())
    }
}

impl std::ops::Deref for TestEnvironment {
    type Target = Environment;

    fn deref(&self) -> &Self::Target {
        &self.env
    }
}

/// Default config for tests: commits skip the sync.
pub fn test_config() -> EnvironmentConfig {
    EnvironmentConfig::default().sync_on_commit(false)
}

/// Runs a test with a temporary in-memory environment.
pub fn with_temp_env<F, R>(f: F) -> R
where
    F: FnOnce(&Environment) -> R,
{
    let test_env = TestEnvironment::memory();
    f(&test_env.env)
}

/// Runs a test with a temporary file-backed environment.
pub fn with_file_env<F, R>(f: F) -> R
where
    F: FnOnce(&Environment, &Path) -> R,
{
    let test_env = TestEnvironment::file();
    let path = test_env
        .path()
        .expect("File environment should have a path")
        .to_path_buf();
    f(&test_env.env, &path)
}
