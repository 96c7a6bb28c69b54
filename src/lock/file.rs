use std::{
    fs::OpenOptions,
    io::{ErrorKind, Write},
    path::PathBuf,
};

use crate::{
    config::{LOCK_FILES_DIRECTORY, TABLES_DIRECTORY},
    errors::{self, ErrorCodes, Errors},
    lock::LockProvider,
};

// Advisory lock files. A lock named `<table>/<file>` lives at
// `<base>/tables/<table>/LockFiles/<file>` and is taken by exclusive create, so it also
// excludes loaders running in other processes on the same filesystem.
#[derive(Debug, Clone)]
pub struct FileLockProvider {
    base_path: PathBuf,
}

impl FileLockProvider {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn lock_file_path(&self, name: &str) -> PathBuf {
        let tables_path = self.base_path.join(TABLES_DIRECTORY);

        match name.split_once('/') {
            Some((table, file)) => tables_path
                .join(table)
                .join(LOCK_FILES_DIRECTORY)
                .join(file),
            None => tables_path.join(LOCK_FILES_DIRECTORY).join(name),
        }
    }
}

impl LockProvider for FileLockProvider {
    fn try_lock(&self, name: &str) -> errors::Result<bool> {
        let path = self.lock_file_path(name);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Errors::new(ErrorCodes::LockAcquireError)
                    .with_message(format!("Failed to create lock directory: {}", e))
            })?;
        }

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                // owner pid, for whoever has to clean up a stale lock by hand
                if let Err(e) = writeln!(file, "{}", std::process::id()) {
                    log::warn!("Failed to write owner into {:?}: {}", path, e);
                }
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Errors::new(ErrorCodes::LockAcquireError)
                .with_message(format!("Failed to create lock file {:?}: {}", path, e))),
        }
    }

    fn unlock(&self, name: &str) -> errors::Result<()> {
        let path = self.lock_file_path(name);

        std::fs::remove_file(&path).map_err(|e| {
            Errors::new(ErrorCodes::LockReleaseError)
                .with_message(format!("Failed to delete lock file {:?}: {}", path, e))
        })
    }
}
