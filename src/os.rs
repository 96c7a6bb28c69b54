use std::{io::ErrorKind, path::Path};

use tokio::io::AsyncWriteExt;

use crate::{
    config::STAGING_EXT,
    errors::{self, ErrorCodes, Errors},
};

// Write `data` next to `path` as `<name>.tmp`, fsync, then rename over `path`.
// Either the old content or the new content is visible, never a prefix.
pub async fn write_file_atomically(
    path: &Path,
    data: &[u8],
    error_code: ErrorCodes,
) -> errors::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            Errors::new(error_code).with_message(format!("Invalid target path {:?}", path))
        })?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            Errors::new(ErrorCodes::DirectoryCreateError)
                .with_message(format!("Failed to create directory {:?}: {}", parent, e))
        })?;
    }

    let temp_path = path.with_file_name(format!("{}{}", file_name, STAGING_EXT));
    let write_err = |e: std::io::Error| {
        Errors::new(error_code).with_message(format!("Failed to write {:?}: {}", path, e))
    };

    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .map_err(write_err)?;
    file.write_all(data).await.map_err(write_err)?;
    file.sync_all().await.map_err(write_err)?;
    drop(file);

    tokio::fs::rename(&temp_path, path).await.map_err(write_err)?;

    Ok(())
}

// Returns false when there was nothing to delete.
pub async fn remove_file_if_exists(path: &Path) -> errors::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Errors::new(ErrorCodes::FileDeleteError)
            .with_message(format!("Failed to delete {:?}: {}", path, e))),
    }
}

pub async fn remove_dir_if_exists(path: &Path) -> errors::Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Errors::new(ErrorCodes::FileDeleteError)
            .with_message(format!("Failed to delete directory {:?}: {}", path, e))),
    }
}

pub async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

pub async fn handle_shutdown() {
    use tokio::signal::unix;

    let signals = (
        unix::signal(unix::SignalKind::quit()),
        unix::signal(unix::SignalKind::terminate()),
        unix::signal(unix::SignalKind::interrupt()),
    );
    let (Ok(mut sigquit_signal), Ok(mut sigterm_signal), Ok(mut sigint_signal)) = signals else {
        log::warn!("Failed to install signal handlers, waiting for Ctrl-C only");
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
        }
        return;
    };

    tokio::select! {
        _ = sigquit_signal.recv() => {
            log::info!("Received SIGQUIT signal");
        }
        _ = sigterm_signal.recv() => {
            log::info!("Received SIGTERM signal");
        }
        _ = sigint_signal.recv() => {
            log::info!("Received SIGINT signal");
        }
    };
}
