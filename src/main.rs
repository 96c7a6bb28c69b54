use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use segcommit::{
    config::{CommitConfig, DATA_DIR, LOCK_PROVIDER},
    engine::CommitEngine,
    http,
    lock::{FileLockProvider, InProcessLockProvider, LockProvider},
    os,
};

#[cfg(target_os = "linux")]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn setup_logging() {
    unsafe {
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", "info");
        }
    }
    env_logger::init();
}

fn lock_provider(data_dir: &Path) -> Arc<dyn LockProvider> {
    match LOCK_PROVIDER.as_str() {
        // single process only
        "memory" => Arc::new(InProcessLockProvider::new()),
        "file" => Arc::new(FileLockProvider::new(data_dir.to_path_buf())),
        other => {
            log::warn!("Unknown lock provider '{}', using file locks", other);
            Arc::new(FileLockProvider::new(data_dir.to_path_buf()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    setup_logging();

    log::info!("Initializing commit engine...");

    let data_dir = PathBuf::from(DATA_DIR.as_str());
    let config = CommitConfig::from_env();

    let engine = CommitEngine::initialize(data_dir.clone(), config, lock_provider(&data_dir)).await?;
    let shared_engine = Arc::new(engine);

    log::info!("Starting servers...");

    let http_engine = shared_engine.clone();
    let http_server = tokio::spawn(async move {
        if let Err(e) = http::run_server(http_engine).await {
            log::error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = http_server => log::info!("HTTP server stopped"),
        _ = os::handle_shutdown() => log::info!("Shutting down"),
    }

    Ok(())
}
