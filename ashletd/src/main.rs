//! Process bootstrap: logging, socket setup, engine construction, and the
//! accept loop, with exit codes per the daemon's external interface.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use ashlet_core::engine::Engine;
use ashletd::ipc;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let ashlet_home = ashlet_home_override();
    let engine = Arc::new(Engine::from_config(ashlet_home).await.context("loading config")?);

    let socket_path = socket_path();
    remove_stale_socket(&socket_path)
        .await
        .with_context(|| format!("removing stale socket at {}", socket_path.display()))?;

    let listener = UnixListener::bind(&socket_path).with_context(|| format!("binding socket at {}", socket_path.display()))?;
    info!(path = %socket_path.display(), "listening");

    let shutdown = CancellationToken::new();
    let server = ipc::Server::new(engine);

    let serve_shutdown = shutdown.clone();
    let serve_task = tokio::spawn(server.serve(listener, serve_shutdown));

    let shutdown_notify = ashlet_core::util::notify_on_shutdown_signal();
    shutdown_notify.notified().await;

    info!("shutdown signal received");
    shutdown.cancel();
    let result = serve_task.await;
    let _ = tokio::fs::remove_file(&socket_path).await;

    result.context("serve task panicked")
}

fn ashlet_home_override() -> Option<PathBuf> {
    std::env::var("ASHLET_HOME").ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

/// `$ASHLET_SOCKET` → `$XDG_RUNTIME_DIR/ashlet.sock` → `/tmp/ashlet-<uid>.sock`.
fn socket_path() -> PathBuf {
    if let Ok(path) = std::env::var("ASHLET_SOCKET") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        if !runtime_dir.is_empty() {
            return PathBuf::from(runtime_dir).join("ashlet.sock");
        }
    }
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/ashlet-{uid}.sock"))
}

async fn remove_stale_socket(path: &std::path::Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn socket_path_prefers_ashlet_socket_env_var() {
        // SAFETY: test runs single-threaded with respect to these env vars.
        unsafe {
            std::env::set_var("ASHLET_SOCKET", "/tmp/explicit.sock");
        }
        let path = socket_path();
        unsafe {
            std::env::remove_var("ASHLET_SOCKET");
        }
        assert_eq!(path, PathBuf::from("/tmp/explicit.sock"));
    }

    #[test]
    fn socket_path_falls_back_to_uid_tmp_path() {
        // SAFETY: test runs single-threaded with respect to these env vars.
        unsafe {
            std::env::remove_var("ASHLET_SOCKET");
            std::env::remove_var("XDG_RUNTIME_DIR");
        }
        let path = socket_path();
        assert!(path.to_string_lossy().starts_with("/tmp/ashlet-"));
    }

    #[tokio::test]
    async fn remove_stale_socket_ignores_missing_file() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("nonexistent.sock");
        remove_stale_socket(&path).await.expect("ok");
    }
}
