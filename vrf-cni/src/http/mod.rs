mod api;
mod error;
mod metrics;

use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;
use crate::agent::PodServer;
use crate::dataplane::Dataplane;

pub use api::{DeletePodRequest, Reply};

pub async fn serve_metrics(addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
    metrics::serve(addr, cancel).await
}

/// Serves the pod API on a unix socket, replacing a stale socket file.
pub async fn serve_api<D: Dataplane + 'static>(
    path: PathBuf,
    server: Arc<PodServer<D>>,
    cancel: CancellationToken,
) -> Result<()> {
    if let Err(e) = fs::remove_file(&path)
        && e.kind() != ErrorKind::NotFound
    {
        return Err(e.into());
    }
    let Some(parent) = path.parent() else {
        return Err(std::io::Error::new(
            ErrorKind::NotFound,
            format!("parent of path {} could not resolve", path.display()),
        )
        .into());
    };
    fs::create_dir_all(parent)?;
    let listener = UnixListener::bind(&path)?;
    info!("pod api listening on {}", path.display());

    axum::serve(listener, api::router(server))
        .with_graceful_shutdown(shutdown(cancel))
        .await?;
    Ok(())
}

pub(crate) async fn shutdown(cancel: CancellationToken) {
    select! {
        _ = cancel.cancelled() => {}
    }
}
