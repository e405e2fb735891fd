use std::net::SocketAddr;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;
use crate::http::shutdown;

pub(crate) async fn serve(addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("metrics listening on {}", addr);

    axum::serve(listener, router())
        .with_graceful_shutdown(shutdown(cancel))
        .await?;
    Ok(())
}

pub fn router() -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
}

async fn metrics() -> String {
    crate::metrics::encode_text()
}

async fn healthz() -> &'static str {
    "ok"
}
