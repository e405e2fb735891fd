use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::agent::PodServer;
use crate::dataplane::Dataplane;
use crate::pod::{self, PodNetworkSpec};
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeletePodRequest {
    pub netns_name: String,
    pub interface_name: String,
}

pub fn router<D: Dataplane + 'static>(server: Arc<PodServer<D>>) -> Router {
    Router::new()
        .route(
            "/v1/pods",
            get(list_pods::<D>).post(add_pod::<D>).delete(del_pod::<D>),
        )
        .with_state(server)
}

/// Runs pod server work off the async workers; the engine blocks on the
/// dataplane.
async fn blocking<D, T, F>(server: Arc<PodServer<D>>, f: F) -> Result<T>
where
    D: Dataplane + 'static,
    T: Send + 'static,
    F: FnOnce(&PodServer<D>) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(server.as_ref()))
        .await
        .map_err(|e| Error::Task(e.to_string()))?
}

async fn list_pods<D: Dataplane + 'static>(
    State(server): State<Arc<PodServer<D>>>,
) -> Json<Vec<PodNetworkSpec>> {
    Json(server.list_pods())
}

async fn add_pod<D: Dataplane + 'static>(
    State(server): State<Arc<PodServer<D>>>,
    Json(spec): Json<PodNetworkSpec>,
) -> Result<Json<PodNetworkSpec>> {
    info!("received add request for {spec}");
    let spec = blocking(server, move |s| s.add_pod(spec)).await?;
    Ok(Json(spec))
}

async fn del_pod<D: Dataplane + 'static>(
    State(server): State<Arc<PodServer<D>>>,
    Json(request): Json<DeletePodRequest>,
) -> Result<Json<Reply>> {
    let key = pod::key(&request.netns_name, &request.interface_name);
    info!("received delete request for {key}");
    let removed = blocking(server, move |s| s.del_pod(&key)).await?;
    let message = match removed {
        Some(spec) => format!("deleted {spec}"),
        None => "not found".to_string(),
    };
    Ok(Json(Reply {
        status: "ok".into(),
        message: Some(message),
    }))
}

#[cfg(test)]
mod test {
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::dataplane::MemoryDataplane;
    use crate::metrics::PodMetrics;
    use crate::network::NetworkRegistry;
    use crate::provision::test::dataplane;
    use crate::provision::{ProvisionConfig, Provisioner};

    fn app(dir: &tempfile::TempDir) -> (Router, Arc<PodServer<MemoryDataplane>>) {
        let provisioner = Provisioner::new(
            dataplane(),
            Arc::new(NetworkRegistry::new()),
            ProvisionConfig::default(),
        );
        let server = Arc::new(PodServer::new(
            provisioner,
            dir.path().join("state"),
            PodMetrics::default(),
        ));
        (router(server.clone()), server)
    }

    fn request(method: Method, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri("/v1/pods")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn add_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let (app, server) = app(&dir);

        let body = r#"{"interface_name":"eth0","netns_name":"/run/netns/a","container_ips":["10.1.2.3"]}"#;
        let resp = app
            .clone()
            .oneshot(request(Method::POST, body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let spec: PodNetworkSpec = serde_json::from_slice(&bytes).unwrap();
        assert!(spec.is_provisioned());

        let resp = app
            .clone()
            .oneshot(Request::get("/v1/pods").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let pods: Vec<PodNetworkSpec> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(pods, vec![spec]);

        let body = r#"{"netns_name":"/run/netns/a","interface_name":"eth0"}"#;
        let resp = app.oneshot(request(Method::DELETE, body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(server.list_pods().is_empty());
    }

    #[tokio::test]
    async fn unknown_network_is_a_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(&dir);
        let body = r#"{"interface_name":"eth0","netns_name":"/run/netns/a","container_ips":["10.1.2.3"],"network_name":"blue"}"#;
        let resp = app.oneshot(request(Method::POST, body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let reply: Reply = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply.status, "fail");
        assert!(reply.message.unwrap().contains("network not found blue"));
    }
}
