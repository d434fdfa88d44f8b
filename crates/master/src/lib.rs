//! The renderfarm master: a `Farm` job queue and slave registry served
//! over HTTP, plus the liveness sweeper that reclaims work from slaves
//! that stop heartbeating.

pub mod api;
pub mod blobs;
pub mod farm;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use renderfarm_core::Observer;

pub use blobs::{BlobError, BlobStore};
pub use farm::{Farm, FarmError, FarmJobs, HeartbeatResult, RegisterResult};

/// How often the liveness sweeper runs.
const LIVENESS_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Owns the farm and blob store and wires them to an axum `Router`.
pub struct MasterServer {
    farm: Arc<Farm>,
    blobs: Arc<BlobStore>,
}

impl MasterServer {
    pub fn new(observer: Arc<dyn Observer>) -> std::io::Result<Self> {
        Ok(Self {
            farm: Arc::new(Farm::new(observer)),
            blobs: Arc::new(BlobStore::new()?),
        })
    }

    pub fn farm(&self) -> &Arc<Farm> {
        &self.farm
    }

    fn router(&self) -> axum::Router {
        api::router(api::AppState {
            farm: self.farm.clone(),
            blobs: self.blobs.clone(),
        })
    }

    /// Spawn the liveness sweeper. Runs until the returned handle is
    /// aborted or the process exits.
    pub fn spawn_liveness_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let farm = self.farm.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LIVENESS_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                farm.sweep_liveness();
            }
        })
    }

    /// Bind and serve forever, with the liveness sweeper running
    /// alongside. Returns only on a fatal bind/accept error.
    pub async fn serve(&self, addr: SocketAddr) -> std::io::Result<()> {
        let _sweeper = self.spawn_liveness_sweeper();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            self.router().into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderfarm_core::{NullObserver, RenderStatus};
    use std::net::TcpListener as StdTcpListener;

    fn free_port() -> u16 {
        StdTcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn full_lease_protocol_round_trips_over_http() {
        let server = MasterServer::new(Arc::new(NullObserver)).unwrap();
        let port = free_port();
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let router = server.router();
        let serve = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        let client = reqwest::Client::new();
        let base = format!("http://127.0.0.1:{port}");

        let register: serde_json::Value = client
            .post(format!("{base}/api/register"))
            .json(&serde_json::json!({"hostname": "worker-a", "port": 9100}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(register["address"], format!("127.0.0.1:9100"));

        let add: serde_json::Value = client
            .post(format!("{base}/api/add_job"))
            .json(&serde_json::json!({"project_file": "/tmp/a.moho"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let job_id = add["id"].as_str().unwrap().to_string();

        let leased: Option<renderfarm_core::RenderJob> = client
            .get(format!("{base}/api/get_job?port=9100"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let leased = leased.expect("a job was pending");
        assert_eq!(leased.id, job_id);
        assert_eq!(leased.status, RenderStatus::Rendering);

        let complete_status = client
            .post(format!("{base}/api/job_complete?port=9100"))
            .json(&serde_json::json!({"success": true}))
            .send()
            .await
            .unwrap()
            .status();
        assert!(complete_status.is_success());

        let status: serde_json::Value = client
            .get(format!("{base}/api/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["completed"], 1);
        assert_eq!(status["active"], 0);

        serve.abort();
    }

    #[tokio::test]
    async fn upload_download_cleanup_round_trip_over_http() {
        let server = MasterServer::new(Arc::new(NullObserver)).unwrap();
        let port = free_port();
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let router = server.router();
        let serve = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        let client = reqwest::Client::new();
        let base = format!("http://127.0.0.1:{port}");

        let part = reqwest::multipart::Part::bytes(b"fake zip bytes".to_vec()).file_name("bundle.zip");
        let form = reqwest::multipart::Form::new().part("file", part);
        let upload_status = client
            .post(format!("{base}/api/upload_files/job-1"))
            .multipart(form)
            .send()
            .await
            .unwrap()
            .status();
        assert!(upload_status.is_success());

        let downloaded = client
            .get(format!("{base}/api/download_files/job-1"))
            .send()
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&downloaded[..], b"fake zip bytes");

        let cleanup_status = client
            .delete(format!("{base}/api/cleanup_files/job-1"))
            .send()
            .await
            .unwrap()
            .status();
        assert!(cleanup_status.is_success());

        let missing_status = client
            .get(format!("{base}/api/download_files/job-1"))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(missing_status, reqwest::StatusCode::NOT_FOUND);

        serve.abort();
    }
}
