//! `SlaveClient`: drives `max_concurrent` worker loops plus one
//! heartbeat loop against a single master.
//!
//! Each worker owns one in-flight job and reports through the shared
//! `Observer` rather than a bespoke callback set.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use renderfarm_core::{Observer, RenderStatus, SlaveStatus};
use renderfarm_supervisor::{CancelToken, RenderSupervisor};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::transfer::{self, TransferError};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(3);
const REGISTRATION_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SlaveError {
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Everything a `SlaveClient` needs to know about itself and its
/// master; cheap to clone (every field is owned/`Copy`).
#[derive(Debug, Clone)]
pub struct SlaveConfig {
    pub master_host: String,
    pub master_port: u16,
    /// Port this slave advertises to the master as its own identity —
    /// purely a registry key; the slave does not itself listen on it.
    pub slave_port: u16,
    pub max_concurrent: usize,
}

impl SlaveConfig {
    fn master_url(&self) -> String {
        format!("http://{}:{}", self.master_host, self.master_port)
    }
}

struct Shared {
    config: SlaveConfig,
    hostname: String,
    http: reqwest::Client,
    supervisor: Arc<RenderSupervisor>,
    observer: Arc<dyn Observer>,
    active: Mutex<HashMap<String, CancelToken>>,
    stopped: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    heartbeat_handle: Mutex<Option<JoinHandle<()>>>,
}

/// A long-lived client presence against one master: `max_concurrent`
/// worker loops (register → poll → run → report) plus one heartbeat
/// loop that also relays master-initiated cancel signals.
#[derive(Clone)]
pub struct SlaveClient {
    shared: Arc<Shared>,
}

impl SlaveClient {
    pub fn new(config: SlaveConfig, supervisor: Arc<RenderSupervisor>, observer: Arc<dyn Observer>) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        Self {
            shared: Arc::new(Shared {
                config,
                hostname,
                http: reqwest::Client::new(),
                supervisor,
                observer,
                active: Mutex::new(HashMap::new()),
                stopped: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
                heartbeat_handle: Mutex::new(None),
            }),
        }
    }

    /// Spawn `max_concurrent` worker tasks plus one heartbeat task.
    pub async fn start(&self) {
        self.shared.stopped.store(false, Ordering::SeqCst);
        let mut workers = self.shared.workers.lock().await;
        for idx in 0..self.shared.config.max_concurrent.max(1) {
            let shared = self.shared.clone();
            workers.push(tokio::spawn(worker_loop(idx, shared)));
        }
        drop(workers);

        let shared = self.shared.clone();
        let handle = tokio::spawn(heartbeat_loop(shared));
        *self.shared.heartbeat_handle.lock().await = Some(handle);
    }

    /// Stop every worker and the heartbeat loop, cancelling any
    /// in-flight renders first.
    pub async fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        {
            let active = self.shared.active.lock().await;
            for token in active.values() {
                token.cancel();
            }
        }

        let handles: Vec<_> = self.shared.workers.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        if let Some(handle) = self.shared.heartbeat_handle.lock().await.take() {
            handle.abort();
        }
    }

    pub fn active_job_count(&self) -> usize {
        self.shared
            .active
            .try_lock()
            .map(|guard| guard.len())
            .unwrap_or(0)
    }
}

/// `register → poll(get_job) → run → report`, matching
/// `slave.py`'s `_worker_loop`/`_process_job`. Re-registers on a `403`
/// or transport error and backs off 5s before retrying registration.
async fn worker_loop(worker_idx: usize, shared: Arc<Shared>) {
    let mut registered = false;

    while !shared.stopped.load(Ordering::SeqCst) {
        if !registered {
            registered = try_register(&shared).await;
            if !registered {
                tokio::time::sleep(REGISTRATION_BACKOFF).await;
                continue;
            }
        }

        let master_url = shared.config.master_url();
        match transfer::get_job(&shared.http, &master_url, shared.config.slave_port).await {
            Ok(Some(job)) => {
                run_job(worker_idx, &shared, job).await;
            }
            Ok(None) => {
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            }
            Err(TransferError::NotRegistered) => {
                registered = false;
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            Err(err) => {
                shared
                    .observer
                    .output(&format!("worker {worker_idx}: lost connection to master: {err}"));
                registered = false;
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

async fn try_register(shared: &Shared) -> bool {
    let master_url = shared.config.master_url();
    match transfer::register(
        &shared.http,
        &master_url,
        &shared.hostname,
        shared.config.slave_port,
    )
    .await
    {
        Ok(result) => {
            shared
                .observer
                .output(&format!("connected to master at {}", result.address));
            true
        }
        Err(err) => {
            shared
                .observer
                .output(&format!("cannot connect to master at {master_url}: {err}"));
            false
        }
    }
}

async fn run_job(worker_idx: usize, shared: &Arc<Shared>, mut job: renderfarm_core::RenderJob) {
    let cancel = CancelToken::new();
    shared.active.lock().await.insert(job.id.clone(), cancel.clone());
    shared.observer.output(&format!(
        "worker {worker_idx}: processing job {}",
        job.project_name()
    ));

    let staged_dir = if job.files_uploaded {
        stage_uploaded_files(shared, &mut job).await
    } else {
        None
    };

    shared
        .supervisor
        .render(&mut job, &shared.hostname, &cancel, shared.observer.as_ref())
        .await;

    if job.files_uploaded {
        let master_url = shared.config.master_url();
        if let Err(err) = transfer::cleanup_files(&shared.http, &master_url, &job.id).await {
            shared
                .observer
                .output(&format!("worker {worker_idx}: failed to request blob cleanup: {err}"));
        }
    }
    drop(staged_dir); // TempDir removed here regardless of render outcome.

    shared.active.lock().await.remove(&job.id);

    let success = job.status == RenderStatus::Completed;
    let cancelled = job.status == RenderStatus::Cancelled;
    let master_url = shared.config.master_url();
    if let Err(err) = transfer::job_complete(
        &shared.http,
        &master_url,
        shared.config.slave_port,
        &job.id,
        success,
        cancelled,
        &job.error_message,
    )
    .await
    {
        shared
            .observer
            .output(&format!("worker {worker_idx}: error reporting job completion: {err}"));
    }
}

/// Download and extract the job's uploaded bundle into a scratch
/// directory, rewriting `job.project_file` to point into it. The
/// returned `TempDir` guard is dropped (and so removed) by the caller
/// once the render — success or failure — is over.
async fn stage_uploaded_files(
    shared: &Arc<Shared>,
    job: &mut renderfarm_core::RenderJob,
) -> Option<tempfile::TempDir> {
    let scratch = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(err) => {
            job.mark_failed(format!("could not create scratch directory: {err}"));
            shared.observer.job_failed(job);
            return None;
        }
    };

    let master_url = shared.config.master_url();
    let project_name = job
        .project_file
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_default();

    match transfer::download_and_extract(
        &shared.http,
        &master_url,
        &job.id,
        scratch.path(),
        project_name.as_os_str(),
    )
    .await
    {
        Ok(Some(extracted)) => {
            job.project_file = extracted;
        }
        Ok(None) => {
            job.project_file = scratch.path().join(&project_name);
        }
        Err(err) => {
            job.mark_failed(format!("could not download job files: {err}"));
            shared.observer.job_failed(job);
            return None;
        }
    }
    Some(scratch)
}

/// Runs every 10s: reports current status/active-worker count, and
/// relays any master-initiated cancel signals to the matching
/// in-flight supervisor.
async fn heartbeat_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        ticker.tick().await;
        if shared.stopped.load(Ordering::SeqCst) {
            return;
        }

        let active_count = shared.active.lock().await.len();
        let status = if active_count > 0 {
            SlaveStatus::Rendering
        } else {
            SlaveStatus::Idle
        };

        let master_url = shared.config.master_url();
        match transfer::heartbeat(
            &shared.http,
            &master_url,
            shared.config.slave_port,
            status,
            active_count,
        )
        .await
        {
            Ok(response) => {
                if response.force_update {
                    shared
                        .observer
                        .output("master requested an update; update-staging is out of scope for this engine");
                }
                if !response.cancel_jobs.is_empty() {
                    let active = shared.active.lock().await;
                    for job_id in &response.cancel_jobs {
                        if let Some(token) = active.get(job_id) {
                            token.cancel();
                        }
                    }
                }
            }
            Err(_) => {
                // Best-effort: a dropped heartbeat does not deregister
                // the slave; the next worker poll will discover a 403
                // if the master actually forgot us.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderfarm_core::NullObserver;

    #[test]
    fn master_url_formats_host_and_port() {
        let config = SlaveConfig {
            master_host: "10.0.0.2".to_string(),
            master_port: 5580,
            slave_port: 9100,
            max_concurrent: 1,
        };
        assert_eq!(config.master_url(), "http://10.0.0.2:5580");
    }

    #[tokio::test]
    async fn new_client_has_no_active_jobs() {
        let config = SlaveConfig {
            master_host: "127.0.0.1".to_string(),
            master_port: 5580,
            slave_port: 9100,
            max_concurrent: 1,
        };
        let supervisor = Arc::new(RenderSupervisor::new("/bin/true"));
        let client = SlaveClient::new(config, supervisor, Arc::new(NullObserver));
        assert_eq!(client.active_job_count(), 0);
    }
}
