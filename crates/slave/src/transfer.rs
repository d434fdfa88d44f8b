//! Thin `reqwest` wire functions against the master's HTTP surface,
//! plus the zip-bundle download/extract helper for jobs whose inputs
//! were uploaded ahead of dispatch.
//!
//! One function per endpoint, a typed request/response pair each. No
//! retry logic here — retry/backoff lives in `client.rs`'s worker loop.

use std::path::{Path, PathBuf};

use renderfarm_core::{RenderJob, SlaveStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("master rejected the request: not registered (403)")]
    NotRegistered,
    #[error("unexpected status {0} from master")]
    UnexpectedStatus(reqwest::StatusCode),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad zip bundle: {0}")]
    Zip(#[from] zip::result::ZipError),
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    hostname: &'a str,
    port: u16,
}

#[derive(Debug, Deserialize)]
pub struct RegisterResponse {
    pub address: String,
}

pub async fn register(
    http: &reqwest::Client,
    master_url: &str,
    hostname: &str,
    port: u16,
) -> Result<RegisterResponse, TransferError> {
    let res = http
        .post(format!("{master_url}/api/register"))
        .json(&RegisterRequest { hostname, port })
        .send()
        .await?;
    if !res.status().is_success() {
        return Err(TransferError::UnexpectedStatus(res.status()));
    }
    Ok(res.json().await?)
}

#[derive(Debug, Serialize)]
struct HeartbeatRequest {
    status: SlaveStatus,
    active_jobs: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub cancel_jobs: Vec<String>,
    #[serde(default)]
    pub force_update: bool,
}

pub async fn heartbeat(
    http: &reqwest::Client,
    master_url: &str,
    port: u16,
    status: SlaveStatus,
    active_jobs: usize,
) -> Result<HeartbeatResponse, TransferError> {
    let res = http
        .post(format!("{master_url}/api/heartbeat?port={port}"))
        .json(&HeartbeatRequest {
            status,
            active_jobs,
        })
        .send()
        .await?;
    if !res.status().is_success() {
        return Err(TransferError::UnexpectedStatus(res.status()));
    }
    Ok(res.json().await?)
}

/// `GET /api/get_job?port=N`: `None` if no pending/reserved job was
/// available, `Some(job)` once leased (the job is already `Rendering`,
/// `assigned_slave` already stamped, by the time it is returned).
pub async fn get_job(
    http: &reqwest::Client,
    master_url: &str,
    port: u16,
) -> Result<Option<RenderJob>, TransferError> {
    let res = http
        .get(format!("{master_url}/api/get_job?port={port}"))
        .send()
        .await?;
    if res.status() == reqwest::StatusCode::FORBIDDEN {
        return Err(TransferError::NotRegistered);
    }
    if !res.status().is_success() {
        return Err(TransferError::UnexpectedStatus(res.status()));
    }
    Ok(res.json().await?)
}

#[derive(Debug, Serialize)]
struct JobCompleteRequest<'a> {
    job_id: &'a str,
    success: bool,
    cancelled: bool,
    error: &'a str,
}

pub async fn job_complete(
    http: &reqwest::Client,
    master_url: &str,
    port: u16,
    job_id: &str,
    success: bool,
    cancelled: bool,
    error: &str,
) -> Result<(), TransferError> {
    let res = http
        .post(format!("{master_url}/api/job_complete?port={port}"))
        .json(&JobCompleteRequest {
            job_id,
            success,
            cancelled,
            error,
        })
        .send()
        .await?;
    if !res.status().is_success() {
        return Err(TransferError::UnexpectedStatus(res.status()));
    }
    Ok(())
}

/// Download the zip bundle for `job_id` and extract it into `dest_dir`
/// (created if missing). Returns the path of the first file found whose
/// name matches `project_file`'s file name, if any — used by the caller
/// to rewrite `job.project_file` into the extracted tree.
pub async fn download_and_extract(
    http: &reqwest::Client,
    master_url: &str,
    job_id: &str,
    dest_dir: &Path,
    project_file_name: &std::ffi::OsStr,
) -> Result<Option<PathBuf>, TransferError> {
    let res = http
        .get(format!("{master_url}/api/download_files/{job_id}"))
        .send()
        .await?;
    if !res.status().is_success() {
        return Err(TransferError::UnexpectedStatus(res.status()));
    }
    let bytes = res.bytes().await?;

    std::fs::create_dir_all(dest_dir)?;
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor)?;

    let mut found = None;
    for idx in 0..archive.len() {
        let mut entry = archive.by_index(idx)?;
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let out_path = dest_dir.join(&relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out_file = std::fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out_file)?;
        if out_path.file_name() == Some(project_file_name) {
            found = Some(out_path);
        }
    }
    Ok(found)
}

pub async fn cleanup_files(
    http: &reqwest::Client,
    master_url: &str,
    job_id: &str,
) -> Result<(), TransferError> {
    let res = http
        .delete(format!("{master_url}/api/cleanup_files/{job_id}"))
        .send()
        .await?;
    if !res.status().is_success() && res.status() != reqwest::StatusCode::NOT_FOUND {
        return Err(TransferError::UnexpectedStatus(res.status()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn build_test_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let cursor = std::io::Cursor::new(&mut buf);
            let mut writer = zip::ZipWriter::new(cursor);
            let options =
                zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
            for (name, data) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    #[tokio::test]
    async fn download_and_extract_locates_the_project_file() {
        let zip_bytes = build_test_zip(&[
            ("shot01.moho", b"project data"),
            ("Images/tex.png", b"texture"),
        ]);

        let app = axum::Router::new().route(
            "/api/download_files/{job_id}",
            axum::routing::get(move || {
                let body = zip_bytes.clone();
                async move { body }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dest = tempfile::tempdir().unwrap();
        let http = reqwest::Client::new();
        let found = download_and_extract(
            &http,
            &format!("http://{addr}"),
            "job-1",
            dest.path(),
            std::ffi::OsStr::new("shot01.moho"),
        )
        .await
        .unwrap();

        let found = found.expect("project file should be located in the archive");
        assert_eq!(std::fs::read(&found).unwrap(), b"project data");
        assert!(dest.path().join("Images/tex.png").exists());
    }
}
