//! `SlaveInfo`: per-slave record held by the master.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Reported liveness state of a connected slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlaveStatus {
    #[default]
    Idle,
    Rendering,
    Offline,
}

/// How long a slave may go without a heartbeat before it is considered
/// dead, regardless of its last-reported status.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SlaveInfo {
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    pub status: SlaveStatus,
    pub current_job_id: String,
    pub last_heartbeat: Instant,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
}

impl SlaveInfo {
    pub fn new(hostname: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            ip: ip.into(),
            port,
            status: SlaveStatus::Idle,
            current_job_id: String::new(),
            last_heartbeat: Instant::now(),
            jobs_completed: 0,
            jobs_failed: 0,
        }
    }

    /// `"{ip}:{port}"` — the registry/map key used throughout the
    /// lease protocol.
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// `is_alive := (now - last_heartbeat) < 30s`.
    pub fn is_alive(&self) -> bool {
        self.last_heartbeat.elapsed() < LIVENESS_TIMEOUT
    }

    /// Status as reported externally: a dead slave is always `offline`
    /// regardless of its last self-reported status.
    pub fn effective_status(&self) -> SlaveStatus {
        if self.is_alive() {
            self.status
        } else {
            SlaveStatus::Offline
        }
    }

    pub fn touch_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }
}

/// Wire-format snapshot of a `SlaveInfo`, for `/api/status` and
/// `/api/queue` responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveInfoDto {
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    pub status: SlaveStatus,
    pub current_job_id: String,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
}

impl From<&SlaveInfo> for SlaveInfoDto {
    fn from(s: &SlaveInfo) -> Self {
        Self {
            hostname: s.hostname.clone(),
            ip: s.ip.clone(),
            port: s.port,
            status: s.effective_status(),
            current_job_id: s.current_job_id.clone(),
            jobs_completed: s.jobs_completed,
            jobs_failed: s.jobs_failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_slave_is_alive_and_idle() {
        let slave = SlaveInfo::new("host-a", "10.0.0.1", 9000);
        assert!(slave.is_alive());
        assert_eq!(slave.effective_status(), SlaveStatus::Idle);
        assert_eq!(slave.address(), "10.0.0.1:9000");
    }

    #[test]
    fn effective_status_overrides_reported_status_when_dead() {
        let mut slave = SlaveInfo::new("host-a", "10.0.0.1", 9000);
        slave.status = SlaveStatus::Rendering;
        slave.last_heartbeat = Instant::now() - Duration::from_secs(31);
        assert!(!slave.is_alive());
        assert_eq!(slave.effective_status(), SlaveStatus::Offline);
    }
}
