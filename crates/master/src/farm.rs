//! `Farm`: the master's four job collections plus slave registry,
//! behind one lock protecting all four job collections and the slave
//! registry together.
//!
//! `Farm` holds the logic; `api.rs` is a thin axum surface over it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use renderfarm_core::{Observer, RenderJob, RenderStatus, SlaveInfo, SlaveStatus};

#[derive(Debug, thiserror::Error)]
pub enum FarmError {
    #[error("slave {0} is not registered")]
    NotRegistered(String),
}

/// Response to a `register` call.
#[derive(Debug, Clone)]
pub struct RegisterResult {
    pub address: String,
}

/// Response to a `heartbeat` call: signals the master wants relayed
/// back to the slave on its next poll.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatResult {
    pub cancel_jobs: Vec<String>,
    pub force_update: bool,
}

/// All jobs, grouped by collection, for GUI/status display.
#[derive(Debug, Clone, Default)]
pub struct FarmJobs {
    pub pending: Vec<RenderJob>,
    pub reserved: Vec<RenderJob>,
    pub active: Vec<RenderJob>,
    pub completed: Vec<RenderJob>,
}

struct State {
    slaves: HashMap<String, SlaveInfo>,
    pending: Vec<RenderJob>,
    reserved: HashMap<String, RenderJob>,
    active: HashMap<String, RenderJob>,
    completed: Vec<RenderJob>,
    cancel_signals: HashMap<String, Vec<String>>,
    force_update: bool,
}

/// The farm's distributed job queue and slave registry. All
/// state-mutating methods take the single internal lock for their
/// critical section and release it before invoking the observer (spec
/// §5: "callbacks are always invoked without any lock held").
pub struct Farm {
    state: Mutex<State>,
    observer: Arc<dyn Observer>,
}

impl Farm {
    pub fn new(observer: Arc<dyn Observer>) -> Self {
        Self {
            state: Mutex::new(State {
                slaves: HashMap::new(),
                pending: Vec::new(),
                reserved: HashMap::new(),
                active: HashMap::new(),
                completed: Vec::new(),
                cancel_signals: HashMap::new(),
                force_update: false,
            }),
            observer,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("farm poisoned")
    }

    /// `register(hostname, port)`: upsert `SlaveInfo` for
    /// `(client_ip, port)`. Resurrects an offline slave to idle.
    pub fn register(&self, hostname: &str, ip: &str, port: u16) -> RegisterResult {
        let address = format!("{ip}:{port}");
        {
            let mut state = self.lock();
            match state.slaves.get_mut(&address) {
                Some(slave) => {
                    slave.touch_heartbeat();
                    slave.hostname = hostname.to_string();
                    if slave.status == SlaveStatus::Offline {
                        slave.status = SlaveStatus::Idle;
                    }
                }
                None => {
                    state
                        .slaves
                        .insert(address.clone(), SlaveInfo::new(hostname, ip, port));
                }
            }
        }
        self.observer
            .output(&format!("slave connected: {hostname} ({address})"));
        RegisterResult { address }
    }

    /// `heartbeat(port, status, active_jobs)`: stamp `last_heartbeat`
    /// and the reported status; return any signals queued for this
    /// slave.
    pub fn heartbeat(&self, ip: &str, port: u16, status: SlaveStatus) -> HeartbeatResult {
        let address = format!("{ip}:{port}");
        let mut state = self.lock();
        if let Some(slave) = state.slaves.get_mut(&address) {
            slave.touch_heartbeat();
            slave.status = status;
        }
        let cancel_jobs = state.cancel_signals.remove(&address).unwrap_or_default();
        HeartbeatResult {
            cancel_jobs,
            force_update: state.force_update,
        }
    }

    pub fn set_force_update(&self, flag: bool) {
        self.lock().force_update = flag;
    }

    /// Lease protocol: reserve the oldest pending job for this slave
    /// and hand it over already marked rendering.
    pub fn get_job(&self, ip: &str, port: u16) -> Result<Option<RenderJob>, FarmError> {
        let address = format!("{ip}:{port}");
        let job = {
            let mut state = self.lock();
            if !state.slaves.contains_key(&address) {
                return Err(FarmError::NotRegistered(address));
            }
            if let Some(slave) = state.slaves.get_mut(&address) {
                slave.touch_heartbeat();
            }

            let job = state
                .reserved
                .remove(&address)
                .or_else(|| state.pending.first().is_some().then(|| state.pending.remove(0)));

            let Some(mut job) = job else {
                return Ok(None);
            };

            job.mark_rendering(address.clone());
            if let Some(slave) = state.slaves.get_mut(&address) {
                slave.status = SlaveStatus::Rendering;
                slave.current_job_id = job.id.clone();
            }
            state.active.insert(address.clone(), job.clone());
            job
        };

        self.observer.queue_changed();
        self.observer
            .output(&format!("job assigned: {} -> {address}", job.project_name()));
        Ok(Some(job))
    }

    /// Completion handling: move the slave's active job into
    /// `completed`, recording success, cancellation, or the error.
    ///
    /// A slave that reappears after being declared offline may still
    /// report on a job the master has already requeued and handed to
    /// someone else. The report is accepted rather than rejected: the
    /// slave's status still goes back to idle, but no job is mutated
    /// since the master no longer has an active entry to attribute it
    /// to.
    pub fn job_complete(
        &self,
        ip: &str,
        port: u16,
        success: bool,
        cancelled: bool,
        error: &str,
    ) -> Option<RenderJob> {
        let address = format!("{ip}:{port}");
        let job = {
            let mut state = self.lock();
            let Some(mut job) = state.active.remove(&address) else {
                if let Some(slave) = state.slaves.get_mut(&address) {
                    slave.status = SlaveStatus::Idle;
                    slave.current_job_id.clear();
                }
                return None;
            };

            if cancelled {
                job.mark_cancelled();
            } else if success {
                job.mark_completed();
                if let Some(slave) = state.slaves.get_mut(&address) {
                    slave.jobs_completed += 1;
                }
            } else {
                job.mark_failed(error);
                if let Some(slave) = state.slaves.get_mut(&address) {
                    slave.jobs_failed += 1;
                }
            }
            state.completed.push(job.clone());

            if let Some(slave) = state.slaves.get_mut(&address) {
                slave.status = SlaveStatus::Idle;
                slave.current_job_id.clear();
            }
            job
        };

        match job.status {
            RenderStatus::Completed => self.observer.job_completed(&job),
            RenderStatus::Failed => self.observer.job_failed(&job),
            _ => {}
        }
        self.observer.queue_changed();
        Some(job)
    }

    pub fn add_job(&self, mut job: RenderJob) -> String {
        job.reset_on_load();
        let id = job.id.clone();
        {
            let mut state = self.lock();
            state.pending.push(job);
        }
        self.observer.queue_changed();
        id
    }

    /// Reserve a pending job for a specific slave (manual assignment).
    /// A reservation is discarded — the job goes back to the head of
    /// `pending` — if the target is unregistered or not alive.
    pub fn assign_job_to_slave(&self, job_id: &str, slave_address: &str) -> bool {
        let assigned = {
            let mut state = self.lock();
            let Some(idx) = state.pending.iter().position(|j| j.id == job_id) else {
                return false;
            };
            let job = state.pending.remove(idx);

            let alive = state
                .slaves
                .get(slave_address)
                .map(SlaveInfo::is_alive)
                .unwrap_or(false);
            if !alive {
                state.pending.insert(0, job);
                false
            } else {
                state.reserved.insert(slave_address.to_string(), job);
                true
            }
        };
        if assigned {
            self.observer.queue_changed();
        }
        assigned
    }

    /// `cancel_job`: remove from `pending`/`reserved` and mark
    /// cancelled. An `active` job cannot be killed directly — the
    /// master instead queues a cancel signal delivered on the slave's
    /// next heartbeat.
    pub fn cancel_job(&self, job_id: &str) -> Option<RenderJob> {
        let job = {
            let mut state = self.lock();
            if let Some(idx) = state.pending.iter().position(|j| j.id == job_id) {
                let mut job = state.pending.remove(idx);
                job.mark_cancelled();
                state.completed.push(job.clone());
                Some(job)
            } else if let Some(address) = state
                .reserved
                .iter()
                .find(|(_, j)| j.id == job_id)
                .map(|(address, _)| address.clone())
            {
                let mut job = state.reserved.remove(&address).expect("checked above");
                job.mark_cancelled();
                state.completed.push(job.clone());
                Some(job)
            } else if let Some(address) = state
                .active
                .iter()
                .find(|(_, j)| j.id == job_id)
                .map(|(address, _)| address.clone())
            {
                state
                    .cancel_signals
                    .entry(address)
                    .or_default()
                    .push(job_id.to_string());
                None
            } else {
                None
            }
        };
        self.observer.queue_changed();
        job
    }

    /// `remove_job_from_farm`: like `cancel_job` for pending/reserved
    /// jobs, but does not add to `completed` history — used to hand a
    /// job back to a local queue.
    pub fn remove_job_from_farm(&self, job_id: &str) -> Option<RenderJob> {
        let job = {
            let mut state = self.lock();
            if let Some(idx) = state.pending.iter().position(|j| j.id == job_id) {
                Some(state.pending.remove(idx))
            } else if let Some(address) = state
                .reserved
                .iter()
                .find(|(_, j)| j.id == job_id)
                .map(|(address, _)| address.clone())
            {
                state.reserved.remove(&address)
            } else {
                None
            }
        };
        if job.is_some() {
            self.observer.queue_changed();
        }
        job
    }

    pub fn get_all_farm_jobs(&self) -> FarmJobs {
        let state = self.lock();
        FarmJobs {
            pending: state.pending.clone(),
            reserved: state.reserved.values().cloned().collect(),
            active: state.active.values().cloned().collect(),
            completed: state.completed.clone(),
        }
    }

    pub fn clear_completed_farm_jobs(&self) -> usize {
        let count = {
            let mut state = self.lock();
            let count = state.completed.len();
            state.completed.clear();
            count
        };
        self.observer.queue_changed();
        count
    }

    pub fn slaves(&self) -> Vec<SlaveInfo> {
        self.lock().slaves.values().cloned().collect()
    }

    /// Liveness sweeper: called periodically. For each slave whose
    /// heartbeat has expired, mark it offline and requeue anything it
    /// held to the *head* of `pending`.
    pub fn sweep_liveness(&self) {
        let (newly_offline, requeued) = {
            let mut state = self.lock();
            let mut newly_offline = Vec::new();
            let mut requeued = Vec::new();

            let dead_addresses: Vec<String> = state
                .slaves
                .iter()
                .filter(|(_, s)| !s.is_alive() && s.status != SlaveStatus::Offline)
                .map(|(address, _)| address.clone())
                .collect();

            for address in dead_addresses {
                if let Some(slave) = state.slaves.get_mut(&address) {
                    slave.status = SlaveStatus::Offline;
                    newly_offline.push(slave.clone());
                }
                if let Some(mut job) = state.active.remove(&address) {
                    job.requeue_after_slave_loss();
                    state.pending.insert(0, job.clone());
                    requeued.push(job);
                }
                if let Some(mut job) = state.reserved.remove(&address) {
                    job.requeue_after_slave_loss();
                    state.pending.insert(0, job.clone());
                    requeued.push(job);
                }
            }
            (newly_offline, requeued)
        };

        for slave in &newly_offline {
            self.observer
                .output(&format!("slave disconnected: {} ({})", slave.hostname, slave.address()));
        }
        if !requeued.is_empty() {
            self.observer.queue_changed();
        }
    }
}
