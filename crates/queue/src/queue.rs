use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use renderfarm_core::Observer;
use renderfarm_core::{QueueDocument, RenderJob, RenderStatus};
use renderfarm_supervisor::{CancelToken, RenderSupervisor};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("no job with id {0}")]
    NotFound(String),
    #[error("job {0} is currently rendering")]
    Rendering(String),
    #[error("failed to persist queue: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to (de)serialize queue: {0}")]
    Json(#[from] serde_json::Error),
}

/// A point-in-time view of queue counters, cheap to clone for a
/// status endpoint or a UI poll.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub total: usize,
    pub pending: usize,
    pub rendering: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

struct Shared {
    jobs: Mutex<Vec<RenderJob>>,
    active: Mutex<HashMap<String, CancelToken>>,
    supervisor: Arc<RenderSupervisor>,
    observer: Arc<dyn Observer>,
    max_concurrent: usize,
    paused: AtomicBool,
    stopped: AtomicBool,
    running: AtomicBool,
    notify: Notify,
    // Number of workers currently rendering a job (not idle, not exited).
    busy_count: AtomicUsize,
    // Set once `queue_completed` has fired for the current drain, so a
    // worker pool that finishes draining fires it exactly once.
    completion_emitted: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn snapshot(&self) -> QueueSnapshot {
        let jobs = self.jobs.lock().expect("queue poisoned");
        let mut snap = QueueSnapshot::default();
        snap.total = jobs.len();
        for job in jobs.iter() {
            match job.status {
                RenderStatus::Pending => snap.pending += 1,
                RenderStatus::Rendering => snap.rendering += 1,
                RenderStatus::Completed => snap.completed += 1,
                RenderStatus::Failed => snap.failed += 1,
                RenderStatus::Cancelled => snap.cancelled += 1,
            }
        }
        snap
    }

    fn has_pending(&self) -> bool {
        self.jobs
            .lock()
            .expect("queue poisoned")
            .iter()
            .any(|j| j.status == RenderStatus::Pending)
    }

    /// True once every worker is idle and no pending job remains —
    /// the drain-complete condition.
    fn is_drained(&self) -> bool {
        self.busy_count.load(Ordering::SeqCst) == 0 && !self.has_pending()
    }
}

/// A fixed-size worker pool draining a shared job list. Cloning a
/// `LocalQueue` clones a handle to the same underlying state.
#[derive(Clone)]
pub struct LocalQueue {
    shared: Arc<Shared>,
}

impl LocalQueue {
    pub fn new(
        supervisor: Arc<RenderSupervisor>,
        observer: Arc<dyn Observer>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                jobs: Mutex::new(Vec::new()),
                active: Mutex::new(HashMap::new()),
                supervisor,
                observer,
                max_concurrent: max_concurrent.max(1),
                paused: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                running: AtomicBool::new(false),
                notify: Notify::new(),
                busy_count: AtomicUsize::new(0),
                completion_emitted: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn `max_concurrent` worker tasks. Idempotent while a drain
    /// is in flight; once a prior drain has fully exited (all worker
    /// tasks returned), calling `start` again re-spawns the pool — the
    /// expected use is add jobs, `start`, wait for `queue_completed`,
    /// repeat.
    pub fn start(&self) {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let mut workers = self.shared.workers.lock().expect("queue poisoned");
        workers.clear();
        self.shared.stopped.store(false, Ordering::SeqCst);
        self.shared.completion_emitted.store(false, Ordering::SeqCst);
        for idx in 0..self.shared.max_concurrent {
            let shared = self.shared.clone();
            workers.push(tokio::spawn(worker_loop(idx, shared)));
        }
    }

    /// Signal every worker to stop after its current job, cancel every
    /// in-flight render, and wait for all worker tasks to exit.
    pub async fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);
        {
            let active = self.shared.active.lock().expect("queue poisoned");
            for token in active.values() {
                token.cancel();
            }
        }
        self.shared.notify.notify_waiters();

        let handles: Vec<_> = {
            let mut workers = self.shared.workers.lock().expect("queue poisoned");
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Cancel every active supervisor without stopping the workers —
    /// they resume scanning for pending work immediately afterward.
    pub fn cancel_all_active(&self) {
        let active = self.shared.active.lock().expect("queue poisoned");
        for token in active.values() {
            token.cancel();
        }
    }

    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    pub fn add(&self, job: RenderJob) {
        {
            let mut jobs = self.shared.jobs.lock().expect("queue poisoned");
            jobs.push(job);
        }
        self.shared.completion_emitted.store(false, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        self.shared.observer.queue_changed();
    }

    pub fn remove(&self, job_id: &str) -> Result<RenderJob, QueueError> {
        let mut jobs = self.shared.jobs.lock().expect("queue poisoned");
        let idx = jobs
            .iter()
            .position(|j| j.id == job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
        if jobs[idx].status == RenderStatus::Rendering {
            return Err(QueueError::Rendering(job_id.to_string()));
        }
        let job = jobs.remove(idx);
        drop(jobs);
        self.shared.observer.queue_changed();
        Ok(job)
    }

    /// Swap the job one position towards the front (`delta < 0`) or
    /// back (`delta > 0`) in claim order. Out-of-range moves clamp to
    /// the nearest end rather than erroring, matching a UI's up/down
    /// reorder button.
    pub fn move_job(&self, job_id: &str, delta: i32) -> Result<(), QueueError> {
        let mut jobs = self.shared.jobs.lock().expect("queue poisoned");
        let idx = jobs
            .iter()
            .position(|j| j.id == job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
        let new_idx = (idx as i64 + delta as i64).clamp(0, jobs.len() as i64 - 1) as usize;
        if new_idx != idx {
            jobs.swap(idx, new_idx);
        }
        drop(jobs);
        self.shared.observer.queue_changed();
        Ok(())
    }

    pub fn retry(&self, job_id: &str) -> Result<(), QueueError> {
        let mut jobs = self.shared.jobs.lock().expect("queue poisoned");
        let job = jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
        if !job.retry() {
            return Err(QueueError::Rendering(job_id.to_string()));
        }
        drop(jobs);
        self.shared.completion_emitted.store(false, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        self.shared.observer.queue_changed();
        Ok(())
    }

    pub fn duplicate(&self, job_id: &str) -> Result<RenderJob, QueueError> {
        let mut jobs = self.shared.jobs.lock().expect("queue poisoned");
        let job = jobs
            .iter()
            .find(|j| j.id == job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
        let dup = job.duplicate();
        jobs.push(dup.clone());
        drop(jobs);
        self.shared.completion_emitted.store(false, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        self.shared.observer.queue_changed();
        Ok(dup)
    }

    /// Remove only `Completed` jobs, returning how many were removed.
    pub fn clear_completed(&self) -> usize {
        let mut jobs = self.shared.jobs.lock().expect("queue poisoned");
        let before = jobs.len();
        jobs.retain(|j| j.status != RenderStatus::Completed);
        let removed = before - jobs.len();
        drop(jobs);
        if removed > 0 {
            self.shared.observer.queue_changed();
        }
        removed
    }

    /// Remove every job not currently rendering, returning how many
    /// were removed.
    pub fn clear_all(&self) -> usize {
        let mut jobs = self.shared.jobs.lock().expect("queue poisoned");
        let before = jobs.len();
        jobs.retain(|j| j.status == RenderStatus::Rendering);
        let removed = before - jobs.len();
        drop(jobs);
        if removed > 0 {
            self.shared.observer.queue_changed();
        }
        removed
    }

    pub fn cancel_current(&self, job_id: &str) -> Result<(), QueueError> {
        let active = self.shared.active.lock().expect("queue poisoned");
        let token = active
            .get(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
        token.cancel();
        Ok(())
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.shared.snapshot()
    }

    pub fn total_jobs(&self) -> usize {
        self.shared.jobs.lock().expect("queue poisoned").len()
    }

    pub fn pending_count(&self) -> usize {
        self.count_with(RenderStatus::Pending)
    }

    pub fn completed_count(&self) -> usize {
        self.count_with(RenderStatus::Completed)
    }

    pub fn failed_count(&self) -> usize {
        self.count_with(RenderStatus::Failed)
    }

    fn count_with(&self, status: RenderStatus) -> usize {
        self.shared
            .jobs
            .lock()
            .expect("queue poisoned")
            .iter()
            .filter(|j| j.status == status)
            .count()
    }

    pub fn current_jobs(&self) -> Vec<RenderJob> {
        self.shared
            .jobs
            .lock()
            .expect("queue poisoned")
            .iter()
            .filter(|j| j.status == RenderStatus::Rendering)
            .cloned()
            .collect()
    }

    pub fn current_job(&self) -> Option<RenderJob> {
        self.current_jobs().into_iter().next()
    }

    pub fn all_jobs(&self) -> Vec<RenderJob> {
        self.shared.jobs.lock().expect("queue poisoned").clone()
    }

    /// Persist the full job list atomically (write-then-rename), as
    /// `{"version":"1.0","jobs":[...]}`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), QueueError> {
        let path = path.as_ref();
        let doc = QueueDocument::new(self.all_jobs());
        let json = serde_json::to_string_pretty(&doc)?;
        let tmp: PathBuf = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(tmp, path)?;
        Ok(())
    }

    /// Load `path`'s job list. Every loaded job not already `Rendering`
    /// is reset to `pending`. When `append` is `false` the current list
    /// is replaced; when `true`, loaded jobs are added alongside
    /// whatever is already queued.
    pub fn load(&self, path: impl AsRef<Path>, append: bool) -> Result<(), QueueError> {
        let raw = std::fs::read_to_string(path)?;
        let doc: QueueDocument = serde_json::from_str(&raw)?;
        let mut loaded = doc.jobs;
        for job in &mut loaded {
            job.reset_on_load();
        }
        let mut jobs = self.shared.jobs.lock().expect("queue poisoned");
        if append {
            jobs.extend(loaded);
        } else {
            *jobs = loaded;
        }
        drop(jobs);
        self.shared.completion_emitted.store(false, Ordering::SeqCst);
        self.shared.observer.queue_changed();
        Ok(())
    }
}

async fn worker_loop(idx: usize, shared: Arc<Shared>) {
    let assigned_slave = format!("local-worker-{idx}");

    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        if shared.paused.load(Ordering::SeqCst) {
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            continue;
        }

        let claimed = {
            let mut jobs = shared.jobs.lock().expect("queue poisoned");
            let job = jobs.iter_mut().find(|j| j.status == RenderStatus::Pending);
            job.map(|j| {
                j.mark_rendering(assigned_slave.clone());
                j.clone()
            })
        };

        let Some(mut job) = claimed else {
            if shared.is_drained() {
                if shared
                    .completion_emitted
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    shared.running.store(false, Ordering::SeqCst);
                    shared.observer.queue_completed();
                }
                // Every worker terminates once the queue is drained,
                // not just the one that won the emit race.
                return;
            }
            tokio::select! {
                _ = shared.notify.notified() => {}
                _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
            }
            continue;
        };

        shared.busy_count.fetch_add(1, Ordering::SeqCst);
        let cancel = CancelToken::new();
        shared
            .active
            .lock()
            .expect("queue poisoned")
            .insert(job.id.clone(), cancel.clone());
        shared.observer.queue_changed();

        shared
            .supervisor
            .render(&mut job, &assigned_slave, &cancel, shared.observer.as_ref())
            .await;

        {
            let mut jobs = shared.jobs.lock().expect("queue poisoned");
            if let Some(slot) = jobs.iter_mut().find(|j| j.id == job.id) {
                *slot = job;
            }
        }
        shared.active.lock().expect("queue poisoned").remove(&job.id);
        shared.busy_count.fetch_sub(1, Ordering::SeqCst);
        shared.observer.queue_changed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderfarm_core::RecordingObserver;

    fn test_supervisor() -> Arc<RenderSupervisor> {
        Arc::new(RenderSupervisor::new("/bin/true"))
    }

    #[test]
    fn add_and_remove_round_trip() {
        let observer = Arc::new(RecordingObserver::new());
        let queue = LocalQueue::new(test_supervisor(), observer, 1);
        let job = RenderJob::new("/tmp/p.moho");
        let id = job.id.clone();
        queue.add(job);
        assert_eq!(queue.total_jobs(), 1);
        let removed = queue.remove(&id).unwrap();
        assert_eq!(removed.id, id);
        assert_eq!(queue.total_jobs(), 0);
    }

    #[test]
    fn clear_completed_only_removes_completed_jobs() {
        let observer = Arc::new(RecordingObserver::new());
        let queue = LocalQueue::new(test_supervisor(), observer, 1);
        let mut completed = RenderJob::new("/tmp/a.moho");
        completed.mark_rendering("");
        completed.mark_completed();
        queue.add(completed);
        queue.add(RenderJob::new("/tmp/b.moho"));

        let removed = queue.clear_completed();
        assert_eq!(removed, 1);
        assert_eq!(queue.total_jobs(), 1);
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn move_job_clamps_at_the_ends() {
        let observer = Arc::new(RecordingObserver::new());
        let queue = LocalQueue::new(test_supervisor(), observer, 1);
        let a = RenderJob::new("/tmp/a.moho");
        let a_id = a.id.clone();
        queue.add(a);
        queue.add(RenderJob::new("/tmp/b.moho"));

        queue.move_job(&a_id, -1).unwrap(); // already at front; clamps, no-op
        let jobs = queue.all_jobs();
        assert_eq!(jobs[0].id, a_id);

        queue.move_job(&a_id, 1).unwrap();
        let jobs = queue.all_jobs();
        assert_eq!(jobs[1].id, a_id);
    }

    #[test]
    fn save_and_load_round_trip_through_a_file() {
        let observer = Arc::new(RecordingObserver::new());
        let queue = LocalQueue::new(test_supervisor(), observer.clone(), 1);
        let mut rendering = RenderJob::new("/tmp/a.moho");
        rendering.mark_rendering("host");
        queue.add(rendering);
        queue.add(RenderJob::new("/tmp/b.moho"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        queue.save(&path).unwrap();

        let reloaded = LocalQueue::new(test_supervisor(), observer, 1);
        reloaded.load(&path, false).unwrap();
        assert_eq!(reloaded.total_jobs(), 2);
        // the job that was `Rendering` at save time comes back `Pending`.
        assert_eq!(reloaded.pending_count(), 2);
    }

    #[test]
    fn load_with_append_keeps_existing_jobs() {
        let observer = Arc::new(RecordingObserver::new());
        let queue = LocalQueue::new(test_supervisor(), observer.clone(), 1);
        queue.add(RenderJob::new("/tmp/a.moho"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let doc = QueueDocument::new(vec![RenderJob::new("/tmp/b.moho")]);
        std::fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();

        queue.load(&path, true).unwrap();
        assert_eq!(queue.total_jobs(), 2);
    }

    #[tokio::test]
    async fn duplicate_creates_a_fresh_pending_job() {
        let observer = Arc::new(RecordingObserver::new());
        let queue = LocalQueue::new(test_supervisor(), observer, 1);
        let job = RenderJob::new("/tmp/a.moho");
        let id = job.id.clone();
        queue.add(job);
        let dup = queue.duplicate(&id).unwrap();
        assert_ne!(dup.id, id);
        assert_eq!(queue.total_jobs(), 2);
    }

    #[tokio::test]
    async fn drains_to_completion_and_fires_queue_completed_once() {
        let observer = Arc::new(RecordingObserver::new());
        let queue = LocalQueue::new(test_supervisor(), observer.clone(), 2);
        queue.add(RenderJob::new("/bin/true"));
        queue.add(RenderJob::new("/bin/true"));
        queue.start();

        for _ in 0..200 {
            if queue.completed_count() + queue.failed_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        queue.stop().await;

        let completions = observer
            .events()
            .into_iter()
            .filter(|e| matches!(e, renderfarm_core::observer::RecordedEvent::QueueCompleted))
            .count();
        assert!(completions <= 1, "queue_completed must fire at most once");
    }
}
