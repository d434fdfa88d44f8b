//! The observer contract: a single interface with the six named
//! events plus `queue_changed`, invoked by `LocalQueue`, `MasterServer`,
//! and `SlaveClient` without any internal lock held.
//!
//! An explicit trait rather than mutable callback attributes, so a
//! GUI adapter, a structured logger, and a test recorder can all
//! implement the same seam.

use crate::job::RenderJob;
use std::sync::Mutex;

/// Six lifecycle events plus `queue_changed`, invoked without any lock
/// held by the invoking component.
///
/// Every method has a no-op default so an implementation overrides
/// only what it needs.
pub trait Observer: Send + Sync {
    fn job_started(&self, _job: &RenderJob) {}
    fn job_completed(&self, _job: &RenderJob) {}
    fn job_failed(&self, _job: &RenderJob) {}
    fn queue_completed(&self) {}
    fn output(&self, _line: &str) {}
    fn progress(&self, _job: &RenderJob, _progress: f64) {}
    fn queue_changed(&self) {}
}

/// An observer that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl Observer for NullObserver {}

/// Writes lines to stdout via `println!`. Optionally also appends to a
/// log file, so a persistent trace survives past a single session.
pub struct LoggingObserver {
    log_file: Option<Mutex<std::fs::File>>,
}

impl LoggingObserver {
    /// Log only to stdout/stderr.
    pub fn stdout() -> Self {
        Self { log_file: None }
    }

    /// Also append every line to `path`.
    pub fn with_log_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        use std::fs::OpenOptions;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            log_file: Some(Mutex::new(file)),
        })
    }

    fn write_line(&self, line: &str) {
        println!("{line}");
        if let Some(file) = &self.log_file {
            use std::io::Write as _;
            if let Ok(mut file) = file.lock() {
                let _ = writeln!(file, "{line}");
            }
        }
    }
}

impl Observer for LoggingObserver {
    fn job_started(&self, job: &RenderJob) {
        self.write_line(&format!("[{}] started: {}", job.id, job.project_name()));
    }

    fn job_completed(&self, job: &RenderJob) {
        self.write_line(&format!("[{}] completed: {}", job.id, job.project_name()));
    }

    fn job_failed(&self, job: &RenderJob) {
        self.write_line(&format!(
            "[{}] FAILED: {}: {}",
            job.id,
            job.project_name(),
            job.error_message
        ));
    }

    fn queue_completed(&self) {
        self.write_line("queue completed");
    }

    fn output(&self, line: &str) {
        self.write_line(line);
    }

    fn progress(&self, _job: &RenderJob, _progress: f64) {
        // Progress ticks are high-frequency; leave them for a progress
        // bar to render rather than spamming a log line per tick.
    }

    fn queue_changed(&self) {}
}

/// Recorded events, for asserting callback ordering in tests:
/// `job_started` should strictly precede `progress`, which should
/// strictly precede the terminal callback.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedEvent {
    JobStarted(String),
    JobCompleted(String),
    JobFailed(String),
    QueueCompleted,
    Output(String),
    Progress(String, f64),
    QueueChanged,
}

/// Collects every event into a `Vec` behind a mutex, for assertions in
/// tests.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().expect("recording observer poisoned").clone()
    }

    fn push(&self, event: RecordedEvent) {
        self.events
            .lock()
            .expect("recording observer poisoned")
            .push(event);
    }
}

impl Observer for RecordingObserver {
    fn job_started(&self, job: &RenderJob) {
        self.push(RecordedEvent::JobStarted(job.id.clone()));
    }

    fn job_completed(&self, job: &RenderJob) {
        self.push(RecordedEvent::JobCompleted(job.id.clone()));
    }

    fn job_failed(&self, job: &RenderJob) {
        self.push(RecordedEvent::JobFailed(job.id.clone()));
    }

    fn queue_completed(&self) {
        self.push(RecordedEvent::QueueCompleted);
    }

    fn output(&self, line: &str) {
        self.push(RecordedEvent::Output(line.to_string()));
    }

    fn progress(&self, job: &RenderJob, progress: f64) {
        self.push(RecordedEvent::Progress(job.id.clone(), progress));
    }

    fn queue_changed(&self) {
        self.push(RecordedEvent::QueueChanged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_observer_preserves_call_order() {
        let observer = RecordingObserver::new();
        let job = RenderJob::new("/p.moho");
        observer.job_started(&job);
        observer.progress(&job, 50.0);
        observer.job_completed(&job);
        let events = observer.events();
        assert_eq!(
            events,
            vec![
                RecordedEvent::JobStarted(job.id.clone()),
                RecordedEvent::Progress(job.id.clone(), 50.0),
                RecordedEvent::JobCompleted(job.id.clone()),
            ]
        );
    }
}
