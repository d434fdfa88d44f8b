//! `RenderJob`: immutable description plus mutable runtime state of one
//! unit of work, and its lifecycle state machine.
//!
//! A serde-friendly wire shape: small DTOs with `#[serde(default)]` on
//! every optional/runtime field so unknown or missing fields never
//! fail a deserialize.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::id::short_id;

/// Position of a job in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderStatus {
    Pending,
    Rendering,
    Completed,
    Failed,
    Cancelled,
}

impl RenderStatus {
    /// Terminal states have no outgoing transitions except `retry`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RenderStatus::Completed | RenderStatus::Failed | RenderStatus::Cancelled
        )
    }
}

impl Default for RenderStatus {
    fn default() -> Self {
        RenderStatus::Pending
    }
}

/// One parameterised invocation of the external renderer, with a
/// unique id and mutable lifecycle.
///
/// The renderer-flag set (`multithread` .. `createfolderforlayercomps`,
/// `videocodec`, `quality`, `depth`) is a closed set passed through
/// verbatim to the external tool's argument vector by an injected
/// `ArgBuilder` (see `renderfarm-supervisor`) — this type never builds
/// the command line itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderJob {
    pub id: String,
    pub project_file: PathBuf,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub options: String,
    #[serde(default)]
    pub layercomp: String,
    #[serde(default)]
    pub start_frame: Option<u32>,
    #[serde(default)]
    pub end_frame: Option<u32>,

    #[serde(default = "default_true")]
    pub verbose: bool,
    #[serde(default)]
    pub quiet: bool,
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub multithread: Option<bool>,
    #[serde(default)]
    pub halfsize: Option<bool>,
    #[serde(default)]
    pub halffps: Option<bool>,
    #[serde(default)]
    pub shapefx: Option<bool>,
    #[serde(default)]
    pub layerfx: Option<bool>,
    #[serde(default)]
    pub fewparticles: Option<bool>,
    #[serde(default)]
    pub aa: Option<bool>,
    #[serde(default)]
    pub extrasmooth: Option<bool>,
    #[serde(default)]
    pub premultiply: Option<bool>,
    #[serde(default)]
    pub ntscsafe: Option<bool>,
    #[serde(default)]
    pub addformatsuffix: Option<bool>,
    #[serde(default)]
    pub addlayercompsuffix: Option<bool>,
    #[serde(default)]
    pub createfolderforlayercomps: Option<bool>,
    #[serde(default)]
    pub videocodec: Option<i32>,
    #[serde(default)]
    pub quality: Option<i32>,
    #[serde(default)]
    pub depth: Option<i32>,

    #[serde(default)]
    pub compose_layers: bool,
    #[serde(default)]
    pub compose_reverse_order: bool,
    #[serde(default)]
    pub copy_images: bool,
    #[serde(default)]
    pub subfolder_project: bool,
    /// Set by the submitter when `project_file` (and any sibling
    /// assets) were uploaded to the master's blob side-channel rather
    /// than being locally reachable from the leasing slave. A slave
    /// that leases a job with this set downloads and extracts the
    /// bundle before rendering.
    #[serde(default)]
    pub files_uploaded: bool,

    // Runtime state.
    #[serde(default)]
    pub status: RenderStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assigned_slave: String,
}

fn default_format() -> String {
    "MP4".to_string()
}

fn default_true() -> bool {
    true
}

impl RenderJob {
    /// Construct a new pending job for `project_file`.
    pub fn new(project_file: impl Into<PathBuf>) -> Self {
        Self {
            id: short_id(),
            project_file: project_file.into(),
            output_path: None,
            format: default_format(),
            options: String::new(),
            layercomp: String::new(),
            start_frame: None,
            end_frame: None,
            verbose: true,
            quiet: false,
            log_file: None,
            multithread: None,
            halfsize: None,
            halffps: None,
            shapefx: None,
            layerfx: None,
            fewparticles: None,
            aa: None,
            extrasmooth: None,
            premultiply: None,
            ntscsafe: None,
            addformatsuffix: None,
            addlayercompsuffix: None,
            createfolderforlayercomps: None,
            videocodec: None,
            quality: None,
            depth: None,
            compose_layers: false,
            compose_reverse_order: false,
            copy_images: false,
            subfolder_project: false,
            files_uploaded: false,
            status: RenderStatus::Pending,
            progress: 0.0,
            error_message: String::new(),
            start_time: None,
            end_time: None,
            assigned_slave: String::new(),
        }
    }

    /// `Path::file_stem` of `project_file`, used only in log lines.
    pub fn project_name(&self) -> String {
        self.project_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// `pending -> rendering`. Caller is responsible for the atomic
    /// claim (see `renderfarm-queue`/`renderfarm-master`'s lock
    /// discipline); this only applies the field changes.
    pub fn mark_rendering(&mut self, assigned_slave: impl Into<String>) {
        self.status = RenderStatus::Rendering;
        self.start_time = Some(Utc::now());
        self.end_time = None;
        self.progress = 0.0;
        self.error_message.clear();
        self.assigned_slave = assigned_slave.into();
    }

    /// `rendering -> completed`.
    pub fn mark_completed(&mut self) {
        self.status = RenderStatus::Completed;
        self.progress = 100.0;
        self.end_time = Some(Utc::now());
    }

    /// `rendering -> failed`.
    pub fn mark_failed(&mut self, error_message: impl Into<String>) {
        self.status = RenderStatus::Failed;
        self.error_message = error_message.into();
        self.end_time = Some(Utc::now());
    }

    /// `rendering -> cancelled`.
    pub fn mark_cancelled(&mut self) {
        self.status = RenderStatus::Cancelled;
        self.end_time = Some(Utc::now());
    }

    /// Reset a terminal job back to `pending`, clearing all runtime
    /// fields. No-op (returns `false`) if the job is not terminal.
    pub fn retry(&mut self) -> bool {
        if !self.status.is_terminal() {
            return false;
        }
        self.reset_runtime();
        true
    }

    /// Reset-on-load: used by queue/load and master/register paths for
    /// jobs found in a non-rendering state. Unlike `retry`, this does
    /// not require the job to be terminal (a `pending` job loaded from
    /// disk is reset too, which is a no-op on its fields).
    pub fn reset_on_load(&mut self) {
        if self.status != RenderStatus::Rendering {
            self.reset_runtime();
        }
    }

    /// Unconditionally reset back to `pending`, regardless of current
    /// status — including `rendering`. Used by the master's liveness
    /// sweeper to requeue a job pulled out of `active`: that job is
    /// always `rendering` (that's what made it active), so
    /// `reset_on_load`'s "leave rendering jobs alone" guard would
    /// otherwise requeue it still marked as rendering and still
    /// pointing at the dead slave.
    pub fn requeue_after_slave_loss(&mut self) {
        self.reset_runtime();
    }

    fn reset_runtime(&mut self) {
        self.status = RenderStatus::Pending;
        self.progress = 0.0;
        self.error_message.clear();
        self.start_time = None;
        self.end_time = None;
        self.assigned_slave.clear();
    }

    /// Duplicate this job as a new pending job with a fresh id.
    pub fn duplicate(&self) -> RenderJob {
        let mut copy = self.clone();
        copy.id = short_id();
        copy.reset_runtime();
        copy
    }

    /// Directory that must exist before the external process spawns:
    /// the parent of `output_path` if it looks like a file path (has an
    /// extension), else `output_path` itself.
    pub fn output_dir(&self) -> Option<PathBuf> {
        let out = self.output_path.as_ref()?;
        if has_extension(out) {
            out.parent().map(Path::to_path_buf)
        } else {
            Some(out.clone())
        }
    }
}

fn has_extension(path: &Path) -> bool {
    path.extension().is_some()
}

/// A persisted queue document: `{"version":"1.0","jobs":[...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDocument {
    pub version: String,
    pub jobs: Vec<RenderJob>,
}

impl QueueDocument {
    pub fn new(jobs: Vec<RenderJob>) -> Self {
        Self {
            version: "1.0".to_string(),
            jobs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_pending_with_zero_progress() {
        let job = RenderJob::new("/tmp/p.moho");
        assert_eq!(job.status, RenderStatus::Pending);
        assert_eq!(job.progress, 0.0);
        assert!(job.end_time.is_none());
    }

    #[test]
    fn mark_completed_sets_progress_100_and_end_time() {
        let mut job = RenderJob::new("/tmp/p.moho");
        job.mark_rendering("");
        job.mark_completed();
        assert_eq!(job.status, RenderStatus::Completed);
        assert_eq!(job.progress, 100.0);
        assert!(job.end_time.is_some());
        assert!(job.end_time.unwrap() >= job.start_time.unwrap());
    }

    #[test]
    fn mark_failed_records_message_and_end_time() {
        let mut job = RenderJob::new("/tmp/p.moho");
        job.mark_rendering("");
        job.mark_failed("bad project");
        assert_eq!(job.status, RenderStatus::Failed);
        assert_eq!(job.error_message, "bad project");
        assert!(job.end_time.is_some());
        assert_ne!(job.progress, 100.0);
    }

    #[test]
    fn retry_only_works_from_terminal_states() {
        let mut job = RenderJob::new("/tmp/p.moho");
        assert!(!job.retry(), "pending is not terminal");
        job.mark_rendering("");
        assert!(!job.retry(), "rendering is not terminal");
        job.mark_failed("oops");
        assert!(job.retry());
        assert_eq!(job.status, RenderStatus::Pending);
        assert_eq!(job.progress, 0.0);
        assert_eq!(job.error_message, "");
        assert!(job.start_time.is_none());
        assert!(job.end_time.is_none());
    }

    #[test]
    fn reset_on_load_leaves_rendering_jobs_untouched_but_resets_others() {
        let mut rendering = RenderJob::new("/tmp/a.moho");
        rendering.mark_rendering("host:1");
        rendering.reset_on_load();
        assert_eq!(rendering.status, RenderStatus::Rendering);

        let mut completed = RenderJob::new("/tmp/b.moho");
        completed.mark_rendering("");
        completed.mark_completed();
        completed.reset_on_load();
        assert_eq!(completed.status, RenderStatus::Pending);
        assert_eq!(completed.progress, 0.0);
    }

    #[test]
    fn requeue_after_slave_loss_resets_a_rendering_job() {
        let mut job = RenderJob::new("/tmp/a.moho");
        job.mark_rendering("10.0.0.5:9000");
        job.requeue_after_slave_loss();
        assert_eq!(job.status, RenderStatus::Pending);
        assert_eq!(job.assigned_slave, "");
        assert_eq!(job.progress, 0.0);
    }

    #[test]
    fn duplicate_gets_a_new_id_and_pending_state() {
        let mut original = RenderJob::new("/tmp/p.moho");
        original.mark_rendering("");
        original.mark_completed();
        let dup = original.duplicate();
        assert_ne!(dup.id, original.id);
        assert_eq!(dup.status, RenderStatus::Pending);
        assert_eq!(dup.project_file, original.project_file);
    }

    #[test]
    fn output_dir_distinguishes_file_from_directory_targets() {
        let mut job = RenderJob::new("/tmp/p.moho");
        job.output_path = Some(PathBuf::from("/out/render.mp4"));
        assert_eq!(job.output_dir(), Some(PathBuf::from("/out")));

        job.output_path = Some(PathBuf::from("/out/frames"));
        assert_eq!(job.output_dir(), Some(PathBuf::from("/out/frames")));
    }

    #[test]
    fn queue_document_round_trips_through_json() {
        let mut job = RenderJob::new("/tmp/p.moho");
        job.mark_rendering("");
        job.mark_completed();
        let doc = QueueDocument::new(vec![job]);
        let json = serde_json::to_string(&doc).unwrap();
        let parsed: QueueDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.version, "1.0");
        assert_eq!(parsed.jobs.len(), 1);
        assert_eq!(parsed.jobs[0].status, RenderStatus::Completed);
    }

    #[test]
    fn unknown_fields_are_ignored_on_load() {
        let raw = r#"{"id":"abc12345","project_file":"/p.moho","unknown_field":42}"#;
        let job: RenderJob = serde_json::from_str(raw).unwrap();
        assert_eq!(job.id, "abc12345");
        assert_eq!(job.format, "MP4");
    }
}
