//! `RenderSupervisor`: spawns the external render tool for one job,
//! parses its stdout for progress, and mediates cancellation.
//!
//! A worker owns one in-flight child process and reports through an
//! observer rather than returning partial state. The process
//! lifecycle: launch, watch for `Done!`, terminate with a grace period
//! before killing.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use renderfarm_core::{Observer, RenderJob};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::time::{interval, timeout};

use crate::args::{ArgBuilder, DefaultArgBuilder};
use crate::compose::{ComposeAdapter, NullComposeAdapter};
use crate::progress::{
    frame_progress, image_sequence_progress, is_done_marker, is_noise_line, parse_frame_line,
    video_file_progress,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const STDERR_TAIL_LIMIT: usize = 500;

/// The last `limit` characters of `text`, on a `char` boundary.
fn tail(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let skip = text.chars().count() - limit;
    text.chars().skip(skip).collect()
}

#[derive(Debug, thiserror::Error)]
enum SupervisorError {
    #[error("failed to launch render tool at {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A cooperative cancellation flag. Shared between the caller (queue
/// worker loop) and the in-flight `render` call; `cancel()` wakes the
/// `drive` loop immediately via `Notify` rather than waiting for the
/// next heartbeat tick to notice the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<CancelTokenInner>);

#[derive(Debug, Default)]
struct CancelTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called. If it already has
    /// been, resolves immediately.
    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.0.notify.notified().await;
    }
}

/// Drives one external render-tool invocation to completion.
pub struct RenderSupervisor {
    render_tool_path: PathBuf,
    arg_builder: Box<dyn ArgBuilder>,
    compose_adapter: Box<dyn ComposeAdapter>,
}

impl RenderSupervisor {
    pub fn new(render_tool_path: impl Into<PathBuf>) -> Self {
        Self {
            render_tool_path: render_tool_path.into(),
            arg_builder: Box::new(DefaultArgBuilder),
            compose_adapter: Box::new(NullComposeAdapter),
        }
    }

    /// Use a caller-supplied argument grammar instead of the default.
    pub fn with_arg_builder(mut self, arg_builder: Box<dyn ArgBuilder>) -> Self {
        self.arg_builder = arg_builder;
        self
    }

    /// Use a caller-supplied composition adapter instead of the no-op
    /// default, invoked after a successful job with `compose_layers` set.
    pub fn with_compose_adapter(mut self, compose_adapter: Box<dyn ComposeAdapter>) -> Self {
        self.compose_adapter = compose_adapter;
        self
    }

    /// Render `job` to completion, mutating it in place to a terminal
    /// state (`Completed`, `Failed`, or `Cancelled`). Never returns a
    /// `Result`: every failure mode of the external tool is a terminal
    /// job state, not an exception that crosses this boundary.
    pub async fn render(
        &self,
        job: &mut RenderJob,
        assigned_slave: &str,
        cancel: &CancelToken,
        observer: &dyn Observer,
    ) {
        job.mark_rendering(assigned_slave);
        observer.job_started(job);

        if let Some(dir) = job.output_dir() {
            if let Err(err) = std::fs::create_dir_all(&dir) {
                job.mark_failed(format!("could not create output directory: {err}"));
                observer.job_failed(job);
                return;
            }
        }

        if job.copy_images {
            if let Err(err) = duplicate_images_dir(&job.project_file, job.output_dir().as_deref())
            {
                job.mark_failed(format!("could not duplicate Images directory: {err}"));
                observer.job_failed(job);
                return;
            }
        }

        let log_path = if job.log_file.is_some() {
            job.log_file.clone()
        } else if job.verbose {
            Some(synthesize_log_path(&job.id))
        } else {
            None
        };
        if let Some(log_path) = &log_path {
            if let Some(dir) = log_path.parent() {
                let _ = std::fs::create_dir_all(dir);
            }
        }

        match self.spawn(job, log_path.as_deref()) {
            Ok(child) => self.drive(child, job, cancel, observer).await,
            Err(err) => {
                job.mark_failed(err.to_string());
                observer.job_failed(job);
            }
        }
    }

    fn spawn(&self, job: &RenderJob, log_path: Option<&Path>) -> Result<Child, SupervisorError> {
        let argv = self.arg_builder.build(job, log_path);
        Command::new(&self.render_tool_path)
            .args(&argv)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                path: self.render_tool_path.clone(),
                source,
            })
    }

    async fn drive(
        &self,
        mut child: Child,
        job: &mut RenderJob,
        cancel: &CancelToken,
        observer: &dyn Observer,
    ) {
        let mut stdout_lines = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr_lines = child.stderr.take().map(|s| BufReader::new(s).lines());

        let started_at = Instant::now();
        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // first tick fires immediately; skip it

        let mut stderr_buf = String::new();
        let mut last_frame_progress: Option<f64> = None;
        let mut done_seen = false;
        let mut highest_frame: u32 = 0;
        let mut total_frames: u32 = 0;
        let output_dir = job.output_dir();
        let video_output = is_video_format(&job.format);
        let expected_frames = estimate_frame_count(job);

        let mut cancelled = false;

        loop {
            let stdout_open = stdout_lines.is_some();
            let stderr_open = stderr_lines.is_some();

            tokio::select! {
                status = child.wait() => {
                    let _ = status;
                    break;
                }
                maybe_line = next_line(&mut stdout_lines), if stdout_open => {
                    if let Some(line) = maybe_line {
                        if let Some((current, total)) = parse_frame_line(&line) {
                            let pct = frame_progress(current, total);
                            last_frame_progress = Some(pct);
                            highest_frame = highest_frame.max(current);
                            total_frames = total;
                            observer.progress(job, pct);
                        } else if is_done_marker(&line) {
                            done_seen = true;
                            let elapsed = started_at.elapsed().as_secs_f64();
                            let seconds_per_frame = if highest_frame > 0 {
                                elapsed / highest_frame as f64
                            } else {
                                0.0
                            };
                            observer.output(&format!(
                                "[{}] done: {highest_frame}/{total_frames} frames in {elapsed:.1}s ({seconds_per_frame:.2}s/frame)",
                                job.id
                            ));
                        } else if !is_noise_line(&line) {
                            observer.output(&line);
                        }
                    }
                }
                maybe_line = next_line(&mut stderr_lines), if stderr_open => {
                    if let Some(line) = maybe_line {
                        stderr_buf.push_str(&line);
                        stderr_buf.push('\n');
                    }
                }
                () = cancel.cancelled() => {
                    cancelled = true;
                    terminate(&mut child).await;
                    break;
                }
                _ = heartbeat.tick() => {
                    if last_frame_progress.is_none() && !done_seen {
                        let pct = if video_output {
                            video_file_progress(started_at.elapsed().as_secs_f64())
                        } else if let Some(dir) = &output_dir {
                            image_sequence_progress(dir, &job.project_name(), expected_frames)
                        } else {
                            0.0
                        };
                        observer.progress(job, pct);
                    }
                }
            }
        }

        if cancelled {
            job.mark_cancelled();
            observer.output(&format!("[{}] cancelled", job.id));
            return;
        }

        let exit_status = child.wait().await;
        match exit_status {
            Ok(status) if status.success() => {
                job.mark_completed();
                observer.job_completed(job);
                if job.compose_layers {
                    self.run_compose_hook(job, observer);
                }
            }
            Ok(status) => {
                let trimmed = stderr_buf.trim();
                let message = if trimmed.is_empty() {
                    status
                        .code()
                        .map(|code| format!("exit {code}"))
                        .unwrap_or_else(|| format!("render tool exited: {status}"))
                } else {
                    tail(trimmed, STDERR_TAIL_LIMIT)
                };
                job.mark_failed(message);
                observer.job_failed(job);
            }
            Err(err) => {
                job.mark_failed(format!("failed to wait on render tool: {err}"));
                observer.job_failed(job);
            }
        }
    }

    /// Post-completion hook (spec.md §4.2): a successfully completed
    /// job with `compose_layers` set gets its composition adapter
    /// invoked once; the adapter's own log output is forwarded through
    /// `Observer::output`, and a failure is logged the same way rather
    /// than reopening the job's already-terminal status.
    fn run_compose_hook(&self, job: &RenderJob, observer: &dyn Observer) {
        match self.compose_adapter.compose(job) {
            Ok(output) => {
                if !output.is_empty() {
                    observer.output(&format!("[{}] compose: {output}", job.id));
                }
            }
            Err(err) => {
                observer.output(&format!("[{}] compose failed: {err}", job.id));
            }
        }
    }
}

/// Read the next line from an optional line stream, closing it (by
/// setting the `Option` to `None`) on EOF or error so the caller's
/// `select!` branch disables itself for the rest of the process's
/// lifetime instead of spinning on an exhausted pipe.
async fn next_line<R: AsyncBufRead + Unpin>(lines: &mut Option<Lines<R>>) -> Option<String> {
    let reader = lines.as_mut()?;
    match reader.next_line().await {
        Ok(Some(line)) => Some(line),
        Ok(None) => {
            *lines = None;
            None
        }
        Err(_) => {
            *lines = None;
            None
        }
    }
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    if timeout(TERMINATE_GRACE, child.wait()).await.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

fn synthesize_log_path(job_id: &str) -> PathBuf {
    renderfarm_core::config::log_dir().join(format!("{job_id}.log"))
}

fn is_video_format(format: &str) -> bool {
    matches!(
        format.to_ascii_uppercase().as_str(),
        "MP4" | "MOV" | "AVI" | "WMV" | "MPG" | "MPEG" | "FLV" | "MKV"
    )
}

fn estimate_frame_count(job: &RenderJob) -> u32 {
    match (job.start_frame, job.end_frame) {
        (Some(start), Some(end)) if end >= start => end - start + 1,
        _ => 100,
    }
}

/// Duplicate the `Images` directory that sits alongside `project_file`
/// into `output_dir`, without overwriting any file already present
/// there.
fn duplicate_images_dir(project_file: &Path, output_dir: Option<&Path>) -> std::io::Result<()> {
    let Some(output_dir) = output_dir else {
        return Ok(());
    };
    let Some(source_dir) = project_file.parent().map(|p| p.join("Images")) else {
        return Ok(());
    };
    if !source_dir.is_dir() {
        return Ok(());
    }
    let dest_dir = output_dir.join("Images");
    std::fs::create_dir_all(&dest_dir)?;

    for entry in std::fs::read_dir(&source_dir)? {
        let entry = entry?;
        if !entry.path().is_file() {
            continue;
        }
        let dest = dest_dir.join(entry.file_name());
        if dest.exists() {
            continue;
        }
        std::fs::copy(entry.path(), dest)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderfarm_core::{RecordedEvent, RecordingObserver, RenderStatus};

    #[test]
    fn synthesizes_log_path_under_the_user_data_log_dir() {
        let log = synthesize_log_path("abc12345");
        assert_eq!(log.file_name().unwrap(), "abc12345.log");
        assert!(log.parent().unwrap().ends_with("renderfarm/logs"));
    }

    #[test]
    fn classifies_known_video_formats() {
        assert!(is_video_format("mp4"));
        assert!(is_video_format("MOV"));
        assert!(!is_video_format("PNG"));
        assert!(!is_video_format("targa"));
    }

    #[test]
    fn estimates_frame_count_from_start_and_end() {
        let mut job = RenderJob::new("/p.moho");
        job.start_frame = Some(10);
        job.end_frame = Some(19);
        assert_eq!(estimate_frame_count(&job), 10);
    }

    #[test]
    fn duplicate_images_dir_skips_existing_files() {
        let project_dir = tempfile::tempdir().unwrap();
        let images_dir = project_dir.path().join("Images");
        std::fs::create_dir_all(&images_dir).unwrap();
        std::fs::write(images_dir.join("tex.png"), b"source").unwrap();

        let output_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(output_dir.path().join("Images")).unwrap();
        std::fs::write(output_dir.path().join("Images/tex.png"), b"preexisting").unwrap();

        let project_file = project_dir.path().join("shot.moho");
        duplicate_images_dir(&project_file, Some(output_dir.path())).unwrap();

        let contents =
            std::fs::read_to_string(output_dir.path().join("Images/tex.png")).unwrap();
        assert_eq!(contents, "preexisting", "must not overwrite existing files");
    }

    #[test]
    fn tail_truncates_to_the_last_n_chars() {
        let long = "x".repeat(600) + "END";
        let truncated = tail(&long, 500);
        assert_eq!(truncated.len(), 500);
        assert!(truncated.ends_with("END"));
        assert_eq!(tail("short", 500), "short");
    }

    #[test]
    fn cancel_token_starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    /// Hands `/bin/sh` a fixed script instead of building the render
    /// tool's own flag grammar, so these tests drive the real child
    /// process/pipe machinery without depending on a renderer binary.
    struct ShellScript(&'static str);

    impl ArgBuilder for ShellScript {
        fn build(&self, _job: &RenderJob, _log_file: Option<&Path>) -> Vec<String> {
            vec!["-c".to_string(), self.0.to_string()]
        }
    }

    fn sh_supervisor(script: &'static str) -> RenderSupervisor {
        RenderSupervisor::new("/bin/sh").with_arg_builder(Box::new(ShellScript(script)))
    }

    #[tokio::test]
    async fn single_job_success_reports_progress_and_completes() {
        let supervisor = sh_supervisor(
            "echo 'Frame 1 (1/2) elapsed 0:01'; echo 'Frame 2 (2/2) elapsed 0:02'; echo 'Done!'",
        );
        let mut job = RenderJob::new("/p.moho");
        job.format = "MP4".to_string();
        let observer = RecordingObserver::new();
        let cancel = CancelToken::new();

        supervisor.render(&mut job, "slave-1", &cancel, &observer).await;

        assert_eq!(job.status, RenderStatus::Completed);
        assert_eq!(job.progress, 100.0);
        let events = observer.events();
        let started = events
            .iter()
            .filter(|e| matches!(e, RecordedEvent::JobStarted(_)))
            .count();
        assert_eq!(started, 1, "on_job_started must fire exactly once");
        let progresses: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                RecordedEvent::Progress(_, pct) => Some(*pct),
                _ => None,
            })
            .collect();
        assert!(progresses.contains(&50.0));
        assert!(progresses.contains(&100.0));
    }

    #[tokio::test]
    async fn local_failure_reports_stderr_message() {
        let supervisor = sh_supervisor("echo 'bad project' 1>&2; exit 1");
        let mut job = RenderJob::new("/p.moho");
        let observer = RecordingObserver::new();
        let cancel = CancelToken::new();

        supervisor.render(&mut job, "slave-1", &cancel, &observer).await;

        assert_eq!(job.status, RenderStatus::Failed);
        assert!(job.error_message.contains("bad project"));
        assert_ne!(job.progress, 100.0);
    }

    #[tokio::test]
    async fn cancellation_mid_render_terminates_without_job_failed() {
        let supervisor = sh_supervisor(
            "trap 'exit 1' TERM; echo 'Frame 1 (1/3) elapsed 0:01'; sleep 30; echo unreachable",
        );
        let mut job = RenderJob::new("/p.moho");
        let observer = RecordingObserver::new();
        let cancel = CancelToken::new();

        let render = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                // give the process a moment to print its first frame line first.
                tokio::time::sleep(Duration::from_millis(200)).await;
                cancel.cancel();
            }
        });
        supervisor.render(&mut job, "slave-1", &cancel, &observer).await;
        render.await.unwrap();

        assert_eq!(job.status, RenderStatus::Cancelled);
        let fired_job_failed = observer
            .events()
            .iter()
            .any(|e| matches!(e, RecordedEvent::JobFailed(_)));
        assert!(!fired_job_failed, "cancellation must not fire on_job_failed");
    }

    struct FakeComposeAdapter;

    impl crate::compose::ComposeAdapter for FakeComposeAdapter {
        fn compose(&self, job: &RenderJob) -> Result<String, String> {
            Ok(format!("composed {}", job.project_name()))
        }
    }

    #[tokio::test]
    async fn successful_job_with_compose_layers_runs_the_adapter() {
        let supervisor =
            sh_supervisor("echo 'Frame 1 (1/1) elapsed 0:01'; echo 'Done!'").with_compose_adapter(Box::new(FakeComposeAdapter));
        let mut job = RenderJob::new("/shot.moho");
        job.compose_layers = true;
        let observer = RecordingObserver::new();
        let cancel = CancelToken::new();

        supervisor.render(&mut job, "slave-1", &cancel, &observer).await;

        assert_eq!(job.status, RenderStatus::Completed);
        let composed = observer
            .events()
            .iter()
            .any(|e| matches!(e, RecordedEvent::Output(line) if line.contains("composed shot")));
        assert!(composed, "compose adapter output must reach the observer");
    }

    #[tokio::test]
    async fn successful_job_without_compose_layers_never_calls_the_adapter() {
        let supervisor =
            sh_supervisor("echo 'Done!'").with_compose_adapter(Box::new(FakeComposeAdapter));
        let mut job = RenderJob::new("/shot.moho");
        let observer = RecordingObserver::new();
        let cancel = CancelToken::new();

        supervisor.render(&mut job, "slave-1", &cancel, &observer).await;

        let composed = observer
            .events()
            .iter()
            .any(|e| matches!(e, RecordedEvent::Output(line) if line.contains("composed")));
        assert!(!composed, "compose adapter must not run when compose_layers is unset");
    }
}
