mod cli;
mod shutdown;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use renderfarm_core::ipc::{self, Acquire, IpcPayload};
use renderfarm_core::{LoggingObserver, Observer, RenderJob};
use renderfarm_master::MasterServer;
use renderfarm_queue::LocalQueue;
use renderfarm_slave::{SlaveClient, SlaveConfig};
use renderfarm_supervisor::RenderSupervisor;
use tokio::sync::Notify;

use crate::cli::{Cli, Command, LocalArgs, MasterArgs, SlaveArgs};
use crate::shutdown::{ShutdownController, ShutdownEvent, spawn_ctrl_c_handler};

/// Wraps the stdout-logging observer with a `Notify` so `main` can
/// `select!` between a natural drain and a Ctrl-C without polling.
struct CliObserver {
    inner: LoggingObserver,
    drained: Notify,
}

impl CliObserver {
    fn new() -> Self {
        Self {
            inner: LoggingObserver::stdout(),
            drained: Notify::new(),
        }
    }
}

impl Observer for CliObserver {
    fn job_started(&self, job: &RenderJob) {
        self.inner.job_started(job);
    }
    fn job_completed(&self, job: &RenderJob) {
        self.inner.job_completed(job);
    }
    fn job_failed(&self, job: &RenderJob) {
        self.inner.job_failed(job);
    }
    fn queue_completed(&self) {
        self.inner.queue_completed();
        self.drained.notify_waiters();
    }
    fn output(&self, line: &str) {
        self.inner.output(line);
    }
    fn progress(&self, job: &RenderJob, progress: f64) {
        self.inner.progress(job, progress);
    }
    fn queue_changed(&self) {
        self.inner.queue_changed();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Local(args) => run_local(args).await,
        Command::Master(args) => run_master(args).await,
        Command::Slave(args) => run_slave(args).await,
    }
}

async fn run_local(args: LocalArgs) -> anyhow::Result<()> {
    let payload = IpcPayload {
        files: args.files.iter().map(|p| p.display().to_string()).collect(),
    };
    let guard = match ipc::acquire(ipc::DEFAULT_PORT, &payload)? {
        Acquire::Forwarded => {
            println!(
                "renderfarm local: another instance is already running; forwarded {} file(s) to it",
                payload.files.len()
            );
            return Ok(());
        }
        Acquire::Acquired(guard) => guard,
    };

    let supervisor = Arc::new(RenderSupervisor::new(args.render_tool));
    let observer = Arc::new(CliObserver::new());
    let queue = LocalQueue::new(supervisor, observer.clone(), args.parallel);

    if let Some(path) = &args.queue_file {
        if path.exists() {
            queue.load(path, false)?;
        }
    }
    for file in &args.files {
        queue.add(RenderJob::new(file.clone()));
    }

    let (ipc_tx, mut ipc_rx) = tokio::sync::mpsc::unbounded_channel::<IpcPayload>();
    std::thread::spawn(move || {
        loop {
            match guard.listener().accept() {
                Ok((stream, _)) => {
                    if let Ok(payload) = ipc::read_payload(stream) {
                        if ipc_tx.send(payload).is_err() {
                            break;
                        }
                    }
                }
                Err(_) => break,
            }
        }
    });

    println!("renderfarm local: {} job(s) queued, parallel={}", queue.total_jobs(), args.parallel);
    queue.start();

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown.clone(), shutdown_tx);

    loop {
        tokio::select! {
            _ = observer.drained.notified() => {
                break;
            }
            Some(payload) = ipc_rx.recv() => {
                for file in payload.files {
                    queue.add(RenderJob::new(file));
                }
            }
            event = shutdown_rx.recv() => {
                match event {
                    Some(ShutdownEvent::Graceful) => {
                        println!("Stop requested — finishing active jobs before exiting (press CTRL+C again to exit immediately).");
                        queue.pause();
                        if wait_for_active_renders_to_finish(&queue, &mut shutdown_rx).await {
                            println!("Stop requested again — cancelling active jobs and exiting.");
                            queue.stop().await;
                        }
                        break;
                    }
                    Some(ShutdownEvent::Immediate) => {
                        println!("Stop requested again — cancelling active jobs and exiting.");
                        queue.stop().await;
                        break;
                    }
                    None => {}
                }
            }
        }
    }

    if let Some(path) = &args.queue_file {
        queue.save(path)?;
    }
    Ok(())
}

/// After a paused queue has stopped accepting new work, wait for its
/// currently-rendering jobs to finish. `queue_completed` never fires
/// while paused, so this polls the snapshot instead. Returns `true` if
/// a second (`Immediate`) shutdown arrived during the wait.
async fn wait_for_active_renders_to_finish(
    queue: &LocalQueue,
    shutdown_rx: &mut tokio::sync::mpsc::UnboundedReceiver<ShutdownEvent>,
) -> bool {
    let mut poll = tokio::time::interval(Duration::from_millis(300));
    loop {
        if queue.snapshot().rendering == 0 {
            return false;
        }
        tokio::select! {
            _ = poll.tick() => {}
            event = shutdown_rx.recv() => {
                if matches!(event, Some(ShutdownEvent::Immediate) | None) {
                    return true;
                }
            }
        }
    }
}

async fn run_master(args: MasterArgs) -> anyhow::Result<()> {
    let server = MasterServer::new(Arc::new(LoggingObserver::stdout()))?;
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    println!("renderfarm master: listening on {addr}");

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown.clone(), shutdown_tx);

    tokio::select! {
        result = server.serve(addr) => {
            result?;
        }
        _ = shutdown_rx.recv() => {
            println!("Stop requested — shutting down.");
        }
    }
    Ok(())
}

async fn run_slave(args: SlaveArgs) -> anyhow::Result<()> {
    let supervisor = Arc::new(RenderSupervisor::new(args.render_tool));
    let config = SlaveConfig {
        master_host: args.master_host,
        master_port: args.master_port,
        slave_port: args.slave_port,
        max_concurrent: args.parallel,
    };
    let observer = Arc::new(LoggingObserver::stdout());
    let client = SlaveClient::new(config, supervisor, observer);
    client.start().await;
    println!("renderfarm slave: running, parallel={}", args.parallel);

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown.clone(), shutdown_tx);

    loop {
        match shutdown_rx.recv().await {
            Some(ShutdownEvent::Graceful) => {
                println!("Stop requested — finishing active jobs before exiting (press CTRL+C again to exit immediately).");
                client.stop().await;
                break;
            }
            Some(ShutdownEvent::Immediate) | None => {
                break;
            }
        }
    }
    Ok(())
}
