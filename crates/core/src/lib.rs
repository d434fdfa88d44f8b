#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared data model and support types for the renderfarm workspace:
//! the `RenderJob`/`RenderStatus` state machine, `SlaveInfo`, the
//! `Observer` callback contract, config persistence, and the
//! single-instance IPC listener.

pub mod config;
pub mod id;
pub mod ipc;
pub mod job;
pub mod observer;
pub mod slave_info;

pub use job::{QueueDocument, RenderJob, RenderStatus};
pub use observer::{LoggingObserver, NullObserver, Observer, RecordedEvent, RecordingObserver};
pub use slave_info::{SlaveInfo, SlaveInfoDto, SlaveStatus, LIVENESS_TIMEOUT};
