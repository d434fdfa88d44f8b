//! `SlaveClient`: a long-lived presence against one `MasterServer` —
//! register, heartbeat, poll for work, execute via a local
//! `RenderSupervisor`, and report the outcome.
//!
//! `transfer.rs` is a thin `reqwest` request/response layer; `client.rs`
//! is the owning loop that drives it and reports outcomes through an
//! observer.

pub mod client;
pub mod transfer;

pub use client::{SlaveClient, SlaveConfig, SlaveError};
