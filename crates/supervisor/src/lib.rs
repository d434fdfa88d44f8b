//! Drives a single external render-tool invocation: argument
//! construction, stdout/stderr handling, progress estimation, and
//! cancellation.
//!
//! This crate intentionally touches `unsafe` (a direct `libc::kill` on
//! unix for graceful process termination) and so does not carry the
//! blanket `forbid(unsafe_code)` that `renderfarm-core` does; the
//! unsafe surface is confined to `supervisor::terminate`.

pub mod args;
pub mod compose;
pub mod progress;
mod supervisor;

pub use args::{ArgBuilder, DefaultArgBuilder};
pub use compose::{ComposeAdapter, NullComposeAdapter};
pub use supervisor::{CancelToken, RenderSupervisor};
