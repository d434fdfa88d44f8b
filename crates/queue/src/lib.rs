//! `LocalQueue`: a fixed-size worker pool draining a shared list of
//! `RenderJob`s, used directly by the `local` CLI subcommand.
//!
//! A fixed worker pool, a `Notify` to wake idle workers immediately on
//! new work, and observer events fired with no internal lock held.

mod queue;

pub use queue::{LocalQueue, QueueError, QueueSnapshot};
