//! The post-completion composition hook.
//!
//! `compose_layers` asks for an external media tool to merge per-layer
//! renders after a successful job; that tool is an external
//! collaborator out of scope for this crate (same split as `ArgBuilder`
//! for render-tool arguments), so `RenderSupervisor` depends on this
//! trait object instead of calling one directly.

use renderfarm_core::RenderJob;

/// Invoked once, after a job completes successfully with
/// `compose_layers` set. Returns the adapter's own log text on success,
/// or an error message describing why composition failed; neither
/// affects the job's already-terminal `status`.
pub trait ComposeAdapter: Send + Sync {
    fn compose(&self, job: &RenderJob) -> Result<String, String>;
}

/// No compositing tool wired up: `compose_layers` is acknowledged but
/// nothing runs. The default for `RenderSupervisor::new`; a caller that
/// has a real compositor wires up its own `ComposeAdapter` via
/// `RenderSupervisor::with_compose_adapter`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullComposeAdapter;

impl ComposeAdapter for NullComposeAdapter {
    fn compose(&self, _job: &RenderJob) -> Result<String, String> {
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_adapter_is_a_silent_no_op() {
        let job = RenderJob::new("/p.moho");
        assert_eq!(NullComposeAdapter.compose(&job), Ok(String::new()));
    }
}
