//! Probe-then-run driver shared by the kernels.
//!
//! Every kernel is written once as a build function over a [`Session`].
//! Capability probes run it on a private context with no engine; execution
//! runs it on a probe first, so a tiling that cannot be expressed is
//! reported before any program touches device memory.

use crate::config::KernelConfig;
use mvp_driver::{Mvp, ProgramContext, Result, Session};
use tracing::{error, info};

/// Run `build` without an engine.
pub(crate) fn probe<F>(mut build: F) -> Result<()>
where
    F: FnMut(&mut Session<'_>) -> Result<()>,
{
    let mut ctx = ProgramContext::new();
    let mut session = Session::probe(&mut ctx);
    build(&mut session)
}

/// Probe `build`, then run it on `mvp` and wait for every program.
pub(crate) fn run<F>(mvp: &mut Mvp, name: &str, mut build: F) -> Result<()>
where
    F: FnMut(&mut Session<'_>) -> Result<()>,
{
    if let Err(e) = probe(&mut build) {
        error!("{name}: rejected before execution: {e}");
        return Err(e);
    }
    let before = mvp.engine().stats().programs;
    {
        let mut session = mvp.session();
        build(&mut session)?;
        session.wait_for_completion()?;
    }
    info!(
        "{name}: {} program(s) on {}",
        mvp.engine().stats().programs - before,
        mvp.engine().backend_type()
    );
    Ok(())
}

/// Seal and start the program being built.
pub(crate) fn issue(session: &mut Session<'_>, config: &KernelConfig) -> Result<()> {
    session.execute_program()?;
    if config.wait_each_program && session.is_executing() {
        session.wait_for_completion()?;
    }
    Ok(())
}
