use crate::context::ContextConfig;
use anyhow::{Context, Result};
use std::thread::{self, JoinHandle};

/// Spawns a dispatch worker using the configured naming scheme and stack size.
///
/// `role` is appended to the generated name, e.g. `vip-0-s0` for the serial
/// worker of device 0. Linux caps thread names at 15 bytes so the tail may be
/// truncated in `ps` output.
pub(crate) fn spawn_worker<F>(cfg: &ContextConfig, role: &str, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let mut builder = thread::Builder::new();

    if let Some(stack_size) = cfg.thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    let name = format!("{}-{}", (cfg.thread_name.0)(), role);

    builder
        .name(name.clone())
        .spawn(f)
        .with_context(|| format!("failed to spawn worker thread {}", name))
}

/// Joins every handle, returning how many of them panicked.
pub(crate) fn join_all(handles: impl IntoIterator<Item = JoinHandle<()>>) -> usize {
    handles
        .into_iter()
        .filter_map(|handle| handle.join().err())
        .count()
}
