pub(crate) mod scope_guard;
pub(crate) use scope_guard::ScopeGuard;

pub(crate) mod signal;
pub(crate) use signal::Signal;

pub(crate) mod thread;
