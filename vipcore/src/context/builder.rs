use super::Context;
use crate::dispatch::Strategy;
use crate::platform::Platform;
use crate::queue::QueueKind;
use anyhow::{Result, ensure};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Timeout of a submission that does not carry its own.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Slice of a hardware wait between two checks for cancellation, and period
/// of the parallel daemon re-checking free cores.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

const MAX_RECOVERY_TIMES: u32 = 3;

const DESCRIPTOR_CAPACITY: usize = 32;

const TCB_CAPACITY: usize = 32;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("vip-{}", id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

#[derive(Debug)]
pub struct Builder {
    /// Threading topology of the dispatch core.
    strategy: Strategy,

    /// Ordering policy of every device queue. Ignored by `Strategy::Single`.
    queue_kind: QueueKind,

    default_timeout: Duration,

    poll_interval: Duration,

    /// Reset and re-init hung hardware instead of surfacing a raw timeout.
    recovery: bool,

    /// Recovery attempts per core for the lifetime of the context.
    max_recovery_times: u32,

    /// Enables `task_cancel`.
    task_cancel: bool,

    /// Enables patch properties.
    task_schedule: bool,

    descriptor_capacity: usize,

    tcb_capacity: usize,

    /// Serialize hardware programming across every device.
    one_power_domain: bool,

    /// Name fn used for worker threads.
    thread_name: ThreadNameFn,

    /// Stack size used for worker threads.
    thread_stack_size: Option<usize>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            strategy: Strategy::default(),
            queue_kind: QueueKind::default(),
            default_timeout: DEFAULT_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            recovery: true,
            max_recovery_times: MAX_RECOVERY_TIMES,
            task_cancel: true,
            task_schedule: true,
            descriptor_capacity: DESCRIPTOR_CAPACITY,
            tcb_capacity: TCB_CAPACITY,
            one_power_domain: false,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
        }
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn queue_kind(mut self, kind: QueueKind) -> Self {
        self.queue_kind = kind;
        self
    }

    #[track_caller]
    pub fn default_timeout(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "default_timeout must be greater than 0");
        self.default_timeout = val;
        self
    }

    /// Sets the slice of a hardware wait. Cancellation is noticed at most one
    /// slice late.
    ///
    /// Defaults to 10ms.
    #[track_caller]
    pub fn poll_interval(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "poll_interval must be greater than 0");
        self.poll_interval = val;
        self
    }

    pub fn recovery(mut self, enabled: bool) -> Self {
        self.recovery = enabled;
        self
    }

    pub fn max_recovery_times(mut self, val: u32) -> Self {
        self.max_recovery_times = val;
        self
    }

    pub fn task_cancel(mut self, enabled: bool) -> Self {
        self.task_cancel = enabled;
        self
    }

    pub fn task_schedule(mut self, enabled: bool) -> Self {
        self.task_schedule = enabled;
        self
    }

    /// Initial capacity of the descriptor table, doubled whenever it fills up.
    #[track_caller]
    pub fn descriptor_capacity(mut self, val: usize) -> Self {
        assert!(val > 0, "descriptor_capacity must be greater than 0");
        self.descriptor_capacity = val;
        self
    }

    /// Initial capacity of the table of in-flight task control blocks.
    #[track_caller]
    pub fn tcb_capacity(mut self, val: usize) -> Self {
        assert!(val > 0, "tcb_capacity must be greater than 0");
        self.tcb_capacity = val;
        self
    }

    pub fn one_power_domain(mut self, enabled: bool) -> Self {
        self.one_power_domain = enabled;
        self
    }

    /// Sets name of worker threads. Thread names are truncated beyond 15
    /// bytes according to pthread limitations.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of worker threads.
    ///
    /// The default name fn yields "vip-{N}" with monotonically increasing N.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    /// Creates the configured `Context`: probes the chip, initializes every
    /// core and starts the dispatch threads.
    pub fn try_build(self, platform: Arc<dyn Platform>) -> Result<Context> {
        let cfg = self.try_into()?;
        Context::new(cfg, platform)
    }
}

// Export builder as a ContextConfig object consumed by the dispatch layer.
#[derive(Debug, Clone)]
pub(crate) struct ContextConfig {
    pub(crate) strategy: Strategy,
    pub(crate) queue_kind: QueueKind,
    pub(crate) default_timeout: Duration,
    pub(crate) poll_interval: Duration,
    pub(crate) recovery: bool,
    pub(crate) max_recovery_times: u32,
    pub(crate) task_cancel: bool,
    pub(crate) task_schedule: bool,
    pub(crate) descriptor_capacity: usize,
    pub(crate) tcb_capacity: usize,
    pub(crate) one_power_domain: bool,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        // Builder defaults always validate.
        Self::from_builder(Builder::new())
    }
}

impl ContextConfig {
    fn from_builder(builder: Builder) -> Self {
        ContextConfig {
            strategy: builder.strategy,
            queue_kind: builder.queue_kind,
            default_timeout: builder.default_timeout,
            poll_interval: builder.poll_interval,
            recovery: builder.recovery,
            max_recovery_times: builder.max_recovery_times,
            task_cancel: builder.task_cancel,
            task_schedule: builder.task_schedule,
            descriptor_capacity: builder.descriptor_capacity,
            tcb_capacity: builder.tcb_capacity,
            one_power_domain: builder.one_power_domain,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
        }
    }

    fn validate(&self) -> Result<()> {
        if let QueueKind::Fifo { capacity } = self.queue_kind {
            ensure!(capacity > 0, "FIFO queue capacity must be greater than 0");
        }

        ensure!(
            self.poll_interval <= self.default_timeout,
            "poll_interval ({:?}) must not exceed default_timeout ({:?})",
            self.poll_interval,
            self.default_timeout
        );

        ensure!(
            !self.recovery || self.max_recovery_times > 0,
            "recovery is enabled but max_recovery_times is 0"
        );

        Ok(())
    }
}

impl TryFrom<Builder> for ContextConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let cfg = ContextConfig::from_builder(builder);
        cfg.validate()?;

        Ok(cfg)
    }
}
