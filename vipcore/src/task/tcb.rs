use super::Task;
use crate::errors::VipError;
use crate::platform::HardwareJob;
use crate::utils::Signal;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::time::{Duration, Instant};

/// Lifecycle of a task control block.
///
/// `None` is a block that never saw a submission. `Empty` is a block whose
/// submission was rolled back. `Canceled` is reachable from `Ready` and
/// `InferStart` and turns into `InferEnd` once a waiter observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TcbStatus {
    None,
    Empty,
    Ready,
    InferStart,
    InferEnd,
    Canceled,
}

impl TcbStatus {
    /// Queued or running on the hardware.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TcbStatus::Ready | TcbStatus::InferStart)
    }
}

/// Non-error results of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Success,

    /// The hardware hung and was reset. The result of the job is
    /// indeterminate but the hardware accepts new work.
    Recovered,

    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Canceled before reaching the hardware.
    Dequeued,

    /// The hardware job was aborted, or ran to idle.
    Aborted,

    /// The task already completed.
    TooLate,
}

/// Result recorded by whoever finished the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    Recovered,
    Canceled,
    TimedOut,
    Faulted(String),
}

impl Outcome {
    pub(crate) fn into_result(self) -> Result<Completion, VipError> {
        match self {
            Outcome::Success => Ok(Completion::Success),
            Outcome::Recovered => Ok(Completion::Recovered),
            Outcome::Canceled => Ok(Completion::Canceled),
            Outcome::TimedOut => Err(VipError::Timeout),
            Outcome::Faulted(msg) => Err(VipError::Failure(msg)),
        }
    }
}

struct TcbState {
    task: Option<Task>,
    status: TcbStatus,
    time_out: Duration,

    /// What was programmed, kept until the job completes so the waiting side
    /// knows which cores to watch.
    job: Option<HardwareJob>,

    outcome: Option<Outcome>,
    started_at: Option<Instant>,
    elapsed: Option<Duration>,
}

/// Task control block.
///
/// Every status transition happens under `cancel_mutex`. The mutex is
/// re-entrant so the closures run by `begin` and `cancel` may query the block
/// again. The `RefCell` is never borrowed across those closures.
pub(crate) struct Tcb {
    cancel_mutex: ReentrantMutex<RefCell<TcbState>>,

    /// Set once an outcome is recorded. Manual reset, so every waiter sees it.
    done: Signal,
}

impl Tcb {
    pub(crate) fn new() -> Self {
        Self {
            cancel_mutex: ReentrantMutex::new(RefCell::new(TcbState {
                task: None,
                status: TcbStatus::None,
                time_out: Duration::ZERO,
                job: None,
                outcome: None,
                started_at: None,
                elapsed: None,
            })),
            done: Signal::manual_reset(),
        }
    }

    /// Binds `task` to the block and moves it to `Ready`.
    ///
    /// Rejected while a submission is still queued or running: with
    /// `AlreadySubmitted` if it carries the same id, `OutOfResource` if the
    /// block is busy with another task.
    pub(crate) fn prepare(&self, task: Task, time_out: Duration) -> Result<(), VipError> {
        let guard = self.cancel_mutex.lock();
        let mut state = guard.borrow_mut();

        if state.status.is_in_flight() {
            return match state.task {
                Some(current) if current.id == task.id => Err(VipError::AlreadySubmitted(task.id)),
                _ => Err(VipError::out_of_resource(format!(
                    "device {} is busy",
                    task.device
                ))),
            };
        }

        state.task = Some(task);
        state.status = TcbStatus::Ready;
        state.time_out = time_out;
        state.job = None;
        state.outcome = None;
        state.started_at = None;
        state.elapsed = None;
        self.done.reset();

        Ok(())
    }

    /// Rolls back a `prepare` whose submission could not be queued.
    pub(crate) fn abandon(&self) {
        let guard = self.cancel_mutex.lock();
        let mut state = guard.borrow_mut();

        if state.status == TcbStatus::Ready {
            state.status = TcbStatus::Empty;
        }
    }

    /// Detaches the task so its id no longer resolves to this block. A
    /// queued or running block is only detached with `force`.
    pub(crate) fn retire(&self, force: bool) {
        let guard = self.cancel_mutex.lock();
        let mut state = guard.borrow_mut();

        if force || !state.status.is_in_flight() {
            state.task = None;
            state.status = TcbStatus::Empty;
        }
    }

    /// Programs the hardware unless the block was canceled meanwhile.
    ///
    /// `program` runs under `cancel_mutex` so it can't interleave with
    /// `cancel`. It returns the job it started, or `None` when nothing needed
    /// the hardware. Returns whether the block moved to `InferStart`.
    pub(crate) fn begin<F>(&self, program: F) -> Result<bool, VipError>
    where
        F: FnOnce(&Task) -> Result<Option<HardwareJob>, VipError>,
    {
        let guard = self.cancel_mutex.lock();

        let task = {
            let state = guard.borrow();
            match (state.status, state.task) {
                (TcbStatus::Canceled, _) => return Ok(false),
                (TcbStatus::Ready, Some(task)) => task,
                (status, _) => {
                    return Err(VipError::failure(format!(
                        "task control block is {:?}, expected Ready",
                        status
                    )));
                }
            }
        };

        let job = program(&task)?;

        let mut state = guard.borrow_mut();
        state.status = TcbStatus::InferStart;
        state.job = job;
        state.started_at = Some(Instant::now());

        Ok(true)
    }

    /// Records the outcome, moves to `InferEnd` and wakes the waiters. A block
    /// canceled while running always ends as `Canceled`. Returns the outcome
    /// actually recorded.
    pub(crate) fn complete(&self, outcome: Outcome) -> Outcome {
        let guard = self.cancel_mutex.lock();
        let mut state = guard.borrow_mut();

        let outcome = if state.status == TcbStatus::Canceled {
            Outcome::Canceled
        } else {
            outcome
        };

        state.elapsed = state.started_at.map(|start| start.elapsed());
        state.status = TcbStatus::InferEnd;
        state.job = None;
        state.outcome = Some(outcome.clone());
        self.done.set();

        outcome
    }

    /// Cancels the submission.
    ///
    /// A block still `Ready` is marked `Canceled` and its waiters are woken
    /// without touching the hardware. A running block calls `abort` under
    /// `cancel_mutex`. The job's own completion later records `Canceled`.
    pub(crate) fn cancel<F>(&self, abort: F) -> Result<CancelOutcome, VipError>
    where
        F: FnOnce(&Task) -> Result<(), VipError>,
    {
        let guard = self.cancel_mutex.lock();
        let (status, task) = {
            let state = guard.borrow();
            (state.status, state.task)
        };

        match (status, task) {
            (TcbStatus::Ready, _) => {
                let mut state = guard.borrow_mut();
                state.status = TcbStatus::Canceled;
                state.outcome = Some(Outcome::Canceled);
                self.done.set();
                Ok(CancelOutcome::Dequeued)
            }
            (TcbStatus::InferStart, Some(task)) => {
                abort(&task)?;
                guard.borrow_mut().status = TcbStatus::Canceled;
                Ok(CancelOutcome::Aborted)
            }
            (TcbStatus::InferEnd | TcbStatus::Canceled, _) => Ok(CancelOutcome::TooLate),
            (status, _) => Err(VipError::invalid(format!(
                "nothing to cancel, task control block is {:?}",
                status
            ))),
        }
    }

    /// Blocks until an outcome is recorded. Repeated waits return the same
    /// outcome. `timeout` of `None` waits forever.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Result<Completion, VipError> {
        if matches!(self.status(), TcbStatus::None | TcbStatus::Empty) {
            return Err(VipError::invalid("task was never submitted"));
        }

        if !self.done.wait(timeout) {
            return Err(VipError::Timeout);
        }

        let guard = self.cancel_mutex.lock();
        let mut state = guard.borrow_mut();

        if state.status == TcbStatus::Canceled {
            state.status = TcbStatus::InferEnd;
        }

        state
            .outcome
            .clone()
            .ok_or_else(|| VipError::failure("completion signaled without an outcome"))?
            .into_result()
    }

    pub(crate) fn status(&self) -> TcbStatus {
        self.cancel_mutex.lock().borrow().status
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.status() == TcbStatus::Canceled
    }

    pub(crate) fn task(&self) -> Option<Task> {
        self.cancel_mutex.lock().borrow().task
    }

    pub(crate) fn time_out(&self) -> Duration {
        self.cancel_mutex.lock().borrow().time_out
    }

    /// End of the hardware budget of the running job.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        let guard = self.cancel_mutex.lock();
        let state = guard.borrow();
        state.started_at.map(|start| start + state.time_out)
    }

    pub(crate) fn job(&self) -> Option<HardwareJob> {
        self.cancel_mutex.lock().borrow().job.clone()
    }

    /// Hardware run time of the last completed job.
    pub(crate) fn elapsed(&self) -> Option<Duration> {
        self.cancel_mutex.lock().borrow().elapsed
    }
}
