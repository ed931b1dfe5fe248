// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod continuation;
mod state;

use crate::error::WorkloadError;
use crate::loom::sync::{Arc, Mutex, Weak};
use crate::qdisc::Qdisc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::PoisonError;
use std::time::{Duration, Instant};

pub(crate) use continuation::{Continuation, ContinuationSlot, WaitSignal};
pub use state::WorkloadState;
use state::AtomicState;

/// A deferred unit of work with a CAS-driven state machine, cancellation,
/// and continuations.
///
/// Workloads are created through [`Workload::new`] or [`Workload::builder`],
/// routed into a qdisc tree, and executed by the worker pool. Observers can
/// [`wait`](Self::wait) for completion, register
/// [`continue_with`](Self::continue_with) actions, and read the terminal
/// [`outcome`](Self::outcome).
pub struct Workload {
    id: u64,
    state: AtomicState,
    body: Mutex<Option<WorkloadFn>>,
    fault: Mutex<Option<Arc<WorkloadError>>>,
    continuations: ContinuationSlot,
    bind: Mutex<BindSlot>,
}

type WorkloadFn = Box<dyn FnOnce(&WorkloadContext<'_>) -> Result<(), WorkloadError> + Send>;

/// The qdisc binding of a workload.
///
/// Binding happens once, on enqueue; unbinding (on dequeue-for-execution)
/// writes the `Sealed` sentinel which prevents any re-binding.
enum BindSlot {
    Unbound,
    Bound(Weak<dyn Qdisc>),
    Sealed,
}

/// Passed to the workload body while it runs.
pub struct WorkloadContext<'a> {
    workload: &'a Workload,
    worker_id: usize,
}

/// Terminal result of a workload.
#[derive(Debug, Clone)]
pub enum WorkloadOutcome {
    /// The body ran to completion.
    Completed,
    /// The workload was canceled before or during execution.
    Canceled,
    /// The body failed or the scheduler faulted the workload.
    Faulted(Arc<WorkloadError>),
}

/// Options for [`Workload::continue_with_options`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ContinueOptions {
    /// Run before all ordinarily scheduled continuations.
    pub schedule_first: bool,
    /// Post the continuation to the completing scheduler's pool instead of
    /// running it inline on the completer's thread.
    pub dispatch: bool,
}

/// Builder for workloads that need cancellation wiring.
pub struct WorkloadBuilder {
    cancel: Vec<CancelSource>,
}

/// An external cancellation source.
///
/// Workloads registered through [`WorkloadBuilder::canceled_by`] are
/// [`cancel`](Workload::cancel)ed when the source fires. Sources are cheaply
/// cloneable; all clones observe the same state.
#[derive(Clone)]
pub struct CancelSource {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    canceled: crate::loom::sync::atomic::AtomicBool,
    subscribers: Mutex<Vec<CancelSubscriber>>,
}

enum CancelSubscriber {
    Workload(Weak<Workload>),
    Signal(Weak<WaitSignal>),
}

/// Sink for continuations that want to run on a worker pool instead of the
/// completer's thread.
pub(crate) trait DispatchTarget: Send + Sync {
    fn dispatch(&self, f: Box<dyn FnOnce() + Send>);
}

/// What [`Workload::try_run`] did with the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    /// The body was executed and the workload is now terminal.
    Ran,
    /// The workload was already terminal (canceled while queued); nothing ran.
    SoftDeleted,
    /// The dispatch observed an impossible state and faulted the workload.
    Faulted,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

// === impl Workload ===

impl Workload {
    /// Creates a workload from its body.
    pub fn new<F>(body: F) -> Arc<Self>
    where
        F: FnOnce(&WorkloadContext<'_>) -> Result<(), WorkloadError> + Send + 'static,
    {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicState::new(),
            body: Mutex::new(Some(Box::new(body))),
            fault: Mutex::new(None),
            continuations: ContinuationSlot::new(),
            bind: Mutex::new(BindSlot::Unbound),
        })
    }

    /// Returns a builder for workloads with cancellation wiring.
    #[must_use]
    pub fn builder() -> WorkloadBuilder {
        WorkloadBuilder { cancel: Vec::new() }
    }

    /// A process-unique workload id, for diagnostics.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Snapshot of the current lifecycle state.
    pub fn state(&self) -> WorkloadState {
        self.state.load()
    }

    /// `true` once the workload reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// `true` iff the workload ran to completion.
    pub fn is_completed(&self) -> bool {
        self.state() == WorkloadState::RanToCompletion
    }

    /// The terminal outcome, or `None` while the workload is still pending.
    ///
    /// A `Faulted` outcome carries the stored error, including the original
    /// body failure or panic message.
    pub fn outcome(&self) -> Option<WorkloadOutcome> {
        match self.state() {
            WorkloadState::RanToCompletion => Some(WorkloadOutcome::Completed),
            WorkloadState::Canceled => Some(WorkloadOutcome::Canceled),
            WorkloadState::Faulted => {
                let fault = self
                    .fault
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
                    .unwrap_or_else(|| {
                        Arc::new(WorkloadError::Scheduling(
                            "faulted workload carries no error".to_owned(),
                        ))
                    });
                Some(WorkloadOutcome::Faulted(fault))
            }
            _ => None,
        }
    }

    /// Requests cancellation.
    ///
    /// Before execution starts this is precise: the workload transitions to
    /// `Canceled`, is best-effort removed from its qdisc, and its
    /// continuations fire. Once the body is running, cancellation is
    /// cooperative; the body observes it through
    /// [`WorkloadContext::is_cancellation_requested`]. A running body is
    /// never unwound forcibly.
    ///
    /// Returns `false` if the workload was already terminal.
    pub fn cancel(self: &Arc<Self>) -> bool {
        loop {
            let cur = self.state();
            match cur {
                WorkloadState::Created | WorkloadState::Scheduled => {
                    if self.state.transition(cur, WorkloadState::Canceled).is_ok() {
                        tracing::trace!(workload = self.id, "canceled before execution");
                        self.remove_from_qdisc();
                        self.seal_and_run(None);
                        return true;
                    }
                }
                WorkloadState::Running => {
                    if self
                        .state
                        .transition(WorkloadState::Running, WorkloadState::CancellationRequested)
                        .is_ok()
                    {
                        tracing::trace!(workload = self.id, "cancellation requested");
                        return true;
                    }
                }
                WorkloadState::CancellationRequested => return true,
                WorkloadState::RanToCompletion
                | WorkloadState::Faulted
                | WorkloadState::Canceled => return false,
            }
        }
    }

    /// Registers `f` to run when the workload completes.
    ///
    /// Continuations registered before completion run exactly once, in
    /// registration order, on the completing thread. If the workload is
    /// already terminal, `f` runs inline on the calling thread before this
    /// method returns.
    pub fn continue_with<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.continue_with_options(f, ContinueOptions::default());
    }

    /// Registers `f` with explicit [`ContinueOptions`].
    pub fn continue_with_options<F>(&self, f: F, options: ContinueOptions)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut continuation = if options.dispatch {
            Continuation::dispatch(Box::new(f))
        } else {
            Continuation::inline(Box::new(f))
        };
        if options.schedule_first {
            continuation = continuation.scheduled_first();
        }
        if let Some(rejected) = self.continuations.push(continuation) {
            // already completed: the adder runs it on its own thread
            rejected.run(None);
        }
    }

    /// Blocks until the workload reaches a terminal state.
    ///
    /// Returns `true` iff the workload terminated within the timeout window;
    /// `None` waits indefinitely. A wait on an already-terminal workload
    /// returns immediately.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.wait_cancelable(timeout, None)
    }

    /// Like [`wait`](Self::wait), but additionally abandons the wait when
    /// `cancel` fires. An abandoned wait reports the state observed at that
    /// point.
    pub fn wait_cancelable(&self, timeout: Option<Duration>, cancel: Option<&CancelSource>) -> bool {
        if self.is_terminal() {
            return true;
        }

        // spin briefly before committing to a blocking wait
        let spins = spin_budget();
        for _ in 0..spins {
            if self.is_terminal() {
                return true;
            }
            core::hint::spin_loop();
        }

        let signal = Arc::new(WaitSignal::new());
        if self
            .continuations
            .push(Continuation::signal(signal.clone()))
            .is_some()
        {
            // sealed while we were registering: the workload is terminal
            return true;
        }
        if let Some(cancel) = cancel {
            cancel.subscribe_signal(&signal);
            if cancel.is_canceled() {
                signal.interrupt();
            }
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let fired = signal.wait(deadline);
        if !fired {
            // timed out or interrupted: deregister so the signal does not
            // linger until completion
            self.continuations.remove_signal(&signal);
        }
        self.is_terminal()
    }

    // --- pub(crate) lifecycle driven by qdiscs and the scheduler ---

    /// CAS `Created -> Scheduled` and bind to the accepting leaf.
    pub(crate) fn mark_scheduled(
        &self,
        leaf: Weak<dyn Qdisc>,
    ) -> Result<(), crate::error::QdiscError> {
        self.state
            .transition(WorkloadState::Created, WorkloadState::Scheduled)
            .map_err(|_| crate::error::QdiscError::AlreadyScheduled)?;
        *self.bind.lock().unwrap_or_else(PoisonError::into_inner) = BindSlot::Bound(leaf);
        Ok(())
    }

    /// Re-points the binding at a new leaf when residual workloads are
    /// drained into a different queue.
    pub(crate) fn rebind(&self, leaf: Weak<dyn Qdisc>) {
        let mut bind = self.bind.lock().unwrap_or_else(PoisonError::into_inner);
        if let BindSlot::Bound(_) = &*bind {
            *bind = BindSlot::Bound(leaf);
        }
    }

    /// Executes the workload on a worker.
    ///
    /// Transitions `Scheduled -> Running`, runs the body with panics
    /// contained, CASes to the terminal state, and fires continuations. A
    /// workload observed in any state other than `Scheduled` or a terminal
    /// one is faulted with a scheduling failure.
    pub(crate) fn try_run(
        self: &Arc<Self>,
        worker_id: usize,
        target: Option<&dyn DispatchTarget>,
    ) -> RunOutcome {
        match self
            .state
            .transition(WorkloadState::Scheduled, WorkloadState::Running)
        {
            Ok(()) => {}
            Err(observed) if observed.is_terminal() => {
                // canceled while queued: a soft-deleted entry, nothing to run
                return RunOutcome::SoftDeleted;
            }
            Err(observed) => {
                self.fault_scheduling(format!(
                    "workload {} dispatched in state {observed}",
                    self.id
                ));
                self.seal_and_run(target);
                return RunOutcome::Faulted;
            }
        }
        self.unbind();

        let body = self
            .body
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(body) = body else {
            self.fault_scheduling(format!("workload {} has no body at dispatch", self.id));
            self.seal_and_run(target);
            return RunOutcome::Faulted;
        };

        let ctx = WorkloadContext {
            workload: &**self,
            worker_id,
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| body(&ctx)));

        let next = match result {
            Ok(Ok(())) => WorkloadState::RanToCompletion,
            Ok(Err(WorkloadError::Canceled)) => WorkloadState::Canceled,
            Ok(Err(err)) => {
                self.store_fault(Arc::new(err));
                WorkloadState::Faulted
            }
            Err(payload) => {
                self.store_fault(Arc::new(WorkloadError::Panicked(panic_message(&*payload))));
                WorkloadState::Faulted
            }
        };

        // completion wins over a concurrent cancellation request
        let became_terminal = self.state.force_terminal(next);
        debug_assert!(became_terminal, "a running workload cannot be terminal");
        tracing::trace!(workload = self.id, state = %next, "workload finished");

        self.seal_and_run(target);
        RunOutcome::Ran
    }

    fn unbind(&self) {
        *self.bind.lock().unwrap_or_else(PoisonError::into_inner) = BindSlot::Sealed;
    }

    fn remove_from_qdisc(self: &Arc<Self>) {
        let leaf = {
            let bind = self.bind.lock().unwrap_or_else(PoisonError::into_inner);
            match &*bind {
                BindSlot::Bound(leaf) => leaf.upgrade(),
                _ => None,
            }
        };
        if let Some(leaf) = leaf {
            // best-effort: a leaf that cannot remove leaves the entry behind
            // as a soft-deleted workload
            let _removed = leaf.try_remove(self);
        }
    }

    fn store_fault(&self, err: Arc<WorkloadError>) {
        let mut fault = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        if fault.is_none() {
            *fault = Some(err);
        }
    }

    fn fault_scheduling(&self, message: String) {
        tracing::error!(workload = self.id, "{message}");
        self.store_fault(Arc::new(WorkloadError::Scheduling(message)));
        self.state.force_terminal(WorkloadState::Faulted);
    }

    fn seal_and_run(&self, target: Option<&dyn DispatchTarget>) {
        for continuation in self.continuations.seal() {
            continuation.run(target);
        }
    }
}

impl fmt::Debug for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workload")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

// === impl WorkloadContext ===

impl WorkloadContext<'_> {
    /// `true` once an external cancel fired while this body was running.
    ///
    /// Bodies honoring the request should return
    /// [`WorkloadError::Canceled`], which terminates the workload as
    /// `Canceled` rather than `Faulted`.
    #[must_use]
    pub fn is_cancellation_requested(&self) -> bool {
        self.workload.state() == WorkloadState::CancellationRequested
    }

    /// The id of the worker executing this body.
    #[must_use]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// The executing workload.
    #[must_use]
    pub fn workload(&self) -> &Workload {
        self.workload
    }
}

impl fmt::Debug for WorkloadContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadContext")
            .field("workload", &self.workload.id)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

// === impl WorkloadOutcome ===

impl WorkloadOutcome {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, WorkloadOutcome::Completed)
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, WorkloadOutcome::Canceled)
    }

    /// The stored error of a faulted workload.
    #[must_use]
    pub fn err(&self) -> Option<&WorkloadError> {
        match self {
            WorkloadOutcome::Faulted(err) => Some(err),
            _ => None,
        }
    }
}

// === impl WorkloadBuilder ===

impl WorkloadBuilder {
    /// Cancels the workload when `source` fires.
    #[must_use]
    pub fn canceled_by(mut self, source: &CancelSource) -> Self {
        self.cancel.push(source.clone());
        self
    }

    /// Builds the workload and registers it with all cancel sources.
    pub fn build<F>(self, body: F) -> Arc<Workload>
    where
        F: FnOnce(&WorkloadContext<'_>) -> Result<(), WorkloadError> + Send + 'static,
    {
        let workload = Workload::new(body);
        for source in &self.cancel {
            source.subscribe_workload(&workload);
        }
        workload
    }
}

// === impl CancelSource ===

impl CancelSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                canceled: crate::loom::sync::atomic::AtomicBool::new(false),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// `true` once the source has fired.
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Fires the source, canceling every registered workload and
    /// interrupting every registered wait. Idempotent.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscribers = {
            let mut guard = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            core::mem::take(&mut *guard)
        };
        for subscriber in subscribers {
            match subscriber {
                CancelSubscriber::Workload(w) => {
                    if let Some(w) = w.upgrade() {
                        let _ = w.cancel();
                    }
                }
                CancelSubscriber::Signal(s) => {
                    if let Some(s) = s.upgrade() {
                        s.interrupt();
                    }
                }
            }
        }
    }

    fn subscribe_workload(&self, workload: &Arc<Workload>) {
        if self.is_canceled() {
            let _ = workload.cancel();
            return;
        }
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CancelSubscriber::Workload(Arc::downgrade(workload)));
        // close the subscribe-vs-cancel race: the canceling thread may have
        // drained the list before our push
        if self.is_canceled() {
            let _ = workload.cancel();
        }
    }

    pub(crate) fn subscribe_signal(&self, signal: &Arc<WaitSignal>) {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CancelSubscriber::Signal(Arc::downgrade(signal)));
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSource")
            .field("canceled", &self.is_canceled())
            .finish_non_exhaustive()
    }
}

// === helpers ===

/// 35 iterations on multi-core hosts, 1 on a single-core host where spinning
/// cannot observe progress.
fn spin_budget() -> usize {
    match std::thread::available_parallelism() {
        Ok(n) if n.get() == 1 => 1,
        _ => 35,
    }
}

fn panic_message(payload: &(dyn core::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "workload body panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use crate::loom::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_to_completion() {
        loom::model(|| {
            let ran = Arc::new(AtomicUsize::new(0));
            let workload = {
                let ran = ran.clone();
                Workload::new(move |_ctx| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            };

            workload
                .state
                .transition(WorkloadState::Created, WorkloadState::Scheduled)
                .unwrap();
            assert_eq!(workload.try_run(0, None), RunOutcome::Ran);

            assert_eq!(ran.load(Ordering::SeqCst), 1);
            assert_eq!(workload.state(), WorkloadState::RanToCompletion);
            assert!(workload.outcome().unwrap().is_completed());
        });
    }

    #[test]
    fn body_error_faults_the_workload() {
        loom::model(|| {
            let workload = Workload::new(|_ctx| {
                Err(WorkloadError::Scheduling("boom".to_owned()))
            });
            workload
                .state
                .transition(WorkloadState::Created, WorkloadState::Scheduled)
                .unwrap();
            workload.try_run(0, None);

            assert_eq!(workload.state(), WorkloadState::Faulted);
            let outcome = workload.outcome().unwrap();
            assert!(outcome.err().is_some());
        });
    }

    #[cfg(not(loom))]
    #[test]
    fn panic_is_contained_and_stored() {
        let workload = Workload::new(|_ctx| -> Result<(), WorkloadError> {
            panic!("kaboom");
        });
        workload
            .state
            .transition(WorkloadState::Created, WorkloadState::Scheduled)
            .unwrap();
        workload.try_run(0, None);

        assert_eq!(workload.state(), WorkloadState::Faulted);
        let outcome = workload.outcome().unwrap();
        let msg = format!("{}", outcome.err().unwrap());
        assert!(msg.contains("kaboom"), "panic payload must be preserved: {msg}");
    }

    #[test]
    fn cancel_before_run_skips_the_body() {
        loom::model(|| {
            let ran = Arc::new(AtomicUsize::new(0));
            let fired = Arc::new(AtomicUsize::new(0));
            let workload = {
                let ran = ran.clone();
                Workload::new(move |_ctx| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            };
            workload
                .state
                .transition(WorkloadState::Created, WorkloadState::Scheduled)
                .unwrap();

            {
                let fired = fired.clone();
                workload.continue_with(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                });
            }

            assert!(workload.cancel());
            assert_eq!(workload.state(), WorkloadState::Canceled);
            assert_eq!(fired.load(Ordering::SeqCst), 1, "continuation fires on cancel");

            // the dequeuing worker sees a soft-deleted workload
            assert_eq!(workload.try_run(0, None), RunOutcome::SoftDeleted);
            assert_eq!(ran.load(Ordering::SeqCst), 0);
            assert!(workload.wait(None));
        });
    }

    #[cfg(not(loom))]
    #[test]
    fn cooperative_cancellation_mid_body() {
        let source = CancelSource::new();
        let workload = Workload::builder().canceled_by(&source).build({
            let source = source.clone();
            move |ctx| {
                // simulate an external cancel arriving mid-execution
                source.cancel();
                if ctx.is_cancellation_requested() {
                    return Err(WorkloadError::Canceled);
                }
                Ok(())
            }
        });
        workload
            .state
            .transition(WorkloadState::Created, WorkloadState::Scheduled)
            .unwrap();
        workload.try_run(0, None);

        assert_eq!(workload.state(), WorkloadState::Canceled);
        assert!(workload.outcome().unwrap().is_canceled());
    }

    #[test]
    fn continuations_after_completion_run_inline() {
        loom::model(|| {
            let workload = Workload::new(|_ctx| Ok(()));
            workload
                .state
                .transition(WorkloadState::Created, WorkloadState::Scheduled)
                .unwrap();
            workload.try_run(0, None);

            let fired = Arc::new(AtomicUsize::new(0));
            {
                let fired = fired.clone();
                workload.continue_with(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                });
            }
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        });
    }

    #[cfg(not(loom))]
    #[test]
    fn wait_returns_within_timeout() {
        let workload = Workload::new(|_ctx| Ok(()));
        // not scheduled: the wait must time out
        assert!(!workload.wait(Some(Duration::from_millis(10))));

        workload
            .state
            .transition(WorkloadState::Created, WorkloadState::Scheduled)
            .unwrap();
        let thread = {
            let workload = workload.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                workload.try_run(0, None);
            })
        };
        assert!(workload.wait(Some(Duration::from_secs(5))));
        thread.join().unwrap();
    }

    #[cfg(not(loom))]
    #[test]
    fn canceled_wait_reports_pending_state() {
        let source = CancelSource::new();
        let workload = Workload::new(|_ctx| Ok(()));
        let waiter = {
            let workload = workload.clone();
            let source = source.clone();
            std::thread::spawn(move || workload.wait_cancelable(None, Some(&source)))
        };
        std::thread::sleep(Duration::from_millis(20));
        source.cancel();
        assert!(!waiter.join().unwrap(), "wait abandoned before completion");
    }
}
