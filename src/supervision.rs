//! Shared state linking a group of tasks.
//!
//! A [`Supervision`] is attached to a [`Context`] with [`Supervision::builder`]. Every task
//! launched under that context (or a context derived from it) then:
//!
//! - reports its failure (panic or returned error) to the supervision's failure slot instead of
//!   its own channel,
//! - cancels the supervised context after failing, so that well-behaved siblings stop early,
//! - if [`SupervisionBuilder::wait`] was used, registers itself so that
//!   [`Outcomes::block`][crate::Outcomes::block] can join every task before returning.
//!
//! The failure slot holds a single failure. The first failure to arrive wins; any failure that
//! arrives while the slot is occupied is logged and counted (see
//! [`Supervision::dropped_failures`]), but never blocks the reporting thread.

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::{
    context::CancelNode,
    sync::{Registration, WaitCounter},
    CancelGuard, Context, Error,
};

/// A builder for supervised [`Context`]s.
#[derive(Debug, Clone, Default)]
pub struct SupervisionBuilder {
    name: Option<String>,
    wait: bool,
}

impl SupervisionBuilder {
    /// Sets the name used when logging on behalf of this supervision.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Makes [`Outcomes::block`][crate::Outcomes::block] wait for every task launched under the
    /// supervised context to finish before returning.
    ///
    /// Without this, `block` returns as soon as its own outcome (or a failure, or cancellation)
    /// is available.
    #[inline]
    pub fn wait(self) -> Self {
        Self { wait: true, ..self }
    }

    /// Derives a supervised [`Context`] from `ctx`.
    ///
    /// The returned [`CancelGuard`] cancels the supervised context when dropped, so it must be
    /// kept around for as long as the supervised tasks should run.
    pub fn attach(self, ctx: &Context) -> (Context, CancelGuard) {
        ctx.derive_with(ctx.deadline(), |node| {
            let (failure_tx, failure_rx) = crossbeam_channel::bounded(1);
            Some(Arc::new(Supervision {
                name: self.name,
                failure_tx,
                failure_rx,
                pending: self.wait.then(|| Arc::new(WaitCounter::new())),
                cancel: node.clone(),
                dropped: AtomicUsize::new(0),
            }))
        })
    }
}

/// Coordination state shared by every task launched under a supervised [`Context`].
pub struct Supervision {
    name: Option<String>,
    failure_tx: Sender<Error>,
    failure_rx: Receiver<Error>,
    /// Only present when joining was requested.
    pending: Option<Arc<WaitCounter>>,
    cancel: Arc<CancelNode>,
    dropped: AtomicUsize,
}

impl Supervision {
    /// Returns a builder that can be used to attach a [`Supervision`] to a [`Context`].
    #[inline]
    pub fn builder() -> SupervisionBuilder {
        SupervisionBuilder::default()
    }

    /// Returns the name given to [`SupervisionBuilder::name`].
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns whether retrieval joins all registered tasks before returning.
    pub fn waits(&self) -> bool {
        self.pending.is_some()
    }

    /// Returns the number of registered tasks that are still running.
    ///
    /// Always 0 unless [`SupervisionBuilder::wait`] was used.
    pub fn in_flight(&self) -> usize {
        self.pending.as_ref().map_or(0, |pending| pending.count())
    }

    /// Returns how many failures could not be delivered because another one was already pending.
    ///
    /// A [`Canceled`] or [`DeadlineExceeded`] error returned by a task after the supervision was
    /// canceled is not counted: it is the task reacting to the cancellation, not a failure of its
    /// own. Those are only logged (at `trace` level).
    ///
    /// [`Canceled`]: crate::Error::Canceled
    /// [`DeadlineExceeded`]: crate::Error::DeadlineExceeded
    pub fn dropped_failures(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Cancels the supervised context and everything derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns `true` once the supervised context has been canceled.
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// Registers a task, if this supervision tracks them.
    ///
    /// Must be called before the task's thread is started, so that a concurrent
    /// [`Supervision::join`] can't miss it.
    pub(crate) fn register(&self) -> Registration {
        Registration::new(self.pending.clone())
    }

    /// Reports a task failure, then cancels the group.
    pub(crate) fn fail(&self, task: &str, failure: Error) {
        match self.failure_tx.try_send(failure) {
            Ok(()) => log::debug!(
                "{}: task '{task}' failed, canceling siblings",
                self.display_name()
            ),
            Err(TrySendError::Full(failure) | TrySendError::Disconnected(failure)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "{}: dropped failure of task '{task}', another failure is already pending: {failure}",
                    self.display_name()
                );
            }
        }

        self.cancel();
    }

    pub(crate) fn failures(&self) -> &Receiver<Error> {
        &self.failure_rx
    }

    /// Takes the pending failure, if there is one.
    pub(crate) fn take_failure(&self) -> Option<Error> {
        self.failure_rx.try_recv().ok()
    }

    /// Blocks until every registered task has finished.
    pub(crate) fn join(&self) {
        if let Some(pending) = &self.pending {
            pending.wait();
        }
    }

    fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("supervision")
    }
}

impl fmt::Debug for Supervision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervision")
            .field("name", &self.name)
            .field("in_flight", &self.in_flight())
            .field("dropped_failures", &self.dropped_failures())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io, thread,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{
        go, group,
        test::{silent_panic, LONG, SHORT},
        Emitter, TaskBuilder,
    };

    #[test]
    fn attach_derives_cancelable_context() {
        let (ctx, cancel) = Supervision::builder()
            .name("attach")
            .attach(&Context::background());
        let supervision = ctx.supervision().unwrap();
        assert_eq!(supervision.name(), Some("attach"));
        assert!(!supervision.waits());
        assert!(!ctx.is_done());

        drop(cancel);
        assert!(matches!(ctx.err(), Some(Error::Canceled)));
    }

    #[test]
    fn supervision_is_inherited() {
        let (ctx, _cancel) = Supervision::builder().wait().attach(&Context::background());
        let (child, _child_cancel) = ctx.with_timeout(LONG);
        assert!(child.supervision().unwrap().waits());

        ctx.supervision().unwrap().cancel();
        assert!(child.is_done());
    }

    #[test]
    fn manual_cancel_reaches_tasks() {
        let (ctx, _cancel) = Supervision::builder().attach(&Context::background());
        let task_ctx = ctx.clone();
        let results = go(&ctx, move |_: &Emitter<()>| task_ctx.sleep(LONG));

        thread::sleep(SHORT);
        ctx.supervision().unwrap().cancel();

        // The body's `Canceled` is an echo of the group's own cancellation and isn't reported.
        assert!(matches!(results.block(&ctx), Err(Error::Canceled)));
    }

    #[test]
    fn failure_is_routed_to_waiter() {
        let (ctx, _cancel) = Supervision::builder().attach(&Context::background());

        let slow_ctx = ctx.clone();
        let slow = go(&ctx, move |emitter: &Emitter<i32>| -> Result<(), Error> {
            slow_ctx.sleep(LONG)?;
            emitter.send(1)
        });
        let _failing = TaskBuilder::new()
            .capacity(1)
            .spawn(&ctx, |_: &Emitter<i32>| -> Result<(), io::Error> {
                Err(io::Error::new(io::ErrorKind::Other, "sibling failed"))
            })
            .unwrap();

        // Awaiting the slow task observes the sibling's failure rather than blocking.
        let err = slow.block(&ctx).unwrap_err();
        assert_eq!(err.downcast_ref::<io::Error>().unwrap().to_string(), "sibling failed");
        assert!(ctx.is_done());
    }

    #[test]
    fn second_failure_is_counted_as_dropped() {
        let (ctx, _cancel) = Supervision::builder()
            .wait()
            .attach(&Context::background());

        let first = go(&ctx, |_: &Emitter<()>| Err("first"));
        let second = go(&ctx, |_: &Emitter<()>| Err("second"));
        ctx.supervision().unwrap().join();

        let supervision = ctx.supervision().unwrap();
        assert_eq!(supervision.dropped_failures(), 1);
        let err = first.block(&ctx).unwrap_err();
        assert!(matches!(err, Error::Failed(_)));
        assert!(["first", "second"].contains(&err.to_string().as_str()));

        // The slot is empty again, so the second retrieval reports the group's cancellation.
        assert!(matches!(second.block(&ctx), Err(Error::Canceled)));
    }

    #[test]
    fn cancellation_echoes_are_not_counted() {
        let (ctx, _cancel) = Supervision::builder()
            .wait()
            .attach(&Context::background());

        let failing = go(&ctx, |_: &Emitter<()>| Err("real failure"));
        for _ in 0..4 {
            let task_ctx = ctx.clone();
            go(&ctx, move |_: &Emitter<()>| task_ctx.sleep(LONG));
        }

        let err = failing.block(&ctx).unwrap_err();
        assert_eq!(err.to_string(), "real failure");
        // The sleeping tasks all returned `Canceled`, which is not a failure of their own.
        assert_eq!(ctx.supervision().unwrap().dropped_failures(), 0);
    }

    #[test]
    fn wait_joins_all_tasks() {
        let (ctx, _cancel) = Supervision::builder()
            .wait()
            .attach(&Context::background());

        let finished = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let finished = finished.clone();
            go(&ctx, move |_: &Emitter<()>| -> Result<(), Error> {
                thread::sleep(SHORT * 2);
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let quick = TaskBuilder::new()
            .capacity(1)
            .spawn(&ctx, |emitter| emitter.send("quick"))
            .unwrap();
        assert_eq!(quick.block(&ctx).unwrap(), "quick");

        // `block` returned only after the slow siblings were done.
        assert_eq!(finished.load(Ordering::SeqCst), 4);
        assert_eq!(ctx.supervision().unwrap().in_flight(), 0);
    }

    #[test]
    fn without_wait_block_returns_early() {
        let (ctx, _cancel) = Supervision::builder().attach(&Context::background());

        let slow_ctx = ctx.clone();
        let _slow = go(&ctx, move |_: &Emitter<()>| slow_ctx.sleep(LONG));
        let quick = TaskBuilder::new()
            .capacity(1)
            .spawn(&ctx, |emitter| emitter.send(5))
            .unwrap();

        let start = Instant::now();
        assert_eq!(quick.block(&ctx).unwrap(), 5);
        assert!(start.elapsed() < LONG);
        assert_eq!(ctx.supervision().unwrap().in_flight(), 0);
    }

    #[test]
    fn stress_single_failure_cancels_group() {
        const TASKS: usize = 64;
        const FAILING: usize = 37;

        let (ctx, _cancel) = Supervision::builder()
            .name("stress")
            .wait()
            .attach(&Context::background());

        let task_ctx = ctx.clone();
        let results = group(&ctx, TASKS, move |i| {
            let ctx = task_ctx.clone();
            move |emitter: &Emitter<usize>| -> Result<(), Error> {
                if i == FAILING {
                    silent_panic(format!("task {i} exploded"));
                }
                // Everyone else keeps producing until told to stop.
                loop {
                    emitter.send_cancelable(&ctx, i)?;
                    ctx.sleep(Duration::from_millis(1))?;
                }
            }
        });

        // Drain everything so that no producer is left blocked on a full channel.
        let drainer = thread::spawn(move || results.into_iter().count());

        let err = ctx.supervision().unwrap().failures().recv().unwrap();
        match err {
            Error::Panicked { message, .. } => assert_eq!(message, "task 37 exploded"),
            other => panic!("unexpected failure {other:?}"),
        }
        assert!(matches!(ctx.err(), Some(Error::Canceled)));

        drainer.join().unwrap();
        ctx.supervision().unwrap().join();
        assert_eq!(ctx.supervision().unwrap().in_flight(), 0);
    }

    #[test]
    fn stress_failure_observed_by_block() {
        let (ctx, _cancel) = Supervision::builder().attach(&Context::background());

        let mut handles = Vec::new();
        for i in 0..32 {
            let ctx2 = ctx.clone();
            handles.push(go(&ctx, move |emitter: &Emitter<usize>| -> Result<(), Error> {
                if i == 7 {
                    return Err(Error::failed("seven"));
                }
                ctx2.sleep(LONG)?;
                emitter.send(i)
            }));
        }

        let err = handles[0].block(&ctx).unwrap_err();
        assert_eq!(err.to_string(), "seven");
        assert!(ctx.is_done());
    }

    #[test]
    fn supervision_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Supervision>();
    }
}
