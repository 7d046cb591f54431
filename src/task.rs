use std::{
    io,
    panic::{self, AssertUnwindSafe},
    thread,
};

use crossbeam_channel::{select, Sender};

use crate::{BoxError, Context, Error, Outcome, Outcomes, Supervision};

/// The send-only end of a task's channel, handed to the task body by reference.
///
/// The launcher owns the underlying sender and closes the channel once the body returns, so the
/// body can't keep the channel open past its own lifetime.
pub struct Emitter<T> {
    sender: Sender<Outcome<T>>,
}

impl<T> Emitter<T> {
    /// Sends `value` to the receiver, blocking until there's room in the channel.
    ///
    /// Returns [`Error::ChannelClosed`] if the receiving [`Outcomes`] was dropped.
    pub fn send(&self, value: T) -> Result<(), Error> {
        self.emit(Outcome::Value(value))
    }

    /// Sends a failure to the receiver, blocking until there's room in the channel.
    pub fn send_failure<E: Into<BoxError>>(&self, error: E) -> Result<(), Error> {
        self.emit(Outcome::failed(error))
    }

    /// Sends an arbitrary [`Outcome`] to the receiver.
    pub fn emit(&self, outcome: Outcome<T>) -> Result<(), Error> {
        self.sender.send(outcome).map_err(|_| Error::ChannelClosed)
    }

    /// Sends `value` to the receiver, unless `ctx` ends first.
    ///
    /// Long-running producers should use this instead of [`Emitter::send`], so that they stop
    /// promptly when canceled instead of waiting forever on a receiver that will never come.
    pub fn send_cancelable(&self, ctx: &Context, value: T) -> Result<(), Error> {
        self.emit_cancelable(ctx, Outcome::Value(value))
    }

    /// Sends a failure to the receiver, unless `ctx` ends first.
    pub fn send_failure_cancelable<E: Into<BoxError>>(
        &self,
        ctx: &Context,
        error: E,
    ) -> Result<(), Error> {
        self.emit_cancelable(ctx, Outcome::failed(error))
    }

    /// Sends an arbitrary [`Outcome`] to the receiver, unless `ctx` ends first.
    pub fn emit_cancelable(&self, ctx: &Context, outcome: Outcome<T>) -> Result<(), Error> {
        let done = ctx.done();
        let expiry = ctx.expiry();
        select! {
            send(self.sender, outcome) -> res => res.map_err(|_| Error::ChannelClosed),
            recv(done) -> _ => Err(ctx.cause()),
            recv(expiry) -> _ => Err(Error::DeadlineExceeded),
        }
    }
}

/// A builder object that can be used to configure and launch a task.
#[derive(Debug, Clone, Default)]
pub struct TaskBuilder {
    name: Option<String>,
    capacity: usize,
}

impl TaskBuilder {
    /// Creates a new [`TaskBuilder`] with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the name of the task's thread.
    ///
    /// Named tasks log when they start and exit (at `trace` level).
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the capacity of the task's channel.
    ///
    /// By default, a capacity of 0 is used, which means that every send from the task body will
    /// block until the receiver takes the [`Outcome`].
    #[inline]
    pub fn capacity(self, capacity: usize) -> Self {
        Self { capacity, ..self }
    }

    /// Launches `body` on a new thread and returns the receiving end of its channel.
    ///
    /// The body runs to completion on its own thread. Afterwards, the channel is closed. If the
    /// body panics or returns an error, the failure is delivered without blocking:
    ///
    /// - If `ctx` carries a [`Supervision`], the failure is reported to it, and then the
    ///   supervised context is canceled.
    /// - Otherwise, the failure is sent to the task's own channel, if the receiver can take it
    ///   right away.
    ///
    /// A failure that can't be delivered is logged at `error` level.
    ///
    /// Fails only if the OS refuses to create the thread.
    pub fn spawn<T, F, E>(self, ctx: &Context, body: F) -> io::Result<Outcomes<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Emitter<T>) -> Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        let (sender, recv) = crossbeam_channel::bounded(self.capacity);
        let supervision = ctx.supervision_arc();

        // Registered before the thread exists, released when the thread's closure is dropped
        // (which also happens if spawning fails).
        let registration = supervision.as_ref().map(|s| s.register());

        let mut builder = thread::Builder::new();
        if let Some(name) = self.name.clone() {
            builder = builder.name(name);
        }
        let name = self.name;
        builder.spawn(move || {
            // Dropped last, after the channel has been closed.
            let _registration = registration;
            if let Some(name) = &name {
                log::trace!("task '{name}' starting");
            }

            let emitter = Emitter { sender };
            let failure = match panic::catch_unwind(AssertUnwindSafe(|| body(&emitter))) {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(unbox(err.into())),
                Err(payload) => Some(Error::from_panic(payload)),
            };

            if let Some(failure) = failure {
                let task = name.as_deref().unwrap_or("<unnamed>");
                deliver(task, supervision.as_deref(), &emitter, failure);
            }
            drop(emitter);

            if let Some(name) = &name {
                log::trace!("task '{name}' exiting");
            }
        })?;

        Ok(Outcomes::new(recv))
    }
}

/// Launches `body` on a new thread, using the default [`TaskBuilder`] configuration.
///
/// See [`TaskBuilder::spawn`] for details.
///
/// # Panics
///
/// Panics if the OS fails to create a thread, like [`std::thread::spawn`].
pub fn go<T, F, E>(ctx: &Context, body: F) -> Outcomes<T>
where
    T: Send + 'static,
    F: FnOnce(&Emitter<T>) -> Result<(), E> + Send + 'static,
    E: Into<BoxError>,
{
    TaskBuilder::new()
        .spawn(ctx, body)
        .expect("failed to spawn thread")
}

/// Avoids double-wrapping errors that already are an [`Error`] (eg. from `?` on a cancelable send).
fn unbox(err: BoxError) -> Error {
    match err.downcast::<Error>() {
        Ok(err) => *err,
        Err(err) => Error::Failed(err),
    }
}

fn deliver<T>(
    task: &str,
    supervision: Option<&Supervision>,
    emitter: &Emitter<T>,
    failure: Error,
) {
    match supervision {
        // A body bailing out because the group was canceled is not a failure of its own.
        Some(supervision) if failure.is_context() && supervision.is_canceled() => {
            log::trace!("task '{task}' stopped after cancellation");
        }
        Some(supervision) => supervision.fail(task, failure),
        None => {
            if let Err(err) = emitter.sender.try_send(Outcome::Failure(failure)) {
                if let Some(failure) = err.into_inner().failure() {
                    log::error!(
                        "task '{task}' failed and nobody was ready to receive it: {failure}"
                    );
                }
            }
        }
    }
}
