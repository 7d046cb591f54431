use crossbeam_channel::{select, Receiver};

use crate::{BoxError, Context, Error, Supervision};

/// The result of one step of a task: either a value, or a failure.
///
/// Tasks send any number of [`Outcome`]s into their channel (see [`Emitter`][crate::Emitter]),
/// and the launcher adds a failure [`Outcome`] when the task panics or returns an error.
#[derive(Debug)]
pub enum Outcome<T> {
    Value(T),
    Failure(Error),
}

impl<T> Outcome<T> {
    /// Creates a failure [`Outcome`] from an arbitrary error.
    pub fn failed<E: Into<BoxError>>(error: E) -> Self {
        Outcome::Failure(Error::failed(error))
    }

    /// Returns the value, if this is a [`Outcome::Value`].
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Value(value) => Some(value),
            Outcome::Failure(_) => None,
        }
    }

    /// Returns the failure, if this is a [`Outcome::Failure`].
    pub fn failure(&self) -> Option<&Error> {
        match self {
            Outcome::Value(_) => None,
            Outcome::Failure(err) => Some(err),
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Outcome::Value(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    /// Converts the [`Outcome`] into a [`Result`].
    pub fn into_result(self) -> Result<T, Error> {
        match self {
            Outcome::Value(value) => Ok(value),
            Outcome::Failure(err) => Err(err),
        }
    }
}

impl<T> From<Result<T, Error>> for Outcome<T> {
    fn from(result: Result<T, Error>) -> Self {
        match result {
            Ok(value) => Outcome::Value(value),
            Err(err) => Outcome::Failure(err),
        }
    }
}

/// The receiving end of a task's channel.
///
/// The channel is closed once the task (and, for [`group`][crate::group], every task in the group)
/// has exited. Iterating over an [`Outcomes`] yields every [`Outcome`] until then.
pub struct Outcomes<T> {
    recv: Receiver<Outcome<T>>,
}

impl<T> Outcomes<T> {
    pub(crate) fn new(recv: Receiver<Outcome<T>>) -> Self {
        Self { recv }
    }

    /// Blocks until the next [`Outcome`] is available, returning it as a [`Result`].
    ///
    /// This races several events against each other and returns whichever happens first:
    ///
    /// - `ctx` is canceled or its deadline passes: returns [`Error::Canceled`] or
    ///   [`Error::DeadlineExceeded`].
    /// - A task supervised by `ctx` has reported a failure: returns that failure. This way, a
    ///   thread waiting on one task learns about a sibling's failure without reading the
    ///   sibling's channel.
    /// - The channel yields an [`Outcome`]: returns it.
    /// - The channel is closed without yielding anything: returns [`Error::ChannelClosed`].
    ///
    /// Failures are reported before the group is canceled and before the failing task's channel
    /// is closed, so a pending failure is preferred over cancellation and closure.
    ///
    /// If `ctx` carries a [`Supervision`] created with [`SupervisionBuilder::wait`], this then
    /// blocks until every task registered with it has exited.
    ///
    /// # Deadlocks
    ///
    /// Joining includes every task registered with the supervision, so calling this with a
    /// waiting supervision from inside one of its own tasks never returns: the task would wait for
    /// itself to exit. Use [`Outcomes::recv`] there, or a context without the waiting supervision.
    ///
    /// [`SupervisionBuilder::wait`]: crate::SupervisionBuilder::wait
    pub fn block(&self, ctx: &Context) -> Result<T, Error> {
        let supervision = ctx.supervision();
        let result = self.race(ctx, supervision);
        if let Some(supervision) = supervision {
            supervision.join();
        }
        result
    }

    fn race(&self, ctx: &Context, supervision: Option<&Supervision>) -> Result<T, Error> {
        let done = ctx.done();
        let expiry = ctx.expiry();
        let none = crossbeam_channel::never();
        let failures = supervision.map_or(&none, Supervision::failures);

        let ended = select! {
            recv(failures) -> failure => match failure {
                Ok(failure) => return Err(failure),
                Err(_) => Error::ChannelClosed,
            },
            recv(self.recv) -> outcome => match outcome {
                Ok(outcome) => return outcome.into_result(),
                Err(_) => Error::ChannelClosed,
            },
            recv(done) -> _ => ctx.cause(),
            recv(expiry) -> _ => Error::DeadlineExceeded,
        };

        if let Some(failure) = supervision.and_then(Supervision::take_failure) {
            return Err(failure);
        }
        match (ended, ctx.err()) {
            // The channel most likely closed because the task saw the cancellation.
            (Error::ChannelClosed, Some(err)) => Err(err),
            (ended, _) => Err(ended),
        }
    }

    /// Blocks until the next [`Outcome`] is available, without regard for any [`Context`].
    ///
    /// Returns [`None`] once the channel is closed and empty.
    pub fn recv(&self) -> Option<Outcome<T>> {
        self.recv.recv().ok()
    }

    /// Returns an iterator that blocks on each [`Outcome`] until the channel is closed.
    pub fn iter(&self) -> impl Iterator<Item = Outcome<T>> + '_ {
        self.recv.iter()
    }

    /// Returns the underlying channel, for use with [`crossbeam_channel::select!`].
    pub fn receiver(&self) -> &Receiver<Outcome<T>> {
        &self.recv
    }

    pub fn into_receiver(self) -> Receiver<Outcome<T>> {
        self.recv
    }
}

impl<T> IntoIterator for Outcomes<T> {
    type Item = Outcome<T>;
    type IntoIter = crossbeam_channel::IntoIter<Outcome<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.recv.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a Outcomes<T> {
    type Item = Outcome<T>;
    type IntoIter = crossbeam_channel::Iter<'a, Outcome<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.recv.iter()
    }
}
