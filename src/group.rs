//! Fan-in of many tasks into a single channel.

use std::{io, thread};

use crate::{BoxError, Context, Emitter, Outcomes, TaskBuilder};

/// A builder object that can be used to configure and launch a group of tasks.
#[derive(Debug, Clone)]
pub struct GroupBuilder {
    name: Option<String>,
    capacity: usize,
    task_capacity: usize,
}

impl Default for GroupBuilder {
    fn default() -> Self {
        Self {
            name: None,
            capacity: 0,
            task_capacity: 1,
        }
    }
}

impl GroupBuilder {
    /// Creates a new [`GroupBuilder`] with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base name of the group's threads.
    ///
    /// Each task thread will be named according to this base name and its index.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the capacity of the merged output channel (0 by default).
    #[inline]
    pub fn capacity(self, capacity: usize) -> Self {
        Self { capacity, ..self }
    }

    /// Sets the capacity of each individual task's channel (1 by default).
    ///
    /// This is the buffer between a task and the thread relaying its outcomes into the output
    /// channel.
    #[inline]
    pub fn task_capacity(self, task_capacity: usize) -> Self {
        Self {
            task_capacity,
            ..self
        }
    }

    /// Launches `n` tasks, created by calling `factory` with each index in `0..n`, and merges
    /// their outcomes into one channel.
    ///
    /// Outcomes of different tasks may interleave arbitrarily, but the outcomes of any single
    /// task arrive in the order it emitted them. A failing task does not stop the others (unless
    /// `ctx` is supervised, in which case the failure cancels the supervised context).
    ///
    /// The group itself runs as a task, so a panic in `factory` is contained like any other.
    /// The output channel is closed once every task has exited and all of their outcomes have
    /// been forwarded. Once `ctx` is canceled or expires, outcomes that nobody is waiting for are
    /// discarded instead of forwarded, so the group can still finish.
    pub fn spawn<T, G, F, E>(
        self,
        ctx: &Context,
        n: usize,
        factory: G,
    ) -> io::Result<Outcomes<T>>
    where
        T: Send + 'static,
        G: Fn(usize) -> F + Send + 'static,
        F: FnOnce(&Emitter<T>) -> Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        let mut launcher = TaskBuilder::new().capacity(self.capacity);
        if let Some(name) = &self.name {
            launcher = launcher.name(name.clone());
        }

        let task_ctx = ctx.clone();
        let name = self.name;
        let task_capacity = self.task_capacity;
        launcher.spawn(ctx, move |out: &Emitter<T>| -> io::Result<()> {
            let ctx = &task_ctx;
            thread::scope(|scope| -> io::Result<()> {
                for i in 0..n {
                    let mut task = TaskBuilder::new().capacity(task_capacity);
                    let mut relay = thread::Builder::new();
                    if let Some(name) = &name {
                        task = task.name(format!("{name}-{i}"));
                        relay = relay.name(format!("{name}-relay-{i}"));
                    }

                    let source = task.spawn(ctx, factory(i))?;
                    relay.spawn_scoped(scope, move || forward(ctx, source, out))?;
                }
                Ok(())
            })
        })
    }
}

/// Launches `n` tasks created by `factory`, merging their outcomes into one channel.
///
/// See [`GroupBuilder::spawn`] for details.
///
/// # Panics
///
/// Panics if the OS fails to create the group's thread, like [`std::thread::spawn`]. Failing to
/// create threads for individual tasks is reported as a failure of the group instead.
pub fn group<T, G, F, E>(ctx: &Context, n: usize, factory: G) -> Outcomes<T>
where
    T: Send + 'static,
    G: Fn(usize) -> F + Send + 'static,
    F: FnOnce(&Emitter<T>) -> Result<(), E> + Send + 'static,
    E: Into<BoxError>,
{
    GroupBuilder::new()
        .spawn(ctx, n, factory)
        .expect("failed to spawn thread")
}

fn forward<T>(ctx: &Context, source: Outcomes<T>, out: &Emitter<T>) {
    let mut listening = true;
    for outcome in source {
        // Once the receiver is gone or `ctx` has ended, keep draining so the source can finish.
        if listening && out.emit_cancelable(ctx, outcome).is_err() {
            listening = false;
        }
    }
}
