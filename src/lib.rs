//! Supervised threads that hand their results back over channels.
//!
//! (if you need to run thousands of I/O-bound tasks, an `async` runtime is the better fit; this
//! crate spawns one OS thread per task)
//!
//! # Overview
//!
//! A *task* is a closure that runs on its own thread and sends zero or more [`Outcome`]s (values
//! or failures) into a channel. The channel is owned by the launcher and closed automatically when
//! the task exits, and the caller reads from it via the returned [`Outcomes`].
//!
//! A panic inside a task never leaves its thread: it is caught at the thread boundary and turned
//! into an [`Error::Panicked`] failure, just like an error returned from the task body.
//!
//! ## Contexts
//!
//! Every operation takes a [`Context`]. Contexts can be canceled (via a [`CancelGuard`]) and can
//! have a deadline. Blocking operations like [`Outcomes::block`] and
//! [`Emitter::send_cancelable`] return early once their context ends.
//!
//! ## Supervision
//!
//! A [`Supervision`] attached to a context links every task launched under it:
//!
//! - The first failure of any task is delivered to whoever calls [`Outcomes::block`] on *any* of
//!   the group's channels.
//! - After a failure, the supervised context is canceled, so that cooperative siblings stop.
//! - With [`SupervisionBuilder::wait`], [`Outcomes::block`] additionally joins every task of the
//!   group before returning.
//!
//! ## Fan-in
//!
//! [`group`] runs many tasks at once and merges their outcomes into a single channel.
//!
//! # Usage
//!
//! Launching a task and waiting for its result:
//!
//! ```
//! use strand::{go, Context};
//!
//! let ctx = Context::background();
//! let results = go(&ctx, |emitter| emitter.send(1 + 1));
//! assert_eq!(results.block(&ctx).unwrap(), 2);
//! ```
//!
//! A panic is reported like any other failure:
//!
//! ```
//! use strand::{Context, Emitter, Error, TaskBuilder};
//!
//! let ctx = Context::background();
//! let results = TaskBuilder::new()
//!     .capacity(1)
//!     .spawn(&ctx, |_: &Emitter<()>| -> Result<(), Error> { panic!("oh no") })
//!     .unwrap();
//! let err = results.block(&ctx).unwrap_err();
//! assert!(err.to_string().contains("oh no"));
//! ```
//!
//! A supervised group where one task fails, canceling its siblings:
//!
//! ```
//! use std::time::Duration;
//! use strand::{group, Context, Emitter, Error, Supervision};
//!
//! let (ctx, _cancel) = Supervision::builder().wait().attach(&Context::background());
//!
//! let task_ctx = ctx.clone();
//! let results = group(&ctx, 4, move |i| {
//!     let ctx = task_ctx.clone();
//!     move |emitter: &Emitter<usize>| -> Result<(), Error> {
//!         if i == 2 {
//!             return Err(Error::failed("task 2 gave up"));
//!         }
//!         // Sleeps until the failure above cancels the group.
//!         ctx.sleep(Duration::from_secs(60))?;
//!         emitter.send(i)
//!     }
//! });
//!
//! let err = results.block(&ctx).unwrap_err();
//! assert_eq!(err.to_string(), "task 2 gave up");
//! assert!(ctx.is_done());
//! ```

mod context;
mod error;
mod group;
mod outcome;
mod supervision;
mod sync;
mod task;

pub use context::{CancelGuard, Context};
pub use error::{BoxError, Error};
pub use group::{group, GroupBuilder};
pub use outcome::{Outcome, Outcomes};
pub use supervision::{Supervision, SupervisionBuilder};
pub use task::{go, Emitter, TaskBuilder};
