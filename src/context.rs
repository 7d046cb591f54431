//! Cancellation scopes.
//!
//! A [`Context`] is passed explicitly to every launch and retrieval call. It tells blocking
//! operations when to give up (because the context was canceled or its deadline passed), and it
//! optionally carries a [`Supervision`] that links a group of tasks together.
//!
//! Contexts form a tree: a context derived via [`Context::with_cancel`], [`Context::with_deadline`]
//! or [`SupervisionBuilder::attach`][crate::SupervisionBuilder::attach] is canceled when its parent
//! is, inherits its parent's deadline (unless it has an earlier one), and inherits its parent's
//! [`Supervision`].
//!
//! Cancellation is signaled by closing a channel, so any number of threads can wait for it inside
//! a [`crossbeam_channel::select!`] alongside other channel operations.

use std::{
    fmt, mem,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use crossbeam_channel::{select, Receiver, Sender};

use crate::{sync::Mutex, Error, Supervision};

/// A cancellation scope, optionally carrying a [`Supervision`].
///
/// Cloning a [`Context`] is cheap and yields a handle to the same scope.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    /// [`None`] for contexts that can never be canceled.
    node: Option<Arc<CancelNode>>,
    deadline: Option<Instant>,
    supervision: Option<Arc<Supervision>>,
}

impl Context {
    /// Returns a root context that is never canceled and has no deadline.
    pub fn background() -> Self {
        Self {
            inner: Arc::new(Inner {
                node: None,
                deadline: None,
                supervision: None,
            }),
        }
    }

    /// Derives a context that can be canceled via the returned [`CancelGuard`].
    pub fn with_cancel(&self) -> (Context, CancelGuard) {
        self.derive_with(self.inner.deadline, |_| self.inner.supervision.clone())
    }

    /// Derives a context that expires at `deadline`.
    ///
    /// If `self` already has an earlier deadline, that one is kept.
    pub fn with_deadline(&self, deadline: Instant) -> (Context, CancelGuard) {
        let deadline = match self.inner.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        self.derive_with(Some(deadline), |_| self.inner.supervision.clone())
    }

    /// Derives a context that expires after `timeout` has elapsed.
    pub fn with_timeout(&self, timeout: Duration) -> (Context, CancelGuard) {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Creates a child of `self` with its own cancellation node.
    ///
    /// `supervision` is invoked with the new node, so a [`Supervision`] can use it as its
    /// cancellation trigger.
    pub(crate) fn derive_with<F>(
        &self,
        deadline: Option<Instant>,
        supervision: F,
    ) -> (Context, CancelGuard)
    where
        F: FnOnce(&Arc<CancelNode>) -> Option<Arc<Supervision>>,
    {
        let node = CancelNode::new(deadline);
        let supervision = supervision(&node);
        if let Some(parent) = &self.inner.node {
            parent.adopt(&node);
        }
        let ctx = Context {
            inner: Arc::new(Inner {
                node: Some(node.clone()),
                deadline,
                supervision,
            }),
        };
        (ctx, CancelGuard { node })
    }

    /// Returns the deadline after which this context counts as expired, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Returns the [`Supervision`] attached to this context or one of its ancestors.
    pub fn supervision(&self) -> Option<&Supervision> {
        self.inner.supervision.as_deref()
    }

    pub(crate) fn supervision_arc(&self) -> Option<Arc<Supervision>> {
        self.inner.supervision.clone()
    }

    /// Returns why this context ended, or [`None`] if it is still live.
    ///
    /// The error is always [`Error::Canceled`] or [`Error::DeadlineExceeded`].
    pub fn err(&self) -> Option<Error> {
        if let Some(reason) = self.inner.node.as_ref().and_then(|node| node.reason()) {
            return Some(reason.into_error());
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }

    /// Returns `true` once this context has been canceled or has expired.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Returns a channel that is closed when this context is canceled.
    ///
    /// Nothing is ever sent on the channel, a receive only completes (with an error) once the
    /// context is canceled. Deadlines are *not* signaled through this channel, use
    /// [`Context::expiry`] for that.
    pub fn done(&self) -> Receiver<()> {
        match &self.inner.node {
            Some(node) => node.done.clone(),
            None => crossbeam_channel::never(),
        }
    }

    /// Returns a channel that delivers a message once this context's deadline passes.
    ///
    /// If there is no deadline, the channel never delivers anything.
    pub fn expiry(&self) -> Receiver<Instant> {
        match self.inner.deadline {
            Some(deadline) => crossbeam_channel::at(deadline),
            None => crossbeam_channel::never(),
        }
    }

    /// The error to report after `done()` fired.
    pub(crate) fn cause(&self) -> Error {
        self.err().unwrap_or(Error::Canceled)
    }

    /// Blocks until this context is canceled or expires, and returns the reason.
    pub fn wait_done(&self) -> Error {
        let done = self.done();
        let expiry = self.expiry();
        select! {
            recv(done) -> _ => self.cause(),
            recv(expiry) -> _ => Error::DeadlineExceeded,
        }
    }

    /// Sleeps for `duration`, waking up early if the context ends first.
    ///
    /// Task bodies can use this to pause between steps while still reacting to cancellation.
    pub fn sleep(&self, duration: Duration) -> Result<(), Error> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        let done = self.done();
        let expiry = self.expiry();
        select! {
            recv(done) -> _ => Err(self.cause()),
            recv(expiry) -> _ => Err(Error::DeadlineExceeded),
            default(duration) => Ok(()),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.err().map(|err| err.as_label()))
            .field("supervised", &self.inner.supervision.is_some())
            .finish_non_exhaustive()
    }
}

/// Cancels a derived [`Context`] when [`CancelGuard::cancel`] is called or when it's dropped.
///
/// Every context derived from a cancelable parent is registered with that parent until it is
/// canceled, so the guard should be kept alive exactly as long as the derived context is needed.
#[must_use = "dropping a `CancelGuard` cancels its context immediately"]
pub struct CancelGuard {
    node: Arc<CancelNode>,
}

impl CancelGuard {
    /// Cancels the context, along with every context derived from it.
    ///
    /// Canceling an already canceled context does nothing.
    pub fn cancel(&self) {
        self.node.cancel();
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.node.cancel();
    }
}

impl fmt::Debug for CancelGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelGuard")
            .field("canceled", &self.node.reason().is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reason {
    Canceled,
    DeadlineExceeded,
}

impl Reason {
    fn into_error(self) -> Error {
        match self {
            Reason::Canceled => Error::Canceled,
            Reason::DeadlineExceeded => Error::DeadlineExceeded,
        }
    }
}

/// One node of the cancellation tree.
pub(crate) struct CancelNode {
    /// Closed (by dropping the sender in `state`) once the node is canceled.
    done: Receiver<()>,
    deadline: Option<Instant>,
    state: Mutex<NodeState>,
}

struct NodeState {
    sender: Option<Sender<()>>,
    reason: Option<Reason>,
    children: Vec<Weak<CancelNode>>,
}

impl CancelNode {
    fn new(deadline: Option<Instant>) -> Arc<Self> {
        let (sender, done) = crossbeam_channel::bounded(0);
        Arc::new(Self {
            done,
            deadline,
            state: Mutex::new(NodeState {
                sender: Some(sender),
                reason: None,
                children: Vec::new(),
            }),
        })
    }

    fn reason(&self) -> Option<Reason> {
        self.state.lock().reason
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.reason().is_some()
    }

    pub(crate) fn cancel(&self) {
        self.cancel_with(Reason::Canceled);
    }

    fn cancel_with(&self, reason: Reason) {
        // Canceling an expired context still reports the expiry.
        let reason = match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Reason::DeadlineExceeded,
            _ => reason,
        };

        let (sender, children) = {
            let mut state = self.state.lock();
            if state.reason.is_some() {
                return;
            }
            state.reason = Some(reason);
            (state.sender.take(), mem::take(&mut state.children))
        };

        // Closes `done`, waking everyone waiting on it.
        drop(sender);

        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel_with(reason);
            }
        }
    }

    /// Links `child` to `self`, canceling it right away if `self` is already canceled.
    fn adopt(&self, child: &Arc<CancelNode>) {
        let mut state = self.state.lock();
        match state.reason {
            Some(reason) => {
                drop(state);
                child.cancel_with(reason);
            }
            None => {
                state.children.retain(|child| child.strong_count() != 0);
                state.children.push(Arc::downgrade(child));
            }
        }
    }
}
