//! The contract between the handler and its driving event loop.
//!
//! The loop itself lives outside this crate. The handler is written against
//! [`LoopCtx`] (interest ops on the underlying ARQ fd plus keyed one-shot
//! timers) and publishes the readiness of its *virtual* sockets (streams,
//! the listener) into a [`VirtualReadySet`] the loop merges with OS-level
//! readiness on every poll cycle.
//!
//! Everything here is single-threaded by construction: the ready set is
//! shared through `Rc<RefCell<_>>` and only ever touched from the owning
//! loop's thread.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use rustc_hash::FxHashSet;

/// Identity of a virtual socket inside one loop's ready set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FdToken(pub u64);

/// Handle of an armed timer, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(pub u64);

/// What a timer means to the handler when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKey {
    /// The handshake did not complete in time.
    Handshake,
    /// The identified keepalive probe went unanswered.
    Keepalive(u64),
    /// Grace period after a fatal failure elapsed; notify the owner.
    InvalidNotify,
}

/// What the handler may ask of the loop that drives it.
///
/// The loop calls back into the handler (`readable`, `writable`,
/// `timer_fired`, ...) and passes itself as `&mut dyn LoopCtx`; the handler
/// never blocks and never calls the loop re-entrantly.
pub trait LoopCtx {
    /// Adds read interest on the underlying ARQ fd.
    fn watch_readable(&mut self);

    /// Adds write interest on the underlying ARQ fd.
    fn watch_writable(&mut self);

    /// Removes write interest on the underlying ARQ fd.
    fn unwatch_writable(&mut self);

    /// Arms a one-shot timer; the loop later calls
    /// `StreamedHandler::timer_fired(key, ...)`.
    fn delay(&mut self, after: Duration, key: TimerKey) -> TimerId;

    /// Cancels a previously armed timer. Cancelling an already-fired timer
    /// is a no-op.
    fn cancel_timer(&mut self, timer: TimerId);
}

/// Second-level ready set for virtual sockets.
///
/// Readiness here is level-style: a token stays set until the owning
/// virtual socket clears it (a drained stream cancels its own readable
/// edge). The driving loop snapshots the sets each cycle and dispatches to
/// the application.
#[derive(Debug, Default)]
pub struct VirtualReadySet {
    readable: FxHashSet<FdToken>,
    writable: FxHashSet<FdToken>,
    next_token: u64,
}

impl VirtualReadySet {
    pub fn alloc_token(&mut self) -> FdToken {
        self.next_token += 1;
        FdToken(self.next_token)
    }

    pub fn set_readable(&mut self, token: FdToken) {
        self.readable.insert(token);
    }

    pub fn clear_readable(&mut self, token: FdToken) {
        self.readable.remove(&token);
    }

    pub fn set_writable(&mut self, token: FdToken) {
        self.writable.insert(token);
    }

    pub fn clear_writable(&mut self, token: FdToken) {
        self.writable.remove(&token);
    }

    pub fn is_readable(&self, token: FdToken) -> bool {
        self.readable.contains(&token)
    }

    pub fn is_writable(&self, token: FdToken) -> bool {
        self.writable.contains(&token)
    }

    /// Snapshot of the currently-readable tokens, in stable order.
    pub fn readable_tokens(&self) -> Vec<FdToken> {
        let mut tokens: Vec<FdToken> = self.readable.iter().copied().collect();
        tokens.sort_unstable();
        tokens
    }

    /// Snapshot of the currently-writable tokens, in stable order.
    pub fn writable_tokens(&self) -> Vec<FdToken> {
        let mut tokens: Vec<FdToken> = self.writable.iter().copied().collect();
        tokens.sort_unstable();
        tokens
    }
}

pub type SharedReadySet = Rc<RefCell<VirtualReadySet>>;

pub fn shared_ready_set() -> SharedReadySet {
    Rc::new(RefCell::new(VirtualReadySet::default()))
}
