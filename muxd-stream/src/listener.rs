//! The virtual listening socket.
//!
//! Server-side applications accept peer-opened streams through a
//! [`StreamedListener`]: the handler's accept callback pushes established
//! streams into its queue, and the listener asserts a virtual readable edge
//! so the loop dispatches an accept. At most one listener may exist per
//! underlying transport.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;

use tracing::debug;

use crate::error::{Result, StreamError};
use crate::reactor::{FdToken, SharedReadySet};
use crate::stream::StreamedFd;

/// Guard enforcing the one-listener-per-transport rule. Clone it alongside
/// the transport; every [`StreamedListener::listen`] call checks it.
#[derive(Debug, Clone, Default)]
pub struct ListenerSlot(Rc<Cell<bool>>);

impl ListenerSlot {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A virtual socket whose `accept` yields newly-established streams.
pub struct StreamedListener {
    local: SocketAddr,
    token: FdToken,
    ready: SharedReadySet,
    slot: ListenerSlot,
    open: Cell<bool>,
    queue: RefCell<VecDeque<Rc<StreamedFd>>>,
}

impl StreamedListener {
    /// Claims the slot and materializes the listener.
    pub fn listen(
        slot: &ListenerSlot,
        local: SocketAddr,
        ready: SharedReadySet,
    ) -> Result<Rc<Self>> {
        if slot.0.get() {
            return Err(StreamError::DuplicateListener);
        }
        slot.0.set(true);
        let token = ready.borrow_mut().alloc_token();
        Ok(Rc::new(Self {
            local,
            token,
            ready,
            slot: slot.clone(),
            open: Cell::new(true),
            queue: RefCell::new(VecDeque::new()),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn token(&self) -> FdToken {
        self.token
    }

    pub fn is_open(&self) -> bool {
        self.open.get()
    }

    /// Address validation: only the listener's own address binds.
    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        if addr != self.local {
            return Err(StreamError::BindMismatch {
                requested: addr,
                bound: self.local,
            });
        }
        Ok(())
    }

    /// Pops the next established stream; clears the readable edge when the
    /// queue runs dry.
    pub fn accept(&self) -> Result<Option<Rc<StreamedFd>>> {
        if !self.open.get() {
            return Err(StreamError::ListenerClosed);
        }
        let fd = self.queue.borrow_mut().pop_front();
        if fd.is_none() {
            self.ready.borrow_mut().clear_readable(self.token);
        }
        Ok(fd)
    }

    /// Called from the handler's accept path.
    pub fn accepted(&self, fd: Rc<StreamedFd>) {
        debug!(stream_id = fd.id(), "stream queued for accept");
        self.queue.borrow_mut().push_back(fd);
        self.ready.borrow_mut().set_readable(self.token);
    }

    /// Releases the slot; pending streams are dropped.
    pub fn close(&self) {
        self.open.set(false);
        self.slot.0.set(false);
        self.ready.borrow_mut().clear_readable(self.token);
        self.queue.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::shared_ready_set;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().expect("addr")
    }

    fn stream(ready: &SharedReadySet, id: u32) -> Rc<StreamedFd> {
        let token = ready.borrow_mut().alloc_token();
        Rc::new(StreamedFd::new(
            id,
            token,
            addr(4000),
            addr(5000),
            ready.clone(),
        ))
    }

    #[test]
    fn only_one_listener_per_slot() {
        let slot = ListenerSlot::new();
        let ready = shared_ready_set();
        let first = StreamedListener::listen(&slot, addr(7000), ready.clone()).expect("listen");
        assert!(matches!(
            StreamedListener::listen(&slot, addr(7000), ready.clone()),
            Err(StreamError::DuplicateListener)
        ));
        first.close();
        assert!(StreamedListener::listen(&slot, addr(7000), ready).is_ok());
    }

    #[test]
    fn accept_pops_and_manages_the_edge() {
        let slot = ListenerSlot::new();
        let ready = shared_ready_set();
        let listener = StreamedListener::listen(&slot, addr(7000), ready.clone()).expect("listen");

        listener.accepted(stream(&ready, 1));
        listener.accepted(stream(&ready, 2));
        assert!(ready.borrow().is_readable(listener.token()));

        let first = listener.accept().expect("accept").expect("stream");
        assert_eq!(first.id(), 1);
        let second = listener.accept().expect("accept").expect("stream");
        assert_eq!(second.id(), 2);

        // empty queue clears the edge
        assert!(listener.accept().expect("accept").is_none());
        assert!(!ready.borrow().is_readable(listener.token()));
    }

    #[test]
    fn bind_checks_the_address() {
        let slot = ListenerSlot::new();
        let ready = shared_ready_set();
        let listener = StreamedListener::listen(&slot, addr(7000), ready).expect("listen");
        assert!(listener.bind(addr(7000)).is_ok());
        assert!(matches!(
            listener.bind(addr(7001)),
            Err(StreamError::BindMismatch { .. })
        ));
    }

    #[test]
    fn closed_listener_rejects_accept() {
        let slot = ListenerSlot::new();
        let ready = shared_ready_set();
        let listener = StreamedListener::listen(&slot, addr(7000), ready).expect("listen");
        listener.close();
        assert!(matches!(
            listener.accept(),
            Err(StreamError::ListenerClosed)
        ));
    }
}
