//! Per-node event listener chain
//!
//! Nodes publish interface and frame events through an ordered chain.
//! Each listener returns a [`Disposition`]: `Continue` passes on,
//! `Handled` marks the event consumed but keeps propagating (so UI
//! observers behind a consumer still see it), `Stop` terminates the
//! chain.
//!
//! Dispatch iterates over a snapshot of the chain, so a listener that
//! registers another listener is safe — the new one fires from the next
//! event on.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::message::Message;

/// Three-valued listener result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Not mine; keep going.
    Continue,
    /// Consumed, but let later listeners observe it.
    Handled,
    /// Consumed; terminate the chain.
    Stop,
}

/// Event delivered to node listeners.
#[derive(Debug)]
pub enum NodeEvent<'a> {
    InterfaceAdded { iface: &'a str },
    InterfaceUp { iface: &'a str },
    InterfaceDown { iface: &'a str },
    InterfaceChange { iface: &'a str },
    /// A frame arrived on `iface` and survived the built-in data plane.
    Frame { iface: &'a str, message: &'a Message },
}

/// Handle identifying a registered listener, for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type ListenerFn = dyn FnMut(&NodeEvent<'_>) -> Disposition;

struct ChainInner {
    next_id: u64,
    entries: Vec<(ListenerId, Arc<Mutex<ListenerFn>>)>,
}

/// Ordered listener chain with snapshot dispatch.
///
/// The chain is a shared handle: cloning it (or taking
/// [`ListenerChain::handle`]) yields a registration endpoint usable from
/// inside a listener callback.
#[derive(Clone)]
pub struct ListenerChain {
    inner: Arc<Mutex<ChainInner>>,
}

impl Default for ListenerChain {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for ListenerChain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ListenerChain")
            .field("listeners", &inner.entries.len())
            .finish()
    }
}

impl ListenerChain {
    pub fn new() -> Self {
        ListenerChain {
            inner: Arc::new(Mutex::new(ChainInner {
                next_id: 1,
                entries: Vec::new(),
            })),
        }
    }

    /// A registration endpoint sharing this chain.
    pub fn handle(&self) -> ListenerChain {
        self.clone()
    }

    pub fn add(&self, listener: impl FnMut(&NodeEvent<'_>) -> Disposition + 'static) -> ListenerId {
        let mut inner = self.inner.lock();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        inner.entries.push((id, Arc::new(Mutex::new(listener))));
        id
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn remove(&self, id: ListenerId) {
        self.inner.lock().entries.retain(|(lid, _)| *lid != id);
    }

    /// Dispatch `event` through a snapshot of the chain. Returns the
    /// overall disposition: `Handled` if any listener consumed the event,
    /// `Stop` if one terminated the chain.
    pub fn dispatch(&self, event: &NodeEvent<'_>) -> Disposition {
        let snapshot: Vec<Arc<Mutex<ListenerFn>>> = {
            let inner = self.inner.lock();
            inner.entries.iter().map(|(_, l)| Arc::clone(l)).collect()
        };

        let mut overall = Disposition::Continue;
        for listener in snapshot {
            match (&mut *listener.lock())(event) {
                Disposition::Continue => {}
                Disposition::Handled => overall = Disposition::Handled,
                Disposition::Stop => return Disposition::Stop,
            }
        }
        overall
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EtherPayload;
    use crate::Mac;
    use alloc::rc::Rc;
    use alloc::vec;
    use core::cell::RefCell;

    fn frame() -> Message {
        Message::ethernet(
            Mac::new(0, 0, 0, 0, 0, 1),
            Mac::BROADCAST,
            EtherPayload::Data(vec![1]),
        )
    }

    #[test]
    fn test_handled_keeps_propagating() {
        let chain = ListenerChain::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s = Rc::clone(&seen);
        chain.add(move |_| {
            s.borrow_mut().push(1);
            Disposition::Handled
        });
        let s = Rc::clone(&seen);
        chain.add(move |_| {
            s.borrow_mut().push(2);
            Disposition::Continue
        });

        let msg = frame();
        let result = chain.dispatch(&NodeEvent::Frame {
            iface: "gig0/0",
            message: &msg,
        });
        assert_eq!(result, Disposition::Handled);
        assert_eq!(*seen.borrow(), [1, 2]);
    }

    #[test]
    fn test_stop_terminates_chain() {
        let chain = ListenerChain::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s = Rc::clone(&seen);
        chain.add(move |_| {
            s.borrow_mut().push(1);
            Disposition::Stop
        });
        let s = Rc::clone(&seen);
        chain.add(move |_| {
            s.borrow_mut().push(2);
            Disposition::Continue
        });

        let result = chain.dispatch(&NodeEvent::InterfaceUp { iface: "gig0/0" });
        assert_eq!(result, Disposition::Stop);
        assert_eq!(*seen.borrow(), [1]);
    }

    #[test]
    fn test_listener_added_during_dispatch_fires_next_event() {
        let chain = ListenerChain::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let handle = chain.handle();
        let s = Rc::clone(&seen);
        chain.add(move |_| {
            // Reentrant registration: must not fire during this dispatch.
            let s2 = Rc::clone(&s);
            handle.add(move |_| {
                s2.borrow_mut().push(99);
                Disposition::Continue
            });
            Disposition::Continue
        });

        chain.dispatch(&NodeEvent::InterfaceChange { iface: "a" });
        assert!(seen.borrow().is_empty());

        chain.dispatch(&NodeEvent::InterfaceChange { iface: "a" });
        assert_eq!(*seen.borrow(), [99]);
    }

    #[test]
    fn test_remove_listener() {
        let chain = ListenerChain::new();
        let seen = Rc::new(RefCell::new(0));

        let s = Rc::clone(&seen);
        let id = chain.add(move |_| {
            *s.borrow_mut() += 1;
            Disposition::Continue
        });

        chain.dispatch(&NodeEvent::InterfaceUp { iface: "x" });
        chain.remove(id);
        chain.remove(id); // idempotent
        chain.dispatch(&NodeEvent::InterfaceUp { iface: "x" });
        assert_eq!(*seen.borrow(), 1);
    }
}
