use crate::{runtime::CachedPanic, AnyComputation};
use bitflags::bitflags;
use std::{any::Any, cell::RefCell, rc::Rc};

slotmap::new_key_type! {
    /// Unique ID assigned to a reactive node.
    pub struct NodeId;
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct NodeFlags: u8 {
        /// The node's computation is currently on the stack (re-entrancy guard).
        const RUNNING = 1 << 0;
        /// The node is already on the batch queue, or has already propagated
        /// a notification during the current wave.
        const NOTIFIED = 1 << 1;
        /// A direct source is known to have changed.
        const DIRTY = 1 << 2;
        /// Some transitive source may have changed; staleness must be proven
        /// by epoch comparison before recomputing.
        const MAYBE_DIRTY = 1 << 3;
        /// The node holds live subscriptions on its sources.
        const TRACKING = 1 << 4;
        /// The node's last computation panicked; reads re-raise the payload.
        const HAS_ERROR = 1 << 5;
        /// The node has been disposed and must never run again.
        const DISPOSED = 1 << 6;
    }
}

pub(crate) struct ReactiveNode {
    pub value: Option<Rc<RefCell<dyn Any>>>,
    pub flags: NodeFlags,
    pub node_type: ReactiveNodeType,
    /// `write_clock` value when this node's value last changed. −1 until the
    /// first write or computation.
    pub value_epoch: i64,
    /// `write_clock` observed at this node's last completed refresh; the
    /// comparison base for staleness checks against source `value_epoch`s.
    pub checked_epoch: i64,
    /// De-dup stamp: the `run_epoch` of the listener that most recently
    /// recorded this node as a dependency.
    pub access_epoch: i64,
    /// `read_clock` stamp identifying this listener's current run.
    pub run_epoch: i64,
    /// Cached panic payload while `HAS_ERROR` is set.
    pub error: Option<CachedPanic>,
    /// Intrusive link for the scheduler's LIFO queue of notified effects.
    pub next_batched: Option<NodeId>,
}

impl ReactiveNode {
    pub fn new(
        value: Option<Rc<RefCell<dyn Any>>>,
        flags: NodeFlags,
        node_type: ReactiveNodeType,
    ) -> Self {
        Self {
            value,
            flags,
            node_type,
            value_epoch: -1,
            checked_epoch: -1,
            access_epoch: -1,
            run_epoch: -1,
            error: None,
            next_batched: None,
        }
    }

    pub fn value(&self) -> Rc<RefCell<dyn Any>> {
        self.value
            .clone()
            .expect("ReactiveNode.value to have a value")
    }
}

#[derive(Clone)]
pub(crate) enum ReactiveNodeType {
    Signal,
    Memo { f: Rc<dyn AnyComputation> },
    Effect { f: Rc<dyn AnyComputation> },
}
