#![forbid(unsafe_code)]

use crate::{
    macros::debug_warn,
    node::{NodeFlags, NodeId, ReactiveNode, ReactiveNodeType},
    AnyComputation, Effect, EffectState, Memo, MemoState, ReadSignal, RwSignal,
    WriteSignal,
};
use core::hash::BuildHasherDefault;
use indexmap::IndexSet;
use rustc_hash::FxHasher;
use slotmap::{SecondaryMap, SlotMap, SparseSecondaryMap};
use std::{
    any::Any,
    cell::{Cell, RefCell},
    fmt::Debug,
    marker::PhantomData,
    panic::{self, AssertUnwindSafe},
    rc::Rc,
    sync::Arc,
};
use thiserror::Error;

thread_local! {
    pub(crate) static RUNTIMES: RefCell<SlotMap<RuntimeId, Runtime>> = Default::default();
    pub(crate) static CURRENT_RUNTIME: Cell<Option<RuntimeId>> = const { Cell::new(None) };
}

type FxIndexSet<T> = IndexSet<T, BuildHasherDefault<FxHasher>>;

/// How many queue waves a single batch drain may process before further
/// signal writes stop notifying their subscribers.
///
/// This is a containment device for runaway write feedback loops (an effect
/// writing a signal that re-notifies it, directly or transitively), not a
/// feature: once the guard trips, the remainder of the drain runs without
/// notification, so downstream state may be left incoherent until the next
/// independent write. Valid programs never reach it. The threshold can be
/// raised or lowered per runtime with
/// [`RuntimeId::set_max_batch_iterations`].
pub const DEFAULT_MAX_BATCH_ITERATIONS: usize = 100;

/// The payload re-raised when reading a memo whose computation panicked.
///
/// A panic payload cannot be shared between unwinds, so the runtime captures
/// the panic message and re-raises this value on every read of the poisoned
/// memo until its computation next succeeds.
#[derive(Clone, Debug, Error)]
#[error("memo computation panicked: {msg}")]
pub struct CachedPanic {
    msg: Arc<str>,
}

impl CachedPanic {
    pub(crate) fn new(payload: &(dyn Any + Send)) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&'static str>() {
            Arc::from(*s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Arc::from(s.as_str())
        } else if let Some(cached) = payload.downcast_ref::<CachedPanic>() {
            Arc::clone(&cached.msg)
        } else {
            Arc::from("Box<dyn Any>")
        };
        Self { msg }
    }

    /// The message of the original panic.
    pub fn message(&self) -> &str {
        &self.msg
    }
}

// The data structure that owns all the signals, memos, and effects of one
// reactive graph, together with the clocks and scheduler state that drive it.
//
// In terms of concept and algorithm, the push/pull marking here is
// significantly inspired by preact's signals
// (https://github.com/preactjs/signals): a write marks direct subscribers
// DIRTY eagerly, everything further downstream MAYBE_DIRTY, and readers
// discharge MAYBE_DIRTY lazily by comparing source change stamps against
// the clock value they last refreshed at.
pub(crate) struct Runtime {
    pub observer: Cell<Option<NodeId>>,
    pub nodes: RefCell<SlotMap<NodeId, ReactiveNode>>,
    pub node_subscribers:
        RefCell<SecondaryMap<NodeId, RefCell<FxIndexSet<NodeId>>>>,
    pub node_sources: RefCell<SecondaryMap<NodeId, RefCell<Vec<NodeId>>>>,
    #[allow(clippy::type_complexity)]
    pub node_cleanups:
        RefCell<SparseSecondaryMap<NodeId, Vec<Box<dyn FnOnce()>>>>,
    /// Sources read for the first time during the current run, in read
    /// order. `None` while the run is still repeating its previous
    /// dependency sequence.
    pub new_sources: RefCell<Option<Vec<NodeId>>>,
    /// Cursor into the current listener's previous dependency sequence;
    /// frozen once `new_sources` is allocated.
    pub source_index: Cell<usize>,
    /// Ticks on every value-changing write (and on every memo value change).
    pub write_clock: Cell<i64>,
    /// Ticks once per listener run, stamping that run's identity.
    pub read_clock: Cell<i64>,
    pub batch_depth: Cell<usize>,
    pub batch_iteration: Cell<usize>,
    /// Head of the intrusive LIFO list of notified effects.
    pub batched_head: Cell<Option<NodeId>>,
    pub max_batch_iterations: Cell<usize>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            observer: Cell::new(None),
            nodes: Default::default(),
            node_subscribers: Default::default(),
            node_sources: Default::default(),
            node_cleanups: Default::default(),
            new_sources: RefCell::new(None),
            source_index: Cell::new(0),
            write_clock: Cell::new(0),
            read_clock: Cell::new(0),
            batch_depth: Cell::new(0),
            batch_iteration: Cell::new(0),
            batched_head: Cell::new(None),
            max_batch_iterations: Cell::new(DEFAULT_MAX_BATCH_ITERATIONS),
        }
    }
}

// Dependency capture and reconciliation.
impl Runtime {
    /// Records `source` as a dependency of the current listener, if any.
    ///
    /// The listener repeats its previous dependency sequence through a
    /// cursor for as long as reads arrive in the same order; the first
    /// divergent read freezes the cursor and starts the append buffer that
    /// `reconcile_sources` folds back in at the end of the run.
    pub(crate) fn track_dependency(&self, source: NodeId) {
        let Some(listener) = self.observer.get() else {
            return;
        };
        // a memo reading itself must not become its own source
        if listener == source {
            return;
        }

        {
            let mut nodes = self.nodes.borrow_mut();
            let listener_run = match nodes.get(listener) {
                Some(listener) => listener.run_epoch,
                None => return,
            };
            let Some(node) = nodes.get_mut(source) else {
                return;
            };
            if node.access_epoch == listener_run {
                return;
            }
            node.access_epoch = listener_run;
        }

        // The access-epoch stamp is only a fast path: a nested listener's
        // read re-stamps the source, so membership in what this run has
        // already recorded (kept prefix + buffer) is the exact check. A
        // duplicate here would later truncate a live subscription.
        let mut new_sources = self.new_sources.borrow_mut();
        let cursor = self.source_index.get();
        {
            let sources = self.node_sources.borrow();
            if let Some(prefix) = sources.get(listener) {
                let prefix = prefix.borrow();
                if prefix.iter().take(cursor).any(|id| *id == source) {
                    return;
                }
            }
        }

        match &mut *new_sources {
            Some(buffer) => {
                if !buffer.contains(&source) {
                    buffer.push(source);
                }
            }
            None => {
                let repeats_previous = {
                    let sources = self.node_sources.borrow();
                    sources
                        .get(listener)
                        .map(|sources| {
                            sources.borrow().get(cursor) == Some(&source)
                        })
                        .unwrap_or(false)
                };
                if repeats_previous {
                    self.source_index.set(cursor + 1);
                } else {
                    *new_sources = Some(vec![source]);
                }
            }
        }
    }

    /// Installs `node_id` as the current listener and stamps its run
    /// identity. The returned scope must be passed to [`Self::finish_run`].
    pub(crate) fn begin_run(&self, node_id: NodeId) -> TrackingScope {
        let scope = TrackingScope {
            observer: self.observer.replace(Some(node_id)),
            new_sources: self.new_sources.borrow_mut().take(),
            source_index: self.source_index.replace(0),
        };
        let run_epoch = self.read_clock.get();
        self.read_clock.set(run_epoch + 1);
        if let Some(node) = self.nodes.borrow_mut().get_mut(node_id) {
            node.run_epoch = run_epoch;
        }
        scope
    }

    /// Reconciles the listener's dependency sequence against this run's
    /// reads and restores the outer tracking context.
    pub(crate) fn finish_run(&self, node_id: NodeId, scope: TrackingScope) {
        self.reconcile_sources(node_id);
        self.observer.set(scope.observer);
        *self.new_sources.borrow_mut() = scope.new_sources;
        self.source_index.set(scope.source_index);
    }

    fn reconcile_sources(&self, listener: NodeId) {
        let buffer = self.new_sources.borrow_mut().take();
        let cursor = self.source_index.get();
        let tracking = self
            .nodes
            .borrow()
            .get(listener)
            .map(|node| node.flags.contains(NodeFlags::TRACKING))
            .unwrap_or(false);

        match buffer {
            // Divergent run: keep the still-used prefix, drop the stale
            // suffix, append the new reads. Only the dropped suffix is
            // unsubscribed and only the appended tail subscribed; the end
            // state is the same as a full rebuild.
            Some(buffer) => {
                let removed = {
                    let sources = self.node_sources.borrow();
                    let Some(sources) = sources.get(listener) else {
                        return;
                    };
                    let mut sources = sources.borrow_mut();
                    let removed = sources.split_off(cursor);
                    sources.extend(buffer.iter().copied());
                    removed
                };
                for source in removed {
                    if !buffer.contains(&source) {
                        self.unsubscribe(source, listener);
                    }
                }
                if tracking {
                    for source in buffer {
                        self.subscribe(source, listener);
                    }
                }
            }
            // The run repeated a prefix of the previous sequence and then
            // stopped: everything past the cursor is no longer read.
            None => {
                let removed = {
                    let sources = self.node_sources.borrow();
                    let Some(sources) = sources.get(listener) else {
                        return;
                    };
                    let mut sources = sources.borrow_mut();
                    if cursor < sources.len() {
                        sources.split_off(cursor)
                    } else {
                        return;
                    }
                };
                for source in removed {
                    self.unsubscribe(source, listener);
                }
            }
        }
    }

    /// Adds `listener` to `source`'s subscriber set. A memo gaining its
    /// first subscriber starts tracking: it subscribes itself to its own
    /// sources so notifications can reach it.
    pub(crate) fn subscribe(&self, source: NodeId, listener: NodeId) {
        let became_first = {
            let subscribers = self.node_subscribers.borrow();
            match subscribers.get(source) {
                Some(subscribers) => {
                    let mut subscribers = subscribers.borrow_mut();
                    let was_empty = subscribers.is_empty();
                    subscribers.insert(listener) && was_empty
                }
                None => false,
            }
        };

        if became_first && self.is_memo(source) {
            if let Some(node) = self.nodes.borrow_mut().get_mut(source) {
                node.flags.insert(NodeFlags::TRACKING);
            }
            for dep in self.sources_of(source) {
                self.subscribe(dep, source);
            }
        }
    }

    /// Removes `listener` from `source`'s subscriber set. A memo losing its
    /// last subscriber stops tracking and is re-marked MAYBE_DIRTY: with no
    /// notifications arriving, its flags can no longer prove freshness, so
    /// every later read must fall back to the epoch walk.
    pub(crate) fn unsubscribe(&self, source: NodeId, listener: NodeId) {
        let became_empty = {
            let subscribers = self.node_subscribers.borrow();
            match subscribers.get(source) {
                Some(subscribers) => {
                    let mut subscribers = subscribers.borrow_mut();
                    subscribers.swap_remove(&listener) && subscribers.is_empty()
                }
                None => false,
            }
        };

        if became_empty && self.is_memo(source) {
            if let Some(node) = self.nodes.borrow_mut().get_mut(source) {
                node.flags.remove(NodeFlags::TRACKING);
                node.flags.insert(NodeFlags::MAYBE_DIRTY);
            }
            for dep in self.sources_of(source) {
                self.unsubscribe(dep, source);
            }
        }
    }

    fn sources_of(&self, node_id: NodeId) -> Vec<NodeId> {
        let sources = self.node_sources.borrow();
        sources
            .get(node_id)
            .map(|sources| sources.borrow().clone())
            .unwrap_or_default()
    }

    fn subscribers_of(&self, node_id: NodeId) -> Vec<NodeId> {
        let subscribers = self.node_subscribers.borrow();
        subscribers
            .get(node_id)
            .map(|subscribers| {
                let subscribers = subscribers.borrow();
                let mut subscribers_vec = Vec::with_capacity(subscribers.len());
                subscribers_vec.extend(subscribers.iter().copied());
                subscribers_vec
            })
            .unwrap_or_default()
    }

    fn is_memo(&self, node_id: NodeId) -> bool {
        matches!(
            self.nodes.borrow().get(node_id).map(|node| &node.node_type),
            Some(ReactiveNodeType::Memo { .. })
        )
    }
}

// Notification and the staleness walk.
impl Runtime {
    /// Marks a node stale. Memos propagate MAYBE_DIRTY (never DIRTY)
    /// downstream; effects push themselves onto the batch queue. NOTIFIED
    /// de-dups per wave, RUNNING ignores notifications caused by a node's
    /// own writes.
    pub(crate) fn notify(&self, node_id: NodeId, flag: NodeFlags) {
        let propagate = {
            let mut nodes = self.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(node_id) else {
                return;
            };
            if node.flags.intersects(
                NodeFlags::NOTIFIED | NodeFlags::RUNNING | NodeFlags::DISPOSED,
            ) {
                return;
            }
            node.flags.insert(flag | NodeFlags::NOTIFIED);
            match node.node_type {
                ReactiveNodeType::Effect { .. } => {
                    node.next_batched = self.batched_head.get();
                    self.batched_head.set(Some(node_id));
                    false
                }
                ReactiveNodeType::Memo { .. } => true,
                // Signals have no sources and are never the target of a
                // notification.
                ReactiveNodeType::Signal => false,
            }
        };

        if propagate {
            for subscriber in self.subscribers_of(node_id) {
                self.notify(subscriber, NodeFlags::MAYBE_DIRTY);
            }
        }
    }

    /// Decides whether a listener must recompute, given the flags it carried
    /// before they were cleared and the clock value of its last completed
    /// refresh.
    ///
    /// This is the load-bearing optimization: a chain of MAYBE_DIRTY
    /// propagations is discharged here without running any user function as
    /// long as the upstream change stamps haven't moved.
    pub(crate) fn is_stale(
        &self,
        node_id: NodeId,
        flags: NodeFlags,
        base_epoch: i64,
    ) -> bool {
        if flags.contains(NodeFlags::DIRTY) {
            return true;
        }
        if flags.contains(NodeFlags::MAYBE_DIRTY) {
            for source in self.sources_of(node_id) {
                let advanced = self
                    .nodes
                    .borrow()
                    .get(source)
                    .map(|node| node.value_epoch > base_epoch)
                    .unwrap_or(false);
                if advanced || self.refresh(source) {
                    return true;
                }
            }
        }
        false
    }

    /// Pull-refreshes a node, returning `true` iff its value changed.
    /// Signals are always up to date; effects are never anyone's source.
    pub(crate) fn refresh(&self, node_id: NodeId) -> bool {
        let is_memo = self.is_memo(node_id);
        if is_memo {
            self.refresh_memo(node_id)
        } else {
            false
        }
    }

    fn refresh_memo(&self, node_id: NodeId) -> bool {
        let clock = self.write_clock.get();
        let (f, value, pre_flags, prev_checked, first_run, had_error) = {
            let mut nodes = self.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(node_id) else {
                return false;
            };
            node.flags.remove(NodeFlags::NOTIFIED);
            let pre_flags = node.flags;
            // Self-reference: a memo reading itself observes its previous
            // value.
            if pre_flags.contains(NodeFlags::RUNNING) {
                return false;
            }
            // Nothing anywhere has been written since the last refresh.
            if node.checked_epoch == clock {
                return false;
            }
            // Subscribed and not notified: notifications prove freshness.
            if pre_flags.contains(NodeFlags::TRACKING)
                && !pre_flags
                    .intersects(NodeFlags::DIRTY | NodeFlags::MAYBE_DIRTY)
            {
                return false;
            }
            node.flags.remove(NodeFlags::DIRTY | NodeFlags::MAYBE_DIRTY);
            node.flags.insert(NodeFlags::RUNNING);
            let prev_checked = node.checked_epoch;
            node.checked_epoch = clock;
            let f = match &node.node_type {
                ReactiveNodeType::Memo { f } => Rc::clone(f),
                _ => {
                    node.flags.remove(NodeFlags::RUNNING);
                    return false;
                }
            };
            (
                f,
                node.value(),
                pre_flags,
                prev_checked,
                node.value_epoch == -1,
                pre_flags.contains(NodeFlags::HAS_ERROR),
            )
        };

        // Prove staleness before paying for the computation. The walk uses
        // the flags from before they were cleared and the previous refresh
        // stamp as comparison base.
        if !first_run && !self.is_stale(node_id, pre_flags, prev_checked) {
            self.settle_memo(node_id);
            return false;
        }

        let scope = self.begin_run(node_id);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f.run(value)));
        self.finish_run(node_id, scope);

        let changed = {
            let mut nodes = self.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(node_id) else {
                return false;
            };
            match outcome {
                Ok(value_changed) => {
                    let changed = value_changed || had_error;
                    if changed || first_run {
                        node.flags.remove(NodeFlags::HAS_ERROR);
                        node.error = None;
                        let stamp = self.write_clock.get() + 1;
                        self.write_clock.set(stamp);
                        node.value_epoch = stamp;
                        node.checked_epoch = stamp;
                    }
                    changed
                }
                Err(payload) => {
                    node.flags.insert(NodeFlags::HAS_ERROR);
                    node.error = Some(CachedPanic::new(&*payload));
                    let stamp = self.write_clock.get() + 1;
                    self.write_clock.set(stamp);
                    node.value_epoch = stamp;
                    node.checked_epoch = stamp;
                    true
                }
            }
        };

        self.settle_memo(node_id);
        changed
    }

    // Clears RUNNING; an untracked memo goes back to MAYBE_DIRTY so its next
    // read re-walks the sources instead of trusting unmaintained flags.
    fn settle_memo(&self, node_id: NodeId) {
        let mut nodes = self.nodes.borrow_mut();
        if let Some(node) = nodes.get_mut(node_id) {
            node.flags.remove(NodeFlags::RUNNING);
            if !node.flags.contains(NodeFlags::TRACKING) {
                node.flags.insert(NodeFlags::MAYBE_DIRTY);
            }
        }
    }

    /// Re-raises the cached panic of a poisoned memo.
    pub(crate) fn raise_if_poisoned(&self, node_id: NodeId) {
        let error = {
            let nodes = self.nodes.borrow();
            nodes.get(node_id).and_then(|node| {
                if node.flags.contains(NodeFlags::HAS_ERROR) {
                    node.error.clone()
                } else {
                    None
                }
            })
        };
        if let Some(error) = error {
            panic::resume_unwind(Box::new(error));
        }
    }
}

// Writes and the batch scheduler.
impl Runtime {
    /// Stamps a signal whose value just changed and notifies its
    /// subscribers inside a batch scope, so the outermost write drains the
    /// queue on exit.
    pub(crate) fn mark_signal_write(&self, node_id: NodeId) {
        let stamp = self.write_clock.get() + 1;
        self.write_clock.set(stamp);
        if let Some(node) = self.nodes.borrow_mut().get_mut(node_id) {
            node.value_epoch = stamp;
        }

        if self.batch_iteration.get() >= self.max_batch_iterations.get() {
            debug_warn!(
                "reactive write loop exceeded {} batch iterations; \
                 suppressing further notifications for this drain",
                self.max_batch_iterations.get()
            );
            return;
        }

        self.enter_batch();
        for subscriber in self.subscribers_of(node_id) {
            self.notify(subscriber, NodeFlags::DIRTY);
        }
        self.exit_batch();
    }

    pub(crate) fn enter_batch(&self) {
        self.batch_depth.set(self.batch_depth.get() + 1);
    }

    /// Leaves a batch scope. The outermost exit owns the drain: it takes
    /// queue waves until no effect re-enqueues, running each notified
    /// effect in link order (reverse notification order), coalescing panics
    /// down to the first one, which is re-raised once the drain completes.
    pub(crate) fn exit_batch(&self) {
        let depth = self.batch_depth.get();
        if depth > 1 {
            self.batch_depth.set(depth - 1);
            return;
        }

        let mut first_error: Option<Box<dyn Any + Send>> = None;

        loop {
            let Some(head) = self.batched_head.take() else {
                break;
            };
            self.batch_iteration.set(self.batch_iteration.get() + 1);

            let mut cursor = Some(head);
            while let Some(effect_id) = cursor {
                let (next, flags, checked_epoch) = {
                    let mut nodes = self.nodes.borrow_mut();
                    match nodes.get_mut(effect_id) {
                        Some(node) => {
                            node.flags.remove(NodeFlags::NOTIFIED);
                            (
                                node.next_batched.take(),
                                node.flags,
                                node.checked_epoch,
                            )
                        }
                        None => (None, NodeFlags::DISPOSED, -1),
                    }
                };
                cursor = next;

                if flags.contains(NodeFlags::DISPOSED) {
                    continue;
                }

                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    if self.is_stale(effect_id, flags, checked_epoch) {
                        self.run_effect(effect_id);
                    }
                }));
                if let Err(payload) = result {
                    first_error.get_or_insert(payload);
                }
            }
        }

        self.batch_iteration.set(0);
        self.batch_depth.set(0);
        if let Some(payload) = first_error {
            panic::resume_unwind(payload);
        }
    }
}

// Effect execution, cleanup, and disposal.
impl Runtime {
    /// Re-runs an effect unconditionally; staleness has already been judged
    /// by the caller. Pending cleanups fire first, then the body runs under
    /// a fresh tracking scope, inside a nested batch scope so the effect's
    /// own writes coalesce into the surrounding drain.
    pub(crate) fn run_effect(&self, node_id: NodeId) {
        self.enter_batch();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            {
                let mut nodes = self.nodes.borrow_mut();
                let Some(node) = nodes.get_mut(node_id) else {
                    return;
                };
                node.flags
                    .remove(NodeFlags::DIRTY | NodeFlags::MAYBE_DIRTY);
                node.flags.insert(NodeFlags::RUNNING);
            }

            self.run_cleanups(node_id);

            let Some((f, value)) = ({
                let nodes = self.nodes.borrow();
                nodes.get(node_id).and_then(|node| match &node.node_type {
                    ReactiveNodeType::Effect { f } => {
                        Some((Rc::clone(f), node.value()))
                    }
                    _ => None,
                })
            }) else {
                return;
            };

            let scope = self.begin_run(node_id);
            let body = panic::catch_unwind(AssertUnwindSafe(|| f.run(value)));
            self.finish_run(node_id, scope);
            if let Err(payload) = body {
                panic::resume_unwind(payload);
            }
        }));

        let dispose_requested = {
            let mut nodes = self.nodes.borrow_mut();
            match nodes.get_mut(node_id) {
                Some(node) => {
                    node.checked_epoch = self.write_clock.get();
                    node.flags.remove(NodeFlags::RUNNING);
                    node.flags.contains(NodeFlags::DISPOSED)
                }
                None => false,
            }
        };
        if dispose_requested {
            self.complete_dispose(node_id);
        }

        self.exit_batch();
        if let Err(payload) = result {
            panic::resume_unwind(payload);
        }
    }

    /// Runs an effect's pending cleanups in registration order, with the
    /// listener cleared and inside a batch scope. A panicking cleanup does
    /// not stop the rest; it disposes the effect and the first payload is
    /// re-raised once all have run.
    pub(crate) fn run_cleanups(&self, node_id: NodeId) {
        let cleanups = self
            .node_cleanups
            .borrow_mut()
            .remove(node_id)
            .unwrap_or_default();
        if cleanups.is_empty() {
            return;
        }

        self.enter_batch();
        let prev_observer = self.observer.take();
        let mut first_error: Option<Box<dyn Any + Send>> = None;
        for cleanup in cleanups {
            if let Err(payload) =
                panic::catch_unwind(AssertUnwindSafe(cleanup))
            {
                first_error.get_or_insert(payload);
            }
        }
        self.observer.set(prev_observer);
        self.exit_batch();

        if let Some(payload) = first_error {
            if let Some(node) = self.nodes.borrow_mut().get_mut(node_id) {
                node.flags.insert(NodeFlags::DISPOSED);
            }
            self.complete_dispose(node_id);
            panic::resume_unwind(payload);
        }
    }

    /// Unsubscribes a disposed effect from every source and runs whatever
    /// cleanups are still pending. Idempotent: sources and cleanups are
    /// taken, so a second pass is a no-op.
    pub(crate) fn complete_dispose(&self, node_id: NodeId) {
        let sources = {
            let sources = self.node_sources.borrow();
            match sources.get(node_id) {
                Some(sources) => std::mem::take(&mut *sources.borrow_mut()),
                None => Vec::new(),
            }
        };
        for source in sources {
            self.unsubscribe(source, node_id);
        }
        self.run_cleanups(node_id);
    }
}

// Node creation and value access.
impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn current() -> RuntimeId {
        CURRENT_RUNTIME.with(|current| current.get()).expect(
            "tried to use the reactive system, but no runtime is active on \
             this thread; call `create_runtime()` first",
        )
    }

    fn insert_node(
        &self,
        value: Option<Rc<RefCell<dyn Any>>>,
        flags: NodeFlags,
        node_type: ReactiveNodeType,
    ) -> NodeId {
        let id = self
            .nodes
            .borrow_mut()
            .insert(ReactiveNode::new(value, flags, node_type));
        self.node_subscribers
            .borrow_mut()
            .insert(id, Default::default());
        self.node_sources.borrow_mut().insert(id, Default::default());
        id
    }

    pub(crate) fn get_value(
        &self,
        node_id: NodeId,
    ) -> Option<Rc<RefCell<dyn Any>>> {
        let nodes = self.nodes.borrow();
        nodes.get(node_id).map(|node| node.value())
    }
}

impl Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("observer", &self.observer)
            .field("write_clock", &self.write_clock)
            .field("read_clock", &self.read_clock)
            .field("batch_depth", &self.batch_depth)
            .finish()
    }
}

/// The tracking context saved around a listener run.
pub(crate) struct TrackingScope {
    observer: Option<NodeId>,
    new_sources: Option<Vec<NodeId>>,
    source_index: usize,
}

/// Runs `f` against the runtime identified by `id`, if it still exists.
#[inline(always)] // it monomorphizes anyway
pub(crate) fn with_runtime<T>(
    id: RuntimeId,
    f: impl FnOnce(&Runtime) -> T,
) -> Result<T, ()> {
    RUNTIMES.with(|runtimes| {
        let runtimes = runtimes.borrow();
        match runtimes.get(id) {
            None => Err(()),
            Some(runtime) => Ok(f(runtime)),
        }
    })
}

/// Creates a new reactive [`Runtime`] and makes it the active runtime for
/// this thread.
///
/// All signals, memos, and effects live inside some runtime; disposing the
/// runtime drops the whole graph at once, which is also what makes
/// independent test cases possible.
#[must_use = "Runtime will leak memory if Runtime::dispose() is never called"]
pub fn create_runtime() -> RuntimeId {
    RUNTIMES.with(|runtimes| {
        let id = runtimes.borrow_mut().insert(Runtime::new());
        CURRENT_RUNTIME.with(|current| current.set(Some(id)));
        id
    })
}

slotmap::new_key_type! {
    /// Unique ID assigned to a [`Runtime`].
    pub struct RuntimeId;
}

impl RuntimeId {
    /// Removes the runtime and everything it owns.
    pub fn dispose(self) {
        let runtime = RUNTIMES
            .with(|runtimes| runtimes.borrow_mut().remove(self))
            .expect(
                "tried to dispose a reactive runtime that was not found; it \
                 may already have been disposed",
            );
        CURRENT_RUNTIME.with(|current| {
            if current.get() == Some(self) {
                current.set(None);
            }
        });
        drop(runtime);
    }

    /// Overrides [`DEFAULT_MAX_BATCH_ITERATIONS`] for this runtime.
    pub fn set_max_batch_iterations(self, max: usize) {
        _ = with_runtime(self, |runtime| {
            runtime.max_batch_iterations.set(max);
        });
    }

    /// Executes `f` with the current listener cleared, so reads inside do
    /// not subscribe the surrounding effect or memo.
    #[cfg_attr(
        debug_assertions,
        instrument(level = "trace", skip_all,)
    )]
    #[inline(always)]
    pub fn untrack<T>(self, f: impl FnOnce() -> T) -> T {
        with_runtime(self, |runtime| {
            let prev_observer =
                SetObserverOnDrop(self, runtime.observer.take());

            let untracked_result = f();

            runtime.observer.set(prev_observer.1);
            std::mem::forget(prev_observer); // avoid Drop

            untracked_result
        })
        .expect(
            "tried to run an untracked function in a runtime that has been \
             disposed",
        )
    }

    /// Batches any reactive writes inside `f`, preventing effects from
    /// running until the outermost batch exits. Nested calls only track
    /// depth.
    #[cfg_attr(
        debug_assertions,
        instrument(level = "trace", skip_all,)
    )]
    #[inline(always)]
    pub fn batch<T>(self, f: impl FnOnce() -> T) -> T {
        with_runtime(self, |runtime| {
            runtime.enter_batch();
            let depth = LeaveBatchOnDrop(self);

            let value = f();

            std::mem::forget(depth);
            runtime.exit_batch();
            value
        })
        .expect(
            "tried to run a batched update in a runtime that has been \
             disposed",
        )
    }

    #[track_caller]
    #[inline(always)]
    pub(crate) fn create_signal<T>(
        self,
        value: T,
    ) -> (ReadSignal<T>, WriteSignal<T>)
    where
        T: Any + 'static,
    {
        let id = self.create_concrete_signal(
            Rc::new(RefCell::new(value)) as Rc<RefCell<dyn Any>>
        );

        (
            ReadSignal {
                runtime: self,
                id,
                ty: PhantomData,
                #[cfg(debug_assertions)]
                defined_at: std::panic::Location::caller(),
            },
            WriteSignal {
                runtime: self,
                id,
                ty: PhantomData,
                #[cfg(debug_assertions)]
                defined_at: std::panic::Location::caller(),
            },
        )
    }

    #[track_caller]
    #[inline(always)]
    pub(crate) fn create_rw_signal<T>(self, value: T) -> RwSignal<T>
    where
        T: Any + 'static,
    {
        let id = self.create_concrete_signal(
            Rc::new(RefCell::new(value)) as Rc<RefCell<dyn Any>>
        );
        RwSignal {
            runtime: self,
            id,
            ty: PhantomData,
            #[cfg(debug_assertions)]
            defined_at: std::panic::Location::caller(),
        }
    }

    pub(crate) fn create_concrete_signal(
        self,
        value: Rc<RefCell<dyn Any>>,
    ) -> NodeId {
        with_runtime(self, |runtime| {
            runtime.insert_node(
                Some(value),
                NodeFlags::empty(),
                ReactiveNodeType::Signal,
            )
        })
        .expect("tried to create a signal in a runtime that has been disposed")
    }

    #[track_caller]
    #[inline(always)]
    pub(crate) fn create_memo<T>(
        self,
        initial: Option<T>,
        f: impl Fn(Option<&T>) -> T + 'static,
    ) -> Memo<T>
    where
        T: PartialEq + 'static,
    {
        Memo {
            runtime: self,
            id: self.create_concrete_memo(
                Rc::new(RefCell::new(initial)),
                Rc::new(MemoState {
                    f,
                    t: PhantomData,
                    #[cfg(debug_assertions)]
                    defined_at: std::panic::Location::caller(),
                }),
            ),
            ty: PhantomData,
            #[cfg(debug_assertions)]
            defined_at: std::panic::Location::caller(),
        }
    }

    pub(crate) fn create_concrete_memo(
        self,
        value: Rc<RefCell<dyn Any>>,
        computation: Rc<dyn AnyComputation>,
    ) -> NodeId {
        with_runtime(self, |runtime| {
            runtime.insert_node(
                Some(value),
                // memos are lazy, so are born stale; the first read runs them
                NodeFlags::MAYBE_DIRTY,
                ReactiveNodeType::Memo { f: computation },
            )
        })
        .expect("tried to create a memo in a runtime that has been disposed")
    }

    #[track_caller]
    #[inline(always)]
    pub(crate) fn create_effect<T>(
        self,
        initial: Option<T>,
        f: impl Fn(Option<T>) -> T + 'static,
    ) -> Effect<T>
    where
        T: Any + 'static,
    {
        let id = self.create_concrete_effect(
            Rc::new(RefCell::new(initial)),
            Rc::new(EffectState {
                f,
                ty: PhantomData,
                #[cfg(debug_assertions)]
                defined_at: std::panic::Location::caller(),
            }),
        );
        Effect {
            runtime: self,
            id,
            ty: PhantomData,
            #[cfg(debug_assertions)]
            defined_at: std::panic::Location::caller(),
        }
    }

    pub(crate) fn create_concrete_effect(
        self,
        value: Rc<RefCell<dyn Any>>,
        effect: Rc<dyn AnyComputation>,
    ) -> NodeId {
        let id = with_runtime(self, |runtime| {
            runtime.insert_node(
                Some(value),
                // effects hold live subscriptions from birth to disposal
                NodeFlags::TRACKING,
                ReactiveNodeType::Effect { f: effect },
            )
        })
        .expect(
            "tried to create an effect in a runtime that has been disposed",
        );

        // run the effect for the first time; a panicking first run disposes
        // the effect before the payload continues
        let first_run = panic::catch_unwind(AssertUnwindSafe(|| {
            _ = with_runtime(self, |runtime| runtime.run_effect(id));
        }));
        if let Err(payload) = first_run {
            _ = with_runtime(self, |runtime| {
                if let Some(node) = runtime.nodes.borrow_mut().get_mut(id) {
                    node.flags.insert(NodeFlags::DISPOSED);
                }
                runtime.complete_dispose(id);
            });
            panic::resume_unwind(payload);
        }

        id
    }
}

struct SetObserverOnDrop(RuntimeId, Option<NodeId>);

impl Drop for SetObserverOnDrop {
    fn drop(&mut self) {
        _ = with_runtime(self.0, |rt| {
            rt.observer.set(self.1);
        });
    }
}

struct LeaveBatchOnDrop(RuntimeId);

impl Drop for LeaveBatchOnDrop {
    fn drop(&mut self) {
        // a panic is unwinding through the batch: drop the depth without
        // draining, so the queue survives for the next outermost exit
        _ = with_runtime(self.0, |rt| {
            rt.batch_depth.set(rt.batch_depth.get().saturating_sub(1));
        });
    }
}

/// Executes `f` with the current listener cleared and returns its result.
///
/// Any signal or memo read inside `f` does not subscribe the surrounding
/// effect or memo.
///
/// ```
/// # use reactive_cells::*;
/// # use std::{cell::Cell, rc::Rc};
/// # let runtime = create_runtime();
/// let (a, set_a) = create_signal(1);
/// let (b, set_b) = create_signal(10);
/// let last = Rc::new(Cell::new(0));
/// create_effect({
///     let last = Rc::clone(&last);
///     // changes to `a` re-run this effect; changes to `b` do not
///     move |_| last.set(a.get() + untrack(move || b.get()))
/// });
/// set_b.set(20); // no re-run
/// assert_eq!(last.get(), 11);
/// set_a.set(2); // re-runs and observes b == 20
/// assert_eq!(last.get(), 22);
/// # runtime.dispose();
/// ```
pub fn untrack<T>(f: impl FnOnce() -> T) -> T {
    Runtime::current().untrack(f)
}

/// Batches reactive writes: effects notified inside `f` run once, after the
/// outermost batch exits, observing the final values of all writes.
///
/// Nested `batch` calls are flattened into the outermost one. The return
/// value of `f` is passed through.
///
/// ```
/// # use reactive_cells::*;
/// # let runtime = create_runtime();
/// let (a, set_a) = create_signal(1);
/// let (b, set_b) = create_signal(2);
/// create_effect(move |_| {
///     // runs once for both writes below
///     let _sum = a.get() + b.get();
/// });
/// batch(move || {
///     set_a.set(10);
///     set_b.set(20);
/// });
/// # runtime.dispose();
/// ```
pub fn batch<T>(f: impl FnOnce() -> T) -> T {
    Runtime::current().batch(f)
}

/// Whether a listener is currently capturing dependencies.
///
/// `true` inside the body of an effect or memo (and `false` again inside
/// [`untrack`]). Lazy layers built on top of the graph use this to decide
/// whether allocating a signal for a read is worthwhile at all.
pub fn is_tracking() -> bool {
    CURRENT_RUNTIME
        .with(|current| current.get())
        .and_then(|id| {
            with_runtime(id, |runtime| runtime.observer.get().is_some()).ok()
        })
        .unwrap_or(false)
}
