#![forbid(unsafe_code)]
use crate::{
    node::{NodeFlags, NodeId, ReactiveNodeType},
    runtime::{with_runtime, Runtime, RuntimeId, CURRENT_RUNTIME},
};
use std::{any::Any, cell::RefCell, fmt, marker::PhantomData, rc::Rc};
use thiserror::Error;

/// Effects run a chunk of code whenever the signals they depend on change.
///
/// [`create_effect`] immediately runs the given function once, tracks every
/// signal and memo read within it, and re-runs the function whenever one of
/// those dependencies changes. Dependencies are re-captured on every run,
/// so an effect whose control flow changes only re-runs for the branch it
/// actually took last.
///
/// The effect function is called with whatever value it returned the last
/// time it ran (`None` on the initial run).
///
/// Effects are for side effects at the edge of the system: don't write to
/// signals inside effects if a [memo](crate::create_memo) can express the
/// derivation instead.
///
/// ```
/// # use reactive_cells::*;
/// # let runtime = create_runtime();
/// let (a, set_a) = create_signal(0);
///
/// create_effect(move |_| {
///     // immediately prints "Value: 0" and subscribes to `a`
///     println!("Value: {}", a.get());
/// });
///
/// // because the effect is subscribed to `a`, it re-runs, printing "Value: 1"
/// set_a.set(1);
/// # runtime.dispose();
/// ```
#[track_caller]
pub fn create_effect<T>(f: impl Fn(Option<T>) -> T + 'static) -> Effect<T>
where
    T: 'static,
{
    Runtime::current().create_effect(None, f)
}

/// Like [`create_effect`], but seeds the previous value for the first run,
/// so the effect function always receives `Some`.
#[track_caller]
pub fn create_effect_with_initial<T>(
    initial: T,
    f: impl Fn(Option<T>) -> T + 'static,
) -> Effect<T>
where
    T: 'static,
{
    Runtime::current().create_effect(Some(initial), f)
}

/// A handle to a running effect. See [`create_effect`].
///
/// The handle is only needed to [dispose](Effect::dispose) of the effect;
/// dropping it leaves the effect running.
pub struct Effect<T>
where
    T: 'static,
{
    pub(crate) runtime: RuntimeId,
    pub(crate) id: NodeId,
    pub(crate) ty: PhantomData<T>,
    #[cfg(debug_assertions)]
    #[allow(dead_code)]
    pub(crate) defined_at: &'static std::panic::Location<'static>,
}

impl<T> Clone for Effect<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Effect<T> {}

impl<T> fmt::Debug for Effect<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("runtime", &self.runtime)
            .field("id", &self.id)
            .finish()
    }
}

impl<T> Effect<T> {
    /// Stops the effect: it is unsubscribed from every dependency, its
    /// pending cleanups run, and it never executes again.
    ///
    /// Disposing an effect from within its own body defers the teardown
    /// until the current run returns.
    pub fn dispose(self) {
        _ = with_runtime(self.runtime, |runtime| {
            let running = {
                let mut nodes = runtime.nodes.borrow_mut();
                match nodes.get_mut(self.id) {
                    Some(node) => {
                        node.flags.insert(NodeFlags::DISPOSED);
                        node.flags.contains(NodeFlags::RUNNING)
                    }
                    None => true,
                }
            };
            if !running {
                runtime.complete_dispose(self.id);
            }
        });
    }

    /// The last value returned by the effect function, if any.
    pub fn last_value(&self) -> Option<T>
    where
        T: Clone,
    {
        with_runtime(self.runtime, |runtime| {
            let value = runtime.get_value(self.id)?;
            let value = value.borrow();
            value.downcast_ref::<Option<T>>().cloned().flatten()
        })
        .ok()
        .flatten()
    }
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("cleanup callbacks can only be registered inside a running effect")]
    NotInEffect,
}

/// Registers `cleanup_fn` on the currently-running effect.
///
/// Cleanups run before the effect's next run and when the effect is
/// disposed, in registration order, with the current listener cleared so
/// reads inside a cleanup never subscribe anything.
///
/// # Panics
/// Panics if called outside a running effect; use [`try_on_cleanup`] to
/// discard the callback silently instead.
///
/// ```
/// # use reactive_cells::*;
/// # let runtime = create_runtime();
/// let (s, set_s) = create_signal(1);
/// create_effect(move |_| {
///     let value = s.get();
///     on_cleanup(move || println!("leaving run for {value}"));
/// });
/// set_s.set(2); // prints "leaving run for 1" before the new run
/// # runtime.dispose();
/// ```
#[track_caller]
pub fn on_cleanup(cleanup_fn: impl FnOnce() + 'static) {
    if let Err(err) = try_on_cleanup(cleanup_fn) {
        panic!("{err}");
    }
}

/// Registers `cleanup_fn` on the currently-running effect, or returns an
/// error (discarding the callback) when no effect is running.
pub fn try_on_cleanup(
    cleanup_fn: impl FnOnce() + 'static,
) -> Result<(), CleanupError> {
    let Some(id) = CURRENT_RUNTIME.with(|current| current.get()) else {
        return Err(CleanupError::NotInEffect);
    };
    with_runtime(id, |runtime| {
        let Some(observer) = runtime.observer.get() else {
            return Err(CleanupError::NotInEffect);
        };
        let is_effect = matches!(
            runtime
                .nodes
                .borrow()
                .get(observer)
                .map(|node| &node.node_type),
            Some(ReactiveNodeType::Effect { .. })
        );
        if !is_effect {
            return Err(CleanupError::NotInEffect);
        }
        let mut cleanups = runtime.node_cleanups.borrow_mut();
        if let Some(list) = cleanups.get_mut(observer) {
            list.push(Box::new(cleanup_fn));
        } else {
            cleanups.insert(observer, vec![Box::new(cleanup_fn)]);
        }
        Ok(())
    })
    .unwrap_or(Err(CleanupError::NotInEffect))
}

pub(crate) struct EffectState<T, F>
where
    T: 'static,
    F: Fn(Option<T>) -> T,
{
    pub(crate) f: F,
    pub(crate) ty: PhantomData<T>,
    #[cfg(debug_assertions)]
    #[allow(dead_code)]
    pub(crate) defined_at: &'static std::panic::Location<'static>,
}

pub(crate) trait AnyComputation {
    fn run(&self, value: Rc<RefCell<dyn Any>>) -> bool;
}

impl<T, F> AnyComputation for EffectState<T, F>
where
    T: 'static,
    F: Fn(Option<T>) -> T,
{
    fn run(&self, value: Rc<RefCell<dyn Any>>) -> bool {
        // we take and release the BorrowMut twice here in case a write
        // during the effect body needs the cell back before we store
        let curr_value = {
            let mut value = value.borrow_mut();
            let value = value
                .downcast_mut::<Option<T>>()
                .expect("to downcast effect value");
            value.take()
        };

        let new_value = (self.f)(curr_value);

        let mut value = value.borrow_mut();
        let value = value
            .downcast_mut::<Option<T>>()
            .expect("to downcast effect value");
        *value = Some(new_value);

        true
    }
}
