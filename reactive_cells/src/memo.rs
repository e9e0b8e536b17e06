#![forbid(unsafe_code)]
use crate::{
    node::NodeId,
    runtime::{with_runtime, Runtime, RuntimeId},
    AnyComputation, SignalError, SignalGet, SignalGetUntracked, SignalWith,
    SignalWithUntracked,
};
use std::{any::Any, cell::RefCell, fmt, marker::PhantomData, rc::Rc};

/// Creates an efficient derived reactive value based on other reactive
/// values.
///
/// Unlike a plain closure over signals, a memo comes with two guarantees:
/// 1. It runs at most once per change, no matter how many times its value
///    is read.
/// 2. It notifies its dependents only if the value of the computation
///    actually changes.
///
/// Memos are lazy: the computation does not run until the first read, and a
/// memo nobody subscribes to costs nothing when its sources change. The
/// next read proves staleness by comparing change stamps before deciding to
/// recompute.
///
/// The argument to the memo function is the previous value, `None` for the
/// initial calculation.
///
/// ```
/// # use reactive_cells::*;
/// # let runtime = create_runtime();
/// let (value, set_value) = create_signal(2);
/// let doubled = create_memo(move |_| value.get() * 2);
///
/// assert_eq!(doubled.get(), 4);
/// set_value.set(5);
/// assert_eq!(doubled.get(), 10);
/// # runtime.dispose();
/// ```
#[track_caller]
pub fn create_memo<T>(f: impl Fn(Option<&T>) -> T + 'static) -> Memo<T>
where
    T: PartialEq + 'static,
{
    Runtime::current().create_memo(None, f)
}

/// Like [`create_memo`], but seeds the previous value for the first run,
/// so the computation always receives `Some`.
#[track_caller]
pub fn create_memo_with_initial<T>(
    initial: T,
    f: impl Fn(Option<&T>) -> T + 'static,
) -> Memo<T>
where
    T: PartialEq + 'static,
{
    Runtime::current().create_memo(Some(initial), f)
}

/// A cached derivation of other reactive values. See [`create_memo`].
///
/// If the computation panicked, every read re-raises a
/// [`CachedPanic`](crate::CachedPanic) until the computation next succeeds.
pub struct Memo<T>
where
    T: 'static,
{
    pub(crate) runtime: RuntimeId,
    pub(crate) id: NodeId,
    pub(crate) ty: PhantomData<T>,
    #[cfg(debug_assertions)]
    pub(crate) defined_at: &'static std::panic::Location<'static>,
}

impl<T> Clone for Memo<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Memo<T> {}

impl<T> fmt::Debug for Memo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memo")
            .field("runtime", &self.runtime)
            .field("id", &self.id)
            .finish()
    }
}

impl<T> PartialEq for Memo<T> {
    fn eq(&self, other: &Self) -> bool {
        self.runtime == other.runtime && self.id == other.id
    }
}

impl<T> Eq for Memo<T> {}

impl<T> Memo<T>
where
    T: 'static,
{
    // Every read refreshes first. The dependency is recorded *before* the
    // refresh, so a listener stays subscribed to a memo whose computation
    // panicked and re-runs once it recovers.
    fn try_read<O>(
        &self,
        f: impl FnOnce(&T) -> O,
        track: bool,
    ) -> Result<O, SignalError> {
        with_runtime(self.runtime, |runtime| {
            if track {
                runtime.track_dependency(self.id);
            }
            runtime.refresh(self.id);
            runtime.raise_if_poisoned(self.id);
            let value =
                runtime.get_value(self.id).ok_or(SignalError::Disposed)?;
            let value = value.borrow();
            let value = value
                .downcast_ref::<Option<T>>()
                .expect("to downcast memo value");
            Ok(f(value
                .as_ref()
                .expect("memo to hold a value after refresh")))
        })
        .map_err(|_| SignalError::RuntimeDisposed)?
    }
}

impl<T: Clone> SignalGet<T> for Memo<T> {
    #[cfg_attr(
        debug_assertions,
        instrument(
            name = "Memo::get()",
            level = "trace",
            skip_all,
            fields(
                id = ?self.id,
                defined_at = %self.defined_at,
                ty = %std::any::type_name::<T>()
            )
        )
    )]
    fn get(&self) -> T {
        self.try_read(T::clone, true)
            .expect("tried to access a memo in a runtime that has been disposed")
    }

    fn try_get(&self) -> Option<T> {
        self.try_read(T::clone, true).ok()
    }
}

impl<T> SignalWith<T> for Memo<T> {
    fn with<O>(&self, f: impl FnOnce(&T) -> O) -> O {
        self.try_read(f, true)
            .expect("tried to access a memo in a runtime that has been disposed")
    }

    fn try_with<O>(&self, f: impl FnOnce(&T) -> O) -> Option<O> {
        self.try_read(f, true).ok()
    }
}

impl<T: Clone> SignalGetUntracked<T> for Memo<T> {
    /// An untracked memo read still refreshes the cached value; it only
    /// skips subscribing the running listener.
    fn get_untracked(&self) -> T {
        self.try_read(T::clone, false)
            .expect("tried to access a memo in a runtime that has been disposed")
    }

    fn try_get_untracked(&self) -> Option<T> {
        self.try_read(T::clone, false).ok()
    }
}

impl<T> SignalWithUntracked<T> for Memo<T> {
    fn with_untracked<O>(&self, f: impl FnOnce(&T) -> O) -> O {
        self.try_read(f, false)
            .expect("tried to access a memo in a runtime that has been disposed")
    }

    fn try_with_untracked<O>(&self, f: impl FnOnce(&T) -> O) -> Option<O> {
        self.try_read(f, false).ok()
    }
}

pub(crate) struct MemoState<T, F>
where
    T: PartialEq + 'static,
    F: Fn(Option<&T>) -> T,
{
    pub f: F,
    pub t: PhantomData<T>,
    #[cfg(debug_assertions)]
    #[allow(dead_code)]
    pub defined_at: &'static std::panic::Location<'static>,
}

impl<T, F> AnyComputation for MemoState<T, F>
where
    T: PartialEq + 'static,
    F: Fn(Option<&T>) -> T,
{
    fn run(&self, value: Rc<RefCell<dyn Any>>) -> bool {
        let (new_value, changed) = {
            // the shared borrow is held across the computation; a memo that
            // reads itself takes the same borrow immutably and observes its
            // previous value
            let value = value.borrow();
            let curr_value = value
                .downcast_ref::<Option<T>>()
                .expect("to downcast memo value");

            let new_value = (self.f)(curr_value.as_ref());
            let changed = curr_value.as_ref() != Some(&new_value);
            (new_value, changed)
        };

        if changed {
            let mut value = value.borrow_mut();
            let value = value
                .downcast_mut::<Option<T>>()
                .expect("to downcast memo value");
            *value = Some(new_value);
        }

        changed
    }
}
