#![forbid(unsafe_code)]
use crate::{
    node::NodeId,
    runtime::{with_runtime, Runtime, RuntimeId},
};
use std::{fmt, marker::PhantomData};
use thiserror::Error;

/// Creates a signal, the basic reactive primitive.
///
/// A signal is a piece of data that may change over time and notifies other
/// code when it has changed. Returns a ([`ReadSignal`], [`WriteSignal`])
/// pair.
///
/// Writes through [`SignalSet::set`] compare with `PartialEq` and are
/// no-ops when the value is unchanged. [`SignalUpdate::update`] mutates in
/// place and cannot compare, so it always notifies.
///
/// ```
/// # use reactive_cells::*;
/// # let runtime = create_runtime();
/// let (count, set_count) = create_signal(0);
///
/// assert_eq!(count.get(), 0);
///
/// set_count.set(1);
/// assert_eq!(count.get(), 1);
///
/// // update() mutates in place
/// set_count.update(|count| *count += 1);
/// assert_eq!(count.get(), 2);
/// # runtime.dispose();
/// ```
#[track_caller]
pub fn create_signal<T>(value: T) -> (ReadSignal<T>, WriteSignal<T>)
where
    T: 'static,
{
    Runtime::current().create_signal(value)
}

/// Creates a signal without the read/write segregation of
/// [`create_signal`]: the returned [`RwSignal`] reads and writes through a
/// single handle.
#[track_caller]
pub fn create_rw_signal<T>(value: T) -> RwSignal<T>
where
    T: 'static,
{
    Runtime::current().create_rw_signal(value)
}

/// This trait allows getting an owned value of the signal's inner type.
pub trait SignalGet<T> {
    /// Clones and returns the current value, subscribing the running
    /// listener to this signal.
    ///
    /// # Panics
    /// Panics if the signal's runtime has been disposed.
    #[track_caller]
    fn get(&self) -> T;

    /// Clones and returns the current value, returning [`Some`] if the
    /// signal is still alive, and [`None`] otherwise.
    fn try_get(&self) -> Option<T>;
}

/// This trait allows obtaining an immutable reference to the signal's
/// inner type.
pub trait SignalWith<T> {
    /// Applies a function to the current value, subscribing the running
    /// listener to this signal.
    ///
    /// # Panics
    /// Panics if the signal's runtime has been disposed.
    #[track_caller]
    fn with<O>(&self, f: impl FnOnce(&T) -> O) -> O;

    /// Applies a function to the current value. Returns [`Some`] if the
    /// signal is valid and the function ran, otherwise [`None`].
    fn try_with<O>(&self, f: impl FnOnce(&T) -> O) -> Option<O>;
}

/// This trait allows setting the value of a signal.
pub trait SignalSet<T> {
    /// Sets the signal's value. If the new value is equal to the current
    /// one the write is a no-op; otherwise subscribers are notified.
    #[track_caller]
    fn set(&self, new_value: T);

    /// Sets the signal's value. Returns [`None`] if the signal was alive,
    /// and gives `new_value` back as [`Some`] otherwise.
    fn try_set(&self, new_value: T) -> Option<T>;
}

/// This trait allows updating the inner value of a signal in place.
pub trait SignalUpdate<T> {
    /// Applies a function to the current value to mutate it in place and
    /// notifies subscribers.
    ///
    /// **Note:** `update()` cannot compare the old and new values, so it
    /// always counts as a change, even if the closure left the value
    /// untouched.
    #[track_caller]
    fn update(&self, f: impl FnOnce(&mut T));

    /// Applies a function to the current value to mutate it in place and
    /// notifies subscribers, returning what the closure returned; [`None`]
    /// if the signal is no longer valid.
    fn try_update<O>(&self, f: impl FnOnce(&mut T) -> O) -> Option<O>;
}

/// Untracked variant of [`SignalGet`]: reads without subscribing the
/// running listener.
pub trait SignalGetUntracked<T> {
    /// Clones and returns the current value without recording a
    /// dependency.
    ///
    /// # Panics
    /// Panics if the signal's runtime has been disposed.
    #[track_caller]
    fn get_untracked(&self) -> T;

    /// Clones and returns the current value without recording a
    /// dependency, if the signal is still alive.
    fn try_get_untracked(&self) -> Option<T>;
}

/// Untracked variant of [`SignalWith`].
pub trait SignalWithUntracked<T> {
    /// Applies a function to the current value without recording a
    /// dependency.
    ///
    /// # Panics
    /// Panics if the signal's runtime has been disposed.
    #[track_caller]
    fn with_untracked<O>(&self, f: impl FnOnce(&T) -> O) -> O;

    /// Applies a function to the current value without recording a
    /// dependency, if the signal is still alive.
    fn try_with_untracked<O>(&self, f: impl FnOnce(&T) -> O) -> Option<O>;
}

/// Untracked variant of [`SignalSet`]: writes without stamping the write
/// clock or notifying dependents, so the change is invisible to the graph.
pub trait SignalSetUntracked<T> {
    /// Sets the signal's value without notifying dependents.
    #[track_caller]
    fn set_untracked(&self, new_value: T);

    /// Sets the signal's value without notifying dependents. Returns
    /// [`None`] if the signal was alive, [`Some(new_value)`] otherwise.
    fn try_set_untracked(&self, new_value: T) -> Option<T>;
}

/// Untracked variant of [`SignalUpdate`].
pub trait SignalUpdateUntracked<T> {
    /// Mutates the value in place without notifying dependents.
    #[track_caller]
    fn update_untracked(&self, f: impl FnOnce(&mut T));

    /// Mutates the value in place without notifying dependents, returning
    /// what the closure returned.
    fn try_update_untracked<O>(&self, f: impl FnOnce(&mut T) -> O)
        -> Option<O>;
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("tried to access a signal in a runtime that has been disposed")]
    RuntimeDisposed,
    #[error("tried to access a signal that has been disposed")]
    Disposed,
}

// Typed access helpers shared by the signal handles (and, for reads, by
// `Memo`). The `dyn Any` cell is borrowed only for the duration of the
// closure; writes release it before notification so re-entrant reads from
// effects see a consistent cell.
impl RuntimeId {
    pub(crate) fn signal_with<T: 'static, O>(
        self,
        id: NodeId,
        f: impl FnOnce(&T) -> O,
    ) -> Result<O, SignalError> {
        with_runtime(self, |runtime| {
            runtime.track_dependency(id);
            let value = runtime.get_value(id).ok_or(SignalError::Disposed)?;
            let value = value.borrow();
            let value = value
                .downcast_ref::<T>()
                .expect("to downcast signal value");
            Ok(f(value))
        })
        .map_err(|_| SignalError::RuntimeDisposed)?
    }

    pub(crate) fn signal_with_untracked<T: 'static, O>(
        self,
        id: NodeId,
        f: impl FnOnce(&T) -> O,
    ) -> Result<O, SignalError> {
        with_runtime(self, |runtime| {
            let value = runtime.get_value(id).ok_or(SignalError::Disposed)?;
            let value = value.borrow();
            let value = value
                .downcast_ref::<T>()
                .expect("to downcast signal value");
            Ok(f(value))
        })
        .map_err(|_| SignalError::RuntimeDisposed)?
    }

    // the write paths hand `new_value` back on failure so `try_set` can
    // return it to the caller
    pub(crate) fn signal_set<T: PartialEq + 'static>(
        self,
        id: NodeId,
        new_value: T,
    ) -> Result<(), (SignalError, T)> {
        let value = match with_runtime(self, |runtime| runtime.get_value(id)) {
            Ok(Some(value)) => value,
            Ok(None) => return Err((SignalError::Disposed, new_value)),
            Err(()) => return Err((SignalError::RuntimeDisposed, new_value)),
        };
        let changed = {
            let mut value = value.borrow_mut();
            let value = value
                .downcast_mut::<T>()
                .expect("to downcast signal value");
            if *value == new_value {
                false
            } else {
                *value = new_value;
                true
            }
        };
        if changed {
            _ = with_runtime(self, |runtime| runtime.mark_signal_write(id));
        }
        Ok(())
    }

    pub(crate) fn signal_set_untracked<T: 'static>(
        self,
        id: NodeId,
        new_value: T,
    ) -> Result<(), (SignalError, T)> {
        let value = match with_runtime(self, |runtime| runtime.get_value(id)) {
            Ok(Some(value)) => value,
            Ok(None) => return Err((SignalError::Disposed, new_value)),
            Err(()) => return Err((SignalError::RuntimeDisposed, new_value)),
        };
        let mut value = value.borrow_mut();
        let value = value
            .downcast_mut::<T>()
            .expect("to downcast signal value");
        *value = new_value;
        Ok(())
    }

    pub(crate) fn signal_update<T: 'static, O>(
        self,
        id: NodeId,
        f: impl FnOnce(&mut T) -> O,
    ) -> Result<O, SignalError> {
        with_runtime(self, |runtime| {
            let value = runtime.get_value(id).ok_or(SignalError::Disposed)?;
            let result = {
                let mut value = value.borrow_mut();
                let value = value
                    .downcast_mut::<T>()
                    .expect("to downcast signal value");
                f(value)
            };
            runtime.mark_signal_write(id);
            Ok(result)
        })
        .map_err(|_| SignalError::RuntimeDisposed)?
    }

    pub(crate) fn signal_update_untracked<T: 'static, O>(
        self,
        id: NodeId,
        f: impl FnOnce(&mut T) -> O,
    ) -> Result<O, SignalError> {
        with_runtime(self, |runtime| {
            let value = runtime.get_value(id).ok_or(SignalError::Disposed)?;
            let mut value = value.borrow_mut();
            let value = value
                .downcast_mut::<T>()
                .expect("to downcast signal value");
            Ok(f(value))
        })
        .map_err(|_| SignalError::RuntimeDisposed)?
    }
}

/// The getter half of a signal.
///
/// Calling [`SignalGet::get`] within an effect or memo subscribes that
/// listener to the signal; [`SignalGetUntracked::get_untracked`] reads
/// without subscribing.
pub struct ReadSignal<T>
where
    T: 'static,
{
    pub(crate) runtime: RuntimeId,
    pub(crate) id: NodeId,
    pub(crate) ty: PhantomData<T>,
    #[cfg(debug_assertions)]
    pub(crate) defined_at: &'static std::panic::Location<'static>,
}

impl<T> Clone for ReadSignal<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ReadSignal<T> {}

impl<T> fmt::Debug for ReadSignal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadSignal")
            .field("runtime", &self.runtime)
            .field("id", &self.id)
            .finish()
    }
}

impl<T> PartialEq for ReadSignal<T> {
    fn eq(&self, other: &Self) -> bool {
        self.runtime == other.runtime && self.id == other.id
    }
}

impl<T> Eq for ReadSignal<T> {}

impl<T: Clone> SignalGet<T> for ReadSignal<T> {
    #[cfg_attr(
        debug_assertions,
        instrument(
            name = "ReadSignal::get()",
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
        self.runtime
            .signal_with(self.id, T::clone)
            .expect("tried to access a signal in a runtime that has been disposed")
    }

    fn try_get(&self) -> Option<T> {
        self.runtime.signal_with(self.id, T::clone).ok()
    }
}

impl<T> SignalWith<T> for ReadSignal<T> {
    fn with<O>(&self, f: impl FnOnce(&T) -> O) -> O {
        self.runtime
            .signal_with(self.id, f)
            .expect("tried to access a signal in a runtime that has been disposed")
    }

    fn try_with<O>(&self, f: impl FnOnce(&T) -> O) -> Option<O> {
        self.runtime.signal_with(self.id, f).ok()
    }
}

impl<T: Clone> SignalGetUntracked<T> for ReadSignal<T> {
    fn get_untracked(&self) -> T {
        self.runtime
            .signal_with_untracked(self.id, T::clone)
            .expect("tried to access a signal in a runtime that has been disposed")
    }

    fn try_get_untracked(&self) -> Option<T> {
        self.runtime.signal_with_untracked(self.id, T::clone).ok()
    }
}

impl<T> SignalWithUntracked<T> for ReadSignal<T> {
    fn with_untracked<O>(&self, f: impl FnOnce(&T) -> O) -> O {
        self.runtime
            .signal_with_untracked(self.id, f)
            .expect("tried to access a signal in a runtime that has been disposed")
    }

    fn try_with_untracked<O>(&self, f: impl FnOnce(&T) -> O) -> Option<O> {
        self.runtime.signal_with_untracked(self.id, f).ok()
    }
}

/// The setter half of a signal.
pub struct WriteSignal<T>
where
    T: 'static,
{
    pub(crate) runtime: RuntimeId,
    pub(crate) id: NodeId,
    pub(crate) ty: PhantomData<T>,
    #[cfg(debug_assertions)]
    pub(crate) defined_at: &'static std::panic::Location<'static>,
}

impl<T> Clone for WriteSignal<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for WriteSignal<T> {}

impl<T> fmt::Debug for WriteSignal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteSignal")
            .field("runtime", &self.runtime)
            .field("id", &self.id)
            .finish()
    }
}

impl<T: PartialEq> SignalSet<T> for WriteSignal<T> {
    #[cfg_attr(
        debug_assertions,
        instrument(
            name = "WriteSignal::set()",
            level = "trace",
            skip_all,
            fields(
                id = ?self.id,
                defined_at = %self.defined_at,
                ty = %std::any::type_name::<T>()
            )
        )
    )]
    fn set(&self, new_value: T) {
        if let Err((err, _)) = self.runtime.signal_set(self.id, new_value) {
            panic!("{err}");
        }
    }

    fn try_set(&self, new_value: T) -> Option<T> {
        self.runtime
            .signal_set(self.id, new_value)
            .err()
            .map(|(_, value)| value)
    }
}

impl<T> SignalUpdate<T> for WriteSignal<T> {
    fn update(&self, f: impl FnOnce(&mut T)) {
        self.runtime
            .signal_update(self.id, f)
            .expect("tried to update a signal in a runtime that has been disposed")
    }

    fn try_update<O>(&self, f: impl FnOnce(&mut T) -> O) -> Option<O> {
        self.runtime.signal_update(self.id, f).ok()
    }
}

impl<T> SignalSetUntracked<T> for WriteSignal<T> {
    fn set_untracked(&self, new_value: T) {
        if let Err((err, _)) =
            self.runtime.signal_set_untracked(self.id, new_value)
        {
            panic!("{err}");
        }
    }

    fn try_set_untracked(&self, new_value: T) -> Option<T> {
        self.runtime
            .signal_set_untracked(self.id, new_value)
            .err()
            .map(|(_, value)| value)
    }
}

impl<T> SignalUpdateUntracked<T> for WriteSignal<T> {
    fn update_untracked(&self, f: impl FnOnce(&mut T)) {
        self.runtime
            .signal_update_untracked(self.id, f)
            .expect("tried to update a signal in a runtime that has been disposed")
    }

    fn try_update_untracked<O>(
        &self,
        f: impl FnOnce(&mut T) -> O,
    ) -> Option<O> {
        self.runtime.signal_update_untracked(self.id, f).ok()
    }
}

/// A signal that can be read from and written to through a single handle.
///
/// ```
/// # use reactive_cells::*;
/// # let runtime = create_runtime();
/// let count = create_rw_signal(0);
/// count.set(1);
/// assert_eq!(count.get(), 1);
/// # runtime.dispose();
/// ```
pub struct RwSignal<T>
where
    T: 'static,
{
    pub(crate) runtime: RuntimeId,
    pub(crate) id: NodeId,
    pub(crate) ty: PhantomData<T>,
    #[cfg(debug_assertions)]
    pub(crate) defined_at: &'static std::panic::Location<'static>,
}

impl<T> Clone for RwSignal<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RwSignal<T> {}

impl<T> fmt::Debug for RwSignal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwSignal")
            .field("runtime", &self.runtime)
            .field("id", &self.id)
            .finish()
    }
}

impl<T> PartialEq for RwSignal<T> {
    fn eq(&self, other: &Self) -> bool {
        self.runtime == other.runtime && self.id == other.id
    }
}

impl<T> Eq for RwSignal<T> {}

impl<T> RwSignal<T> {
    /// Returns a read-only handle to the same signal.
    #[track_caller]
    pub fn read_only(&self) -> ReadSignal<T> {
        ReadSignal {
            runtime: self.runtime,
            id: self.id,
            ty: PhantomData,
            #[cfg(debug_assertions)]
            defined_at: std::panic::Location::caller(),
        }
    }

    /// Returns a write-only handle to the same signal.
    #[track_caller]
    pub fn write_only(&self) -> WriteSignal<T> {
        WriteSignal {
            runtime: self.runtime,
            id: self.id,
            ty: PhantomData,
            #[cfg(debug_assertions)]
            defined_at: std::panic::Location::caller(),
        }
    }
}

impl<T: Clone> SignalGet<T> for RwSignal<T> {
    fn get(&self) -> T {
        self.runtime
            .signal_with(self.id, T::clone)
            .expect("tried to access a signal in a runtime that has been disposed")
    }

    fn try_get(&self) -> Option<T> {
        self.runtime.signal_with(self.id, T::clone).ok()
    }
}

impl<T> SignalWith<T> for RwSignal<T> {
    fn with<O>(&self, f: impl FnOnce(&T) -> O) -> O {
        self.runtime
            .signal_with(self.id, f)
            .expect("tried to access a signal in a runtime that has been disposed")
    }

    fn try_with<O>(&self, f: impl FnOnce(&T) -> O) -> Option<O> {
        self.runtime.signal_with(self.id, f).ok()
    }
}

impl<T: Clone> SignalGetUntracked<T> for RwSignal<T> {
    fn get_untracked(&self) -> T {
        self.runtime
            .signal_with_untracked(self.id, T::clone)
            .expect("tried to access a signal in a runtime that has been disposed")
    }

    fn try_get_untracked(&self) -> Option<T> {
        self.runtime.signal_with_untracked(self.id, T::clone).ok()
    }
}

impl<T> SignalWithUntracked<T> for RwSignal<T> {
    fn with_untracked<O>(&self, f: impl FnOnce(&T) -> O) -> O {
        self.runtime
            .signal_with_untracked(self.id, f)
            .expect("tried to access a signal in a runtime that has been disposed")
    }

    fn try_with_untracked<O>(&self, f: impl FnOnce(&T) -> O) -> Option<O> {
        self.runtime.signal_with_untracked(self.id, f).ok()
    }
}

impl<T: PartialEq> SignalSet<T> for RwSignal<T> {
    #[cfg_attr(
        debug_assertions,
        instrument(
            name = "RwSignal::set()",
            level = "trace",
            skip_all,
            fields(
                id = ?self.id,
                defined_at = %self.defined_at,
                ty = %std::any::type_name::<T>()
            )
        )
    )]
    fn set(&self, new_value: T) {
        if let Err((err, _)) = self.runtime.signal_set(self.id, new_value) {
            panic!("{err}");
        }
    }

    fn try_set(&self, new_value: T) -> Option<T> {
        self.runtime
            .signal_set(self.id, new_value)
            .err()
            .map(|(_, value)| value)
    }
}

impl<T> SignalUpdate<T> for RwSignal<T> {
    fn update(&self, f: impl FnOnce(&mut T)) {
        self.runtime
            .signal_update(self.id, f)
            .expect("tried to update a signal in a runtime that has been disposed")
    }

    fn try_update<O>(&self, f: impl FnOnce(&mut T) -> O) -> Option<O> {
        self.runtime.signal_update(self.id, f).ok()
    }
}

impl<T> SignalSetUntracked<T> for RwSignal<T> {
    fn set_untracked(&self, new_value: T) {
        if let Err((err, _)) =
            self.runtime.signal_set_untracked(self.id, new_value)
        {
            panic!("{err}");
        }
    }

    fn try_set_untracked(&self, new_value: T) -> Option<T> {
        self.runtime
            .signal_set_untracked(self.id, new_value)
            .err()
            .map(|(_, value)| value)
    }
}

impl<T> SignalUpdateUntracked<T> for RwSignal<T> {
    fn update_untracked(&self, f: impl FnOnce(&mut T)) {
        self.runtime
            .signal_update_untracked(self.id, f)
            .expect("tried to update a signal in a runtime that has been disposed")
    }

    fn try_update_untracked<O>(
        &self,
        f: impl FnOnce(&mut T) -> O,
    ) -> Option<O> {
        self.runtime.signal_update_untracked(self.id, f).ok()
    }
}
