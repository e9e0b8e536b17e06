//! A fine-grained reactive computation graph.
//!
//! Individual reactive values ("signals") trigger the code that reacts to
//! them ("effects") to re-run, with cached pure derivations ("memos") in
//! between. The engine keeps effects consistent with the signals they read
//! while doing as little recomputation as it can get away with: a write
//! marks its direct subscribers dirty eagerly and everything further
//! downstream only *possibly* dirty, and readers discharge that
//! possibility lazily by comparing change stamps instead of re-running
//! computations.
//!
//! Here are the functions and types you'll reach for most often:
//!
//! ### Signals
//! 1. *Signals:* [`create_signal`], which returns a ([`ReadSignal`],
//!    [`WriteSignal`]) tuple, or [`create_rw_signal`], which returns a
//!    [`RwSignal`] without this read-write segregation.
//! 2. *Memos:* [`create_memo`], which returns a [`Memo`], a lazy, cached
//!    derivation that recomputes at most once between two reads, and only
//!    if some transitive source actually changed.
//!
//! ### Effects
//! 1. [`create_effect`] runs a side effect once immediately and again
//!    whenever a dependency changes; [`on_cleanup`] registers teardown
//!    callbacks that run before the next run and on disposal.
//! 2. [`batch`] coalesces any number of writes into a single wave of
//!    effect runs; [`untrack`] reads without subscribing.
//!
//! ### Example
//! ```
//! use reactive_cells::*;
//!
//! // every graph lives in a runtime; tests and embedders create and
//! // dispose their own
//! let runtime = create_runtime();
//!
//! // a signal: returns a (getter, setter) pair
//! let (count, set_count) = create_signal(0);
//!
//! // a memo: runs only when `count` changes, no matter how often it's read
//! let double_count = create_memo(move |_| count.get() * 2);
//! assert_eq!(double_count.get(), 0);
//!
//! // an effect: runs now, and again after every change to `count`
//! create_effect(move |_| {
//!     println!("count = {}", count.get());
//! });
//!
//! // a batch: both writes below produce a single effect run
//! batch(move || {
//!     set_count.set(1);
//!     set_count.set(2);
//! });
//! assert_eq!(double_count.get(), 4);
//!
//! runtime.dispose();
//! ```
//!
//! The engine is single-threaded and cooperative: clocks, the current
//! listener, and the batch queue live in a thread-local runtime, every
//! operation runs to completion, and nothing here is `Send`.

#[macro_use]
extern crate tracing;

mod effect;
mod macros;
mod memo;
mod node;
mod runtime;
mod signal;

pub use effect::*;
pub use memo::*;
pub use runtime::*;
pub use signal::*;
