use reactive_cells::{
    create_effect, create_memo, create_runtime, create_signal, on_cleanup,
    try_on_cleanup, CleanupError, SignalGet, SignalSet,
};
use std::{
    cell::{Cell, RefCell},
    panic::{catch_unwind, AssertUnwindSafe},
    rc::Rc,
};

#[test]
fn cleanup_runs_before_each_rerun() {
    let runtime = create_runtime();
    let log = Rc::new(RefCell::new(Vec::new()));

    let (s, set_s) = create_signal(1);
    create_effect({
        let log = Rc::clone(&log);
        move |_| {
            let log_for_cleanup = Rc::clone(&log);
            on_cleanup(move || log_for_cleanup.borrow_mut().push("x".to_string()));
            log.borrow_mut().push(s.get().to_string());
        }
    });
    assert_eq!(*log.borrow(), vec!["1"]);

    set_s.set(2);
    assert_eq!(*log.borrow(), vec!["1", "x", "2"]);

    set_s.set(3);
    assert_eq!(*log.borrow(), vec!["1", "x", "2", "x", "3"]);

    runtime.dispose();
}

#[test]
fn cleanup_counts_match_reruns() {
    let runtime = create_runtime();
    let runs = Rc::new(Cell::new(0));
    let cleanups = Rc::new(Cell::new(0));

    let (a, set_a) = create_signal(-1);

    create_effect({
        let cleanups = Rc::clone(&cleanups);
        let runs = Rc::clone(&runs);
        move |_| {
            a.get();
            runs.set(runs.get() + 1);
            on_cleanup({
                let cleanups = Rc::clone(&cleanups);
                move || {
                    cleanups.set(cleanups.get() + 1);
                }
            });
        }
    });

    assert_eq!(cleanups.get(), 0);
    assert_eq!(runs.get(), 1);

    set_a.set(1);

    assert_eq!(runs.get(), 2);
    assert_eq!(cleanups.get(), 1);

    set_a.set(2);

    assert_eq!(runs.get(), 3);
    assert_eq!(cleanups.get(), 2);

    runtime.dispose();
}

#[test]
fn cleanups_run_in_registration_order() {
    let runtime = create_runtime();
    let log = Rc::new(RefCell::new(Vec::new()));

    let (s, set_s) = create_signal(0);
    create_effect({
        let log = Rc::clone(&log);
        move |_| {
            s.get();
            let first = Rc::clone(&log);
            on_cleanup(move || first.borrow_mut().push("first"));
            let second = Rc::clone(&log);
            on_cleanup(move || second.borrow_mut().push("second"));
        }
    });

    set_s.set(1);
    assert_eq!(*log.borrow(), vec!["first", "second"]);

    runtime.dispose();
}

#[test]
fn cleanup_runs_on_dispose() {
    let runtime = create_runtime();
    let cleaned = Rc::new(Cell::new(false));

    let (s, _) = create_signal(0);
    let effect = create_effect({
        let cleaned = Rc::clone(&cleaned);
        move |_| {
            s.get();
            let cleaned = Rc::clone(&cleaned);
            on_cleanup(move || cleaned.set(true));
        }
    });
    assert!(!cleaned.get());

    effect.dispose();
    assert!(cleaned.get());

    runtime.dispose();
}

#[test]
fn cleanup_reads_are_not_tracked() {
    let runtime = create_runtime();
    let runs = Rc::new(Cell::new(0));

    let (s, set_s) = create_signal(0);
    let (other, set_other) = create_signal(0);
    create_effect({
        let runs = Rc::clone(&runs);
        move |_| {
            s.get();
            runs.set(runs.get() + 1);
            on_cleanup(move || {
                other.get();
            });
        }
    });
    assert_eq!(runs.get(), 1);

    // the cleanup read `other`, but with the listener cleared
    set_s.set(1);
    set_other.set(1);
    assert_eq!(runs.get(), 2);

    runtime.dispose();
}

#[test]
fn cleanup_outside_effect_panics() {
    let runtime = create_runtime();
    let result = catch_unwind(|| on_cleanup(|| ()));
    assert!(result.is_err());
    runtime.dispose();
}

#[test]
fn try_cleanup_outside_effect_is_rejected() {
    let runtime = create_runtime();
    assert!(matches!(
        try_on_cleanup(|| ()),
        Err(CleanupError::NotInEffect)
    ));
    runtime.dispose();
}

#[test]
fn cleanup_inside_memo_is_rejected() {
    let runtime = create_runtime();
    let rejected = Rc::new(Cell::new(false));

    let m = create_memo({
        let rejected = Rc::clone(&rejected);
        move |_| {
            rejected.set(try_on_cleanup(|| ()).is_err());
            1
        }
    });
    m.get();
    assert!(rejected.get());

    runtime.dispose();
}

#[test]
fn panicking_cleanup_disposes_the_effect() {
    let runtime = create_runtime();
    let runs = Rc::new(Cell::new(0));
    let later = Rc::new(Cell::new(0));

    let (s, set_s) = create_signal(0);
    create_effect({
        let runs = Rc::clone(&runs);
        let later = Rc::clone(&later);
        move |_| {
            s.get();
            runs.set(runs.get() + 1);
            let later = Rc::clone(&later);
            on_cleanup(move || panic!("cleanup failed"));
            on_cleanup(move || later.set(later.get() + 1));
        }
    });
    assert_eq!(runs.get(), 1);

    let result = catch_unwind(AssertUnwindSafe(|| set_s.set(1)));
    assert!(result.is_err());
    // the cleanup after the panicking one still ran
    assert_eq!(later.get(), 1);
    // the new run never started
    assert_eq!(runs.get(), 1);

    // the effect is disposed: no further runs
    set_s.set(2);
    assert_eq!(runs.get(), 1);

    runtime.dispose();
}
