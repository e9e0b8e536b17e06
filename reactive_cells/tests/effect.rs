use reactive_cells::{
    batch, create_effect, create_runtime, create_signal, SignalGet, SignalSet,
};
use std::{
    cell::{Cell, RefCell},
    panic::{catch_unwind, AssertUnwindSafe},
    rc::Rc,
};

#[test]
fn effect_runs_on_change() {
    let runtime = create_runtime();
    let log = Rc::new(RefCell::new(Vec::new()));

    let (s, set_s) = create_signal(1);
    create_effect({
        let log = Rc::clone(&log);
        move |_| log.borrow_mut().push(s.get())
    });
    assert_eq!(*log.borrow(), vec![1]);

    set_s.set(2);
    assert_eq!(*log.borrow(), vec![1, 2]);

    set_s.set(2);
    assert_eq!(*log.borrow(), vec![1, 2]);

    runtime.dispose();
}

#[test]
fn batched_writes_coalesce_into_one_run() {
    let runtime = create_runtime();
    let log = Rc::new(RefCell::new(Vec::new()));

    let (a, set_a) = create_signal(1);
    let (b, set_b) = create_signal(2);
    create_effect({
        let log = Rc::clone(&log);
        move |_| log.borrow_mut().push(a.get() + b.get())
    });
    assert_eq!(*log.borrow(), vec![3]);

    batch(move || {
        set_a.set(10);
        set_b.set(20);
    });
    // one additional run, observing both final values
    assert_eq!(*log.borrow(), vec![3, 30]);

    runtime.dispose();
}

#[test]
fn dynamic_dependencies_follow_control_flow() {
    let runtime = create_runtime();
    let log = Rc::new(RefCell::new(Vec::new()));

    let (cond, set_cond) = create_signal(true);
    let (x, set_x) = create_signal(1);
    let (y, set_y) = create_signal(2);
    create_effect({
        let log = Rc::clone(&log);
        move |_| {
            log.borrow_mut()
                .push(if cond.get() { x.get() } else { y.get() })
        }
    });
    assert_eq!(*log.borrow(), vec![1]);

    // `y` is not a dependency of the branch taken
    set_y.set(99);
    assert_eq!(*log.borrow(), vec![1]);

    set_cond.set(false);
    assert_eq!(*log.borrow(), vec![1, 99]);

    // after the switch, `x` is no longer a dependency
    set_x.set(5);
    assert_eq!(*log.borrow(), vec![1, 99]);

    set_y.set(7);
    assert_eq!(*log.borrow(), vec![1, 99, 7]);

    runtime.dispose();
}

#[test]
fn effects_run_in_reverse_notification_order() {
    let runtime = create_runtime();
    let log = Rc::new(RefCell::new(Vec::new()));

    let (s, set_s) = create_signal(0);
    create_effect({
        let log = Rc::clone(&log);
        move |_| {
            s.get();
            log.borrow_mut().push("first");
        }
    });
    create_effect({
        let log = Rc::clone(&log);
        move |_| {
            s.get();
            log.borrow_mut().push("second");
        }
    });
    assert_eq!(*log.borrow(), vec!["first", "second"]);

    // within a wave the queue is LIFO: last notified runs first
    set_s.set(1);
    assert_eq!(*log.borrow(), vec!["first", "second", "second", "first"]);

    runtime.dispose();
}

#[test]
fn effect_receives_previous_return_value() {
    let runtime = create_runtime();
    let (s, set_s) = create_signal(0);

    let effect = create_effect(move |prev: Option<i32>| {
        s.get();
        prev.unwrap_or(0) + 1
    });
    assert_eq!(effect.last_value(), Some(1));

    set_s.set(1);
    assert_eq!(effect.last_value(), Some(2));

    set_s.set(2);
    assert_eq!(effect.last_value(), Some(3));

    runtime.dispose();
}

#[test]
fn disposed_effect_never_runs_again() {
    let runtime = create_runtime();
    let runs = Rc::new(Cell::new(0));

    let (s, set_s) = create_signal(0);
    let effect = create_effect({
        let runs = Rc::clone(&runs);
        move |_| {
            s.get();
            runs.set(runs.get() + 1);
        }
    });
    assert_eq!(runs.get(), 1);

    effect.dispose();
    set_s.set(1);
    set_s.set(2);
    assert_eq!(runs.get(), 1);

    runtime.dispose();
}

#[test]
fn effect_disposed_mid_drain_is_skipped() {
    let runtime = create_runtime();
    let target_runs = Rc::new(Cell::new(0));

    let (s, set_s) = create_signal(0);
    // created first, so it is notified first and runs *last* in the wave
    let target = create_effect({
        let target_runs = Rc::clone(&target_runs);
        move |_| {
            s.get();
            target_runs.set(target_runs.get() + 1);
        }
    });
    create_effect(move |_| {
        if s.get() > 0 {
            target.dispose();
        }
    });
    assert_eq!(target_runs.get(), 1);

    set_s.set(1);
    assert_eq!(target_runs.get(), 1);

    runtime.dispose();
}

#[test]
fn drain_continues_past_a_panicking_effect() {
    let runtime = create_runtime();
    let log = Rc::new(RefCell::new(Vec::new()));

    let (s, set_s) = create_signal(0);
    // created first: runs last in the wave, after the panicking effect
    create_effect({
        let log = Rc::clone(&log);
        move |_| log.borrow_mut().push(s.get())
    });
    create_effect(move |_| {
        if s.get() == 2 {
            panic!("boom");
        }
    });

    let result = catch_unwind(AssertUnwindSafe(|| set_s.set(2)));
    let err = result.unwrap_err();
    assert_eq!(err.downcast_ref::<&str>(), Some(&"boom"));

    // the surviving effect still ran before the panic was re-raised
    assert_eq!(*log.borrow(), vec![0, 2]);

    // and the panicking effect is still alive for later waves
    let result = catch_unwind(AssertUnwindSafe(|| set_s.set(2)));
    assert!(result.is_ok());
    set_s.set(3);
    assert_eq!(*log.borrow(), vec![0, 2, 3]);

    runtime.dispose();
}

#[test]
fn panicking_first_run_disposes_the_effect() {
    let runtime = create_runtime();
    let runs = Rc::new(Cell::new(0));

    let (s, set_s) = create_signal(0);
    let result = catch_unwind(AssertUnwindSafe(|| {
        create_effect({
            let runs = Rc::clone(&runs);
            move |_| {
                runs.set(runs.get() + 1);
                s.get();
                panic!("first run failed");
            }
        })
    }));
    assert!(result.is_err());
    assert_eq!(runs.get(), 1);

    // the effect subscribed before panicking, but disposal tore that down
    set_s.set(1);
    assert_eq!(runs.get(), 1);

    runtime.dispose();
}

#[test]
fn effect_writing_a_signal_cascades() {
    let runtime = create_runtime();
    let log = Rc::new(RefCell::new(Vec::new()));

    let (a, set_a) = create_signal(1);
    let (b, set_b) = create_signal(0);
    create_effect(move |_| set_b.set(a.get() * 10));
    create_effect({
        let log = Rc::clone(&log);
        move |_| log.borrow_mut().push(b.get())
    });
    assert_eq!(*log.borrow(), vec![10]);

    set_a.set(2);
    assert_eq!(*log.borrow(), vec![10, 20]);

    runtime.dispose();
}
