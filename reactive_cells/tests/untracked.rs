use reactive_cells::{
    create_effect, create_memo, create_runtime, create_signal, is_tracking,
    untrack, SignalGet, SignalGetUntracked, SignalSet, SignalSetUntracked,
};
use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

#[test]
fn untrack_returns_the_closure_result() {
    let runtime = create_runtime();
    let (a, _) = create_signal(5);
    assert_eq!(untrack(move || a.get() * 2), 10);
    runtime.dispose();
}

#[test]
fn untracked_reads_do_not_subscribe() {
    let runtime = create_runtime();
    let log = Rc::new(RefCell::new(Vec::new()));

    let (a, set_a) = create_signal(1);
    let (b, set_b) = create_signal(10);
    create_effect({
        let log = Rc::clone(&log);
        move |_| {
            let sum = a.get() + untrack(move || b.get());
            log.borrow_mut().push(sum);
        }
    });
    assert_eq!(*log.borrow(), vec![11]);

    // `b` was read inside `untrack`: no subscription, no re-run
    set_b.set(20);
    assert_eq!(*log.borrow(), vec![11]);

    // but a re-run triggered by `a` observes the newest `b`
    set_a.set(2);
    assert_eq!(*log.borrow(), vec![11, 22]);

    runtime.dispose();
}

#[test]
fn get_untracked_behaves_like_untrack() {
    let runtime = create_runtime();
    let runs = Rc::new(Cell::new(0));

    let (a, set_a) = create_signal(1);
    let (b, set_b) = create_signal(10);
    create_effect({
        let runs = Rc::clone(&runs);
        move |_| {
            a.get();
            b.get_untracked();
            runs.set(runs.get() + 1);
        }
    });

    set_b.set(20);
    assert_eq!(runs.get(), 1);
    set_a.set(2);
    assert_eq!(runs.get(), 2);

    runtime.dispose();
}

#[test]
fn untracked_writes_are_invisible() {
    let runtime = create_runtime();
    let log = Rc::new(RefCell::new(Vec::new()));

    let (s, set_s) = create_signal(1);
    create_effect({
        let log = Rc::clone(&log);
        move |_| log.borrow_mut().push(s.get())
    });
    assert_eq!(*log.borrow(), vec![1]);

    set_s.set_untracked(5);
    assert_eq!(*log.borrow(), vec![1]);

    // a later tracked write notifies as usual
    set_s.set(6);
    assert_eq!(*log.borrow(), vec![1, 6]);

    runtime.dispose();
}

#[test]
fn is_tracking_reflects_the_listener() {
    let runtime = create_runtime();
    let in_effect = Rc::new(Cell::new(false));
    let in_untrack = Rc::new(Cell::new(true));
    let in_memo = Rc::new(Cell::new(false));

    assert!(!is_tracking());

    let (s, set_s) = create_signal(0);
    let m = create_memo({
        let in_memo = Rc::clone(&in_memo);
        move |_| {
            in_memo.set(is_tracking());
            s.get()
        }
    });
    create_effect({
        let in_effect = Rc::clone(&in_effect);
        let in_untrack = Rc::clone(&in_untrack);
        move |_| {
            in_effect.set(is_tracking());
            in_untrack.set(untrack(is_tracking));
            m.get();
        }
    });

    assert!(in_effect.get());
    assert!(!in_untrack.get());
    assert!(in_memo.get());
    assert!(!is_tracking());

    set_s.set(1);
    assert!(in_memo.get());

    runtime.dispose();
}

#[test]
fn memo_get_untracked_still_refreshes() {
    let runtime = create_runtime();
    let (s, set_s) = create_signal(1);
    let d = create_memo(move |_| s.get() * 2);

    assert_eq!(d.get_untracked(), 2);
    set_s.set(3);
    // untracked reads skip the subscription, not the refresh
    assert_eq!(d.get_untracked(), 6);

    runtime.dispose();
}

#[test]
fn repeated_reads_through_a_nested_listener_stay_subscribed() {
    let runtime = create_runtime();
    let log = Rc::new(RefCell::new(Vec::new()));

    // the effect reads `s`, then a memo whose run re-reads `s`, then `s`
    // again; the second direct read must not end up recorded twice (a
    // duplicate would corrupt the dependency diff on later runs)
    let (s, set_s) = create_signal(1);
    let m = create_memo(move |_| s.get() * 10);
    create_effect({
        let log = Rc::clone(&log);
        move |_| {
            let sum = s.get() + m.get() + s.get();
            log.borrow_mut().push(sum);
        }
    });
    assert_eq!(*log.borrow(), vec![12]);

    set_s.set(2);
    assert_eq!(*log.borrow(), vec![12, 24]);

    set_s.set(3);
    assert_eq!(*log.borrow(), vec![12, 24, 36]);

    runtime.dispose();
}
