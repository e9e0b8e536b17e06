use criterion::{criterion_group, criterion_main, Criterion};
use reactive_cells::{
    batch, create_effect, create_memo, create_runtime, create_signal, Memo,
    SignalGet, SignalGetUntracked, SignalSet,
};

fn deep_update(c: &mut Criterion) {
    c.bench_function("deep_update", |b| {
        b.iter(|| {
            let runtime = create_runtime();
            let (signal, set_signal) = create_signal(0usize);
            let mut memos = Vec::<Memo<usize>>::new();
            for i in 0..1000usize {
                let prev = memos.get(i.saturating_sub(1)).copied();
                if let Some(prev) = prev {
                    memos.push(create_memo(move |_| prev.get() + 1));
                } else {
                    memos.push(create_memo(move |_| signal.get() + 1));
                }
            }
            set_signal.set(1);
            assert_eq!(memos[999].get(), 1001);
            runtime.dispose();
        });
    });
}

fn fan_out(c: &mut Criterion) {
    c.bench_function("fan_out", |b| {
        b.iter(|| {
            let runtime = create_runtime();
            let (signal, set_signal) = create_signal(0usize);
            let (acc, set_acc) = create_signal(0usize);
            for _ in 0..100 {
                create_effect(move |_| {
                    let next = signal.get() + 1;
                    set_acc.set(acc.get_untracked() + next);
                });
            }
            batch(move || {
                set_signal.set(2);
            });
            assert_eq!(acc.get_untracked(), 100 + 100 * 3);
            runtime.dispose();
        });
    });
}

criterion_group!(benches, deep_update, fan_out);
criterion_main!(benches);
