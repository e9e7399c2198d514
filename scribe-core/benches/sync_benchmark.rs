use criterion::{criterion_group, criterion_main, Criterion};
use scribe_core::{
    apply_remote, extract, rebase, ClientId, Cursor, Edit, EditBatch, HistoryEntry, InputGate,
    LedgerAction, Operation, Session, TextDocument,
};
use std::hint::black_box;
use uuid::Uuid;

fn sample_text(chars: usize) -> String {
    "lorem ipsum dolor sit amet ".chars().cycle().take(chars).collect()
}

fn bench_extract_single_keystroke(c: &mut Criterion) {
    let old = sample_text(10_000);
    let mut new = old.clone();
    new.insert(5_000, 'x');

    c.bench_function("extract_keystroke_10k", |b| {
        b.iter(|| black_box(extract(black_box(&old), black_box(&new))))
    });
}

fn bench_extract_replace(c: &mut Criterion) {
    let old = sample_text(10_000);
    let new = format!("{}REPLACED{}", &old[..4_000], &old[4_100..]);

    c.bench_function("extract_replace_10k", |b| {
        b.iter(|| black_box(extract(black_box(&old), black_box(&new))))
    });
}

fn bench_apply_remote_batch(c: &mut Criterion) {
    let text = sample_text(10_000);
    let edits: Vec<Edit> = (0..100)
        .map(|i| {
            if i % 2 == 0 {
                Edit::insert(i * 50, "abc")
            } else {
                Edit::delete(i * 50, 2)
            }
        })
        .collect();

    c.bench_function("apply_remote_100_ops", |b| {
        b.iter(|| {
            let mut doc = TextDocument::from(text.as_str());
            let mut gate = InputGate::new(false);
            black_box(apply_remote(&mut gate, &mut doc, black_box(&edits), Cursor::at(5_000)).unwrap());
        })
    });
}

fn bench_rebase_over_ledger(c: &mut Criterion) {
    let applied: Vec<HistoryEntry> = (0..256)
        .map(|i| {
            let operation = Operation::new(Edit::insert(i * 3, "xy"), ClientId::nil());
            HistoryEntry {
                timestamp: operation.timestamp,
                operation,
                removed: None,
                applied_revision: i as u64 + 1,
                author: "bench".into(),
                group: Uuid::new_v4(),
                action: LedgerAction::Edit,
            }
        })
        .collect();

    c.bench_function("rebase_over_256_entries", |b| {
        b.iter(|| {
            black_box(rebase(
                vec![Edit::delete(400, 10), Edit::insert(400, "new")],
                black_box(&applied),
            ))
        })
    });
}

fn bench_session_submit(c: &mut Criterion) {
    c.bench_function("session_submit_1k_keystrokes", |b| {
        b.iter(|| {
            let mut session = Session::new("bench", 256);
            let author = ClientId::new();
            session.join(author, "bench");
            for i in 0..1_000 {
                let batch = EditBatch {
                    session_id: "bench".into(),
                    batch_id: Uuid::new_v4(),
                    base_revision: i,
                    operations: vec![Edit::insert(i as usize, "k")],
                };
                session.submit(author, batch).unwrap();
            }
            black_box(session.revision());
        })
    });
}

criterion_group!(
    benches,
    bench_extract_single_keystroke,
    bench_extract_replace,
    bench_apply_remote_batch,
    bench_rebase_over_ledger,
    bench_session_submit,
);
criterion_main!(benches);
