use criterion::{criterion_group, criterion_main, Criterion};
use scribe_collab::broadcast::BroadcastGroup;
use scribe_collab::presence::{CursorColor, PresenceRoom};
use scribe_collab::protocol::{ClientMessage, ServerMessage, WireFormat};
use scribe_core::{ClientId, Edit, Participant};
use std::hint::black_box;
use std::time::Duration;
use uuid::Uuid;

fn edit_message() -> ClientMessage {
    ClientMessage::Edit {
        session_id: "bench".into(),
        revision: 42,
        batch_id: Uuid::new_v4(),
        operations: vec![Edit::insert(120, "hello "), Edit::delete(10, 3)],
    }
}

fn bench_edit_encode(c: &mut Criterion) {
    let message = edit_message();
    c.bench_function("edit_encode_binary", |b| {
        b.iter(|| black_box(black_box(&message).encode().unwrap()))
    });
}

fn bench_edit_decode(c: &mut Criterion) {
    let encoded = edit_message().encode().unwrap();
    c.bench_function("edit_decode_binary", |b| {
        b.iter(|| black_box(ClientMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_edit_json_roundtrip(c: &mut Criterion) {
    let message = edit_message();
    c.bench_function("edit_json_roundtrip", |b| {
        b.iter(|| {
            let json = message.to_json().unwrap();
            black_box(ClientMessage::from_json(black_box(&json)).unwrap());
        })
    });
}

fn bench_init_frame(c: &mut Criterion) {
    let participants: Vec<Participant> = (0..20)
        .map(|i| Participant {
            id: ClientId::new(),
            username: format!("user{i}"),
            position: i,
            selection_end: i,
        })
        .collect();
    let init = ServerMessage::Init {
        client_id: ClientId::new(),
        revision: 1_000,
        text: "lorem ipsum ".repeat(1_000),
        participants,
    };
    c.bench_function("init_frame_12k_chars", |b| {
        b.iter(|| black_box(WireFormat::Binary.frame(black_box(&init)).unwrap()))
    });
}

fn bench_broadcast_100_receivers(c: &mut Criterion) {
    let group = BroadcastGroup::new(1024);
    let mut receivers: Vec<_> = (0..100).map(|_| group.subscribe()).collect();
    let origin = ClientId::new();

    c.bench_function("broadcast_update_100_receivers", |b| {
        b.iter(|| {
            let count = group.broadcast(
                ServerMessage::Update {
                    revision: 1,
                    operations: vec![Edit::insert(0, "x")],
                    origin,
                },
                Some(origin),
            );
            for rx in receivers.iter_mut() {
                black_box(rx.try_recv().unwrap());
            }
            black_box(count);
        })
    });
}

fn bench_cursor_color_from_client(c: &mut Criterion) {
    let id = ClientId::new();
    c.bench_function("cursor_color_from_client", |b| {
        b.iter(|| black_box(CursorColor::from_client(black_box(id))))
    });
}

fn bench_shift_100_cursors(c: &mut Criterion) {
    let mut room = PresenceRoom::new(Duration::from_millis(100));
    for i in 0..100 {
        room.handle_cursor_update(ClientId::new(), &format!("peer{i}"), i * 10, i * 10 + 5);
    }
    let edits = vec![Edit::insert(500, "abc"), Edit::delete(100, 2)];

    c.bench_function("shift_100_remote_cursors", |b| {
        b.iter(|| room.shift_cursors(black_box(&edits), 2_000))
    });
}

criterion_group!(
    benches,
    bench_edit_encode,
    bench_edit_decode,
    bench_edit_json_roundtrip,
    bench_init_frame,
    bench_broadcast_100_receivers,
    bench_cursor_color_from_client,
    bench_shift_100_cursors,
);
criterion_main!(benches);
