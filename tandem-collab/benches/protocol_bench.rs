use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use tandem_collab::broadcast::BroadcastGroup;
use tandem_collab::presence::{color_for, CursorState, PeerInfo, PresenceEntry, PALETTE};
use tandem_collab::protocol::{RoomId, WireMessage};
use tandem_core::Position;

fn room() -> RoomId {
    RoomId::new(Uuid::new_v4(), Uuid::new_v4())
}

fn bench_update_encode(c: &mut Criterion) {
    let origin = Uuid::new_v4();
    let r = room();
    let payload = vec![0u8; 64]; // typical small yrs delta

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            let msg = WireMessage::update(
                black_box(origin),
                black_box(r),
                black_box(1),
                black_box(payload.clone()),
            );
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = WireMessage::update(Uuid::new_v4(), room(), 1, vec![0u8; 64])
        .encode()
        .unwrap();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| {
            black_box(WireMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_cursor_encode(c: &mut Criterion) {
    let origin = Uuid::new_v4();
    let r = room();
    let cursor = CursorState {
        client_id: origin,
        position: Position::new(120, 48),
        selection: None,
    };

    c.bench_function("cursor_encode", |b| {
        b.iter(|| {
            let msg = WireMessage::cursor(black_box(origin), black_box(r), 1, black_box(&cursor));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_presence_snapshot_encode(c: &mut Criterion) {
    let entries: Vec<PresenceEntry> = (0..16)
        .map(|i| PresenceEntry {
            peer: PeerInfo {
                client_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                username: format!("peer{i}"),
                color: PALETTE[i % PALETTE.len()],
            },
            cursor: None,
        })
        .collect();
    let r = room();

    c.bench_function("presence_snapshot_encode_16_peers", |b| {
        b.iter(|| {
            let msg = WireMessage::presence_snapshot(black_box(r), black_box(&entries));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_color_assignment(c: &mut Criterion) {
    let user = Uuid::new_v4();
    let mut occupied = HashSet::new();
    for color in PALETTE.iter().take(7) {
        occupied.insert(*color);
    }

    c.bench_function("color_for_crowded_room", |b| {
        b.iter(|| black_box(color_for(black_box(user), black_box(&occupied))))
    });
}

fn bench_broadcast_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let group = BroadcastGroup::new(2048);

    // Receivers must outlive the measurement or the fan-out count drops.
    let _receivers = rt.block_on(async {
        let mut receivers = Vec::new();
        for i in 0..100 {
            let rx = group
                .add_peer(PeerInfo {
                    client_id: Uuid::new_v4(),
                    user_id: Uuid::new_v4(),
                    username: format!("peer{i}"),
                    color: PALETTE[0],
                })
                .await;
            receivers.push(rx);
        }
        receivers
    });

    let frame = Arc::new(vec![0u8; 64]);
    c.bench_function("broadcast_raw_100_peers", |b| {
        b.iter(|| {
            black_box(group.broadcast_raw(black_box(frame.clone())));
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_cursor_encode,
    bench_presence_snapshot_encode,
    bench_color_assignment,
    bench_broadcast_fan_out,
);
criterion_main!(benches);
