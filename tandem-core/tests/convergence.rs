//! Cross-replica convergence properties.
//!
//! Two independent replicas that see the same set of updates — in any
//! order, with any duplication — must end up with identical text.

use tandem_core::SharedDocument;

/// Apply a set of updates to a fresh replica in the given order.
fn replay(updates: &[&Vec<u8>]) -> String {
    let mut doc = SharedDocument::new();
    for update in updates {
        doc.merge_remote_update(update).unwrap();
    }
    doc.text()
}

#[test]
fn convergence_under_all_permutations() {
    // Three peers each make one edit against the same starting state.
    let seed = SharedDocument::with_text("base\n").full_state();

    let make_peer = || {
        let mut doc = SharedDocument::new();
        doc.apply_full_state(&seed).unwrap();
        doc
    };

    let mut a = make_peer();
    let mut b = make_peer();
    let mut c = make_peer();

    let ua = a.apply_local_edit(0..0, "alpha ").unwrap();
    let ub = b.apply_local_edit(5..5, "beta ").unwrap();
    let uc = c.apply_local_edit(0..4, "gamma").unwrap();

    let perms: [[&Vec<u8>; 4]; 6] = [
        [&seed, &ua, &ub, &uc],
        [&seed, &ua, &uc, &ub],
        [&seed, &ub, &ua, &uc],
        [&seed, &ub, &uc, &ua],
        [&seed, &uc, &ua, &ub],
        [&seed, &uc, &ub, &ua],
    ];

    let reference = replay(&perms[0]);
    for perm in &perms[1..] {
        assert_eq!(replay(perm), reference, "permutation diverged");
    }
}

#[test]
fn double_apply_is_idempotent() {
    let mut source = SharedDocument::new();
    let update = source.apply_local_edit(0..0, "only once").unwrap();

    let mut doc = SharedDocument::new();
    doc.merge_remote_update(&update).unwrap();
    let once = doc.text();
    doc.merge_remote_update(&update).unwrap();
    assert_eq!(doc.text(), once);
    assert_eq!(once, "only once");
}

#[test]
fn two_peer_concurrent_insert_at_origin() {
    // Peer A inserts "foo" at offset 0; peer B, unaware, inserts "bar"
    // at offset 0 of the same original "hello". Whatever the tie-break,
    // both replicas must agree.
    let seed = SharedDocument::with_text("hello").full_state();

    let mut a = SharedDocument::new();
    a.apply_full_state(&seed).unwrap();
    let mut b = SharedDocument::new();
    b.apply_full_state(&seed).unwrap();

    let ua = a.apply_local_edit(0..0, "foo").unwrap();
    let ub = b.apply_local_edit(0..0, "bar").unwrap();

    a.merge_remote_update(&ub).unwrap();
    b.merge_remote_update(&ua).unwrap();

    assert_eq!(a.text(), b.text());
    assert!(a.text().contains("foo"));
    assert!(a.text().contains("bar"));
    assert!(a.text().contains("hello"));
    assert_eq!(a.len(), "foobarhello".len());
}

#[test]
fn reconnect_resync_catches_up() {
    // A and B are in sync, then A goes offline while B keeps editing.
    let seed = SharedDocument::with_text("fn main() {}\n").full_state();

    let mut a = SharedDocument::new();
    a.apply_full_state(&seed).unwrap();
    let mut b = SharedDocument::new();
    b.apply_full_state(&seed).unwrap();

    // A edits mid-flight; the update never reaches B.
    a.apply_local_edit(0..0, "// offline comment\n").unwrap();

    // B makes 5 further edits.
    for i in 0..5 {
        let at = b.len();
        b.apply_local_edit(at..at, &format!("// edit {i}\n")).unwrap();
    }

    // Reconnect: full snapshots in both directions, no replay.
    b.apply_full_state(&a.full_state()).unwrap();
    a.apply_full_state(&b.full_state()).unwrap();

    assert_eq!(a.text(), b.text());
    assert!(a.text().contains("// offline comment"));
    for i in 0..5 {
        assert_eq!(a.text().matches(&format!("// edit {i}\n")).count(), 1);
    }
}

#[test]
fn interleaved_edit_streams_converge() {
    let seed = SharedDocument::with_text("0123456789").full_state();

    let mut a = SharedDocument::new();
    a.apply_full_state(&seed).unwrap();
    let mut b = SharedDocument::new();
    b.apply_full_state(&seed).unwrap();

    let mut from_a = Vec::new();
    let mut from_b = Vec::new();
    for i in 0..4 {
        from_a.push(a.apply_local_edit(i..i + 1, "A").unwrap());
        from_b.push(b.apply_local_edit(9 - i..10 - i, "B").unwrap());
    }

    // Deliver each peer's stream in order (per-connection guarantee),
    // but interleave the two streams differently on each side.
    for u in &from_b {
        a.merge_remote_update(u).unwrap();
    }
    for (ua, ub) in from_a.iter().zip(&from_b) {
        b.merge_remote_update(ua).unwrap();
        b.merge_remote_update(ub).unwrap(); // duplicates of its own echoes are no-ops
    }

    assert_eq!(a.text(), b.text());
}
