// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use proptest::prelude::*;

use super::{Queue, QueueError};
use crate::event::{AlertEvent, Severity, TripwireType};

fn event(rule: &str) -> AlertEvent {
    AlertEvent::observed(
        TripwireType::File,
        rule,
        Severity::Info,
        serde_json::json!({"path": "/etc/hosts", "op": "modify"}),
    )
}

#[test]
fn enqueue_assigns_monotonic_seqs() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let queue = Queue::open(&dir.path().join("queue.jsonl"))?;

    let a = queue.enqueue(&event("a"))?;
    let b = queue.enqueue(&event("b"))?;
    let c = queue.enqueue(&event("c"))?;
    assert!(a < b && b < c);
    assert_eq!(queue.depth(), 3);
    Ok(())
}

#[test]
fn dequeue_returns_oldest_first_without_removing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let queue = Queue::open(&dir.path().join("queue.jsonl"))?;
    for name in ["r1", "r2", "r3"] {
        queue.enqueue(&event(name))?;
    }

    let batch = queue.dequeue(2)?;
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].1.rule_name, "r1");
    assert_eq!(batch[1].1.rule_name, "r2");
    // Not removed.
    assert_eq!(queue.depth(), 3);
    let again = queue.dequeue(10)?;
    assert_eq!(again.len(), 3);
    Ok(())
}

#[test]
fn ack_removes_and_is_idempotent() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let queue = Queue::open(&dir.path().join("queue.jsonl"))?;
    let a = queue.enqueue(&event("a"))?;
    let b = queue.enqueue(&event("b"))?;

    queue.ack(&[a])?;
    assert_eq!(queue.depth(), 1);
    // Acking again (and acking unknowns) is a no-op.
    queue.ack(&[a, 9999])?;
    assert_eq!(queue.depth(), 1);

    queue.ack(&[b])?;
    assert_eq!(queue.depth(), 0);
    Ok(())
}

#[test]
fn pending_events_survive_reopen_in_order() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("queue.jsonl");

    let first_seq;
    {
        let queue = Queue::open(&path)?;
        first_seq = queue.enqueue(&event("r1"))?;
        queue.enqueue(&event("r2"))?;
        queue.enqueue(&event("r3"))?;
        queue.ack(&[first_seq])?;
        // Dropped without close(): simulates a crash after fsync.
    }

    let queue = Queue::open(&path)?;
    assert_eq!(queue.depth(), 2);
    let batch = queue.dequeue(10)?;
    assert_eq!(batch[0].1.rule_name, "r2");
    assert_eq!(batch[1].1.rule_name, "r3");

    // New enqueues continue past the recovered max seq.
    let next = queue.enqueue(&event("r4"))?;
    assert!(next > batch[1].0);
    Ok(())
}

#[test]
fn alert_ids_survive_redelivery() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("queue.jsonl");

    let mut e = event("r1");
    e.alert_id = uuid::Uuid::new_v4();
    {
        let queue = Queue::open(&path)?;
        queue.enqueue(&e)?;
    }

    let queue = Queue::open(&path)?;
    let batch = queue.dequeue(1)?;
    assert_eq!(batch[0].1.alert_id, e.alert_id);
    Ok(())
}

#[test]
fn corrupt_lines_are_skipped() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("queue.jsonl");

    {
        let queue = Queue::open(&path)?;
        queue.enqueue(&event("good-1"))?;
        queue.enqueue(&event("good-2"))?;
    }
    // Append garbage between valid records.
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path)?;
        writeln!(f, "{{not json")?;
    }
    {
        let queue = Queue::open(&path)?;
        assert_eq!(queue.depth(), 2);
        queue.enqueue(&event("good-3"))?;
        assert_eq!(queue.depth(), 3);
    }
    Ok(())
}

#[test]
fn compaction_drops_tombstones_but_keeps_pending() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("queue.jsonl");
    let queue = Queue::open_compacting_every(&path, 4)?;

    let mut seqs = Vec::new();
    for i in 0..6 {
        seqs.push(queue.enqueue(&event(&format!("r{i}")))?);
    }
    // Ack enough to cross the threshold.
    queue.ack(&seqs[..5])?;
    assert_eq!(queue.depth(), 1);

    // After compaction the file holds only the single pending record.
    let contents = std::fs::read_to_string(&path)?;
    assert_eq!(contents.lines().count(), 1);
    assert!(contents.contains("r5"));

    // The compacted file is still a valid queue.
    drop(queue);
    let queue = Queue::open(&path)?;
    assert_eq!(queue.depth(), 1);
    assert_eq!(queue.dequeue(1)?[0].1.rule_name, "r5");
    Ok(())
}

#[test]
fn closed_queue_rejects_writes() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let queue = Queue::open(&dir.path().join("queue.jsonl"))?;
    queue.enqueue(&event("a"))?;
    queue.close()?;

    assert!(matches!(queue.enqueue(&event("b")), Err(QueueError::Closed)));
    assert!(matches!(queue.ack(&[1]), Err(QueueError::Closed)));
    // Close is idempotent; depth still readable.
    queue.close()?;
    assert_eq!(queue.depth(), 1);
    Ok(())
}

proptest! {
    // FIFO across arbitrary ack interleavings and a reopen: whatever is
    // left pending is dequeued in enqueue order.
    #[test]
    fn fifo_preserved_across_restart(
        total in 1usize..40,
        ack_mask in proptest::collection::vec(any::<bool>(), 40),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.jsonl");

        let mut kept = Vec::new();
        {
            let queue = Queue::open(&path).unwrap();
            let mut seqs = Vec::new();
            for i in 0..total {
                seqs.push(queue.enqueue(&event(&format!("rule-{i}"))).unwrap());
            }
            let acked: Vec<u64> = seqs
                .iter()
                .zip(ack_mask.iter())
                .filter_map(|(&s, &a)| a.then_some(s))
                .collect();
            queue.ack(&acked).unwrap();
            for (i, &s) in seqs.iter().enumerate() {
                if !acked.contains(&s) {
                    kept.push((s, format!("rule-{i}")));
                }
            }
        }

        let queue = Queue::open(&path).unwrap();
        prop_assert_eq!(queue.depth(), kept.len());
        let batch = queue.dequeue(usize::MAX).unwrap();
        let got: Vec<(u64, String)> =
            batch.into_iter().map(|(s, e)| (s, e.rule_name)).collect();
        prop_assert_eq!(got, kept);
    }
}
