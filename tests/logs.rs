// tests/logs.rs
//
// Broadcast semantics: ordered delivery, bounded replay, blocking tails,
// close-then-drain.

use sandcell::logs::{LogBroadcast, LogRegistry, LogStream};
use std::time::Duration;
use uuid::Uuid;

fn publish_n(b: &std::sync::Arc<LogBroadcast>, n: usize) {
    for i in 0..n {
        b.publish(LogStream::Stdout, format!("chunk-{}", i).into_bytes());
    }
}

#[tokio::test]
async fn subscriber_replays_tail_in_order() {
    let b = LogBroadcast::new(64);
    publish_n(&b, 10);

    let mut sub = b.subscribe(true, true);
    for i in 0..10u64 {
        let chunk = sub.next().await.expect("retained chunk");
        assert_eq!(chunk.seq, i, "monotonic sequence");
        assert_eq!(chunk.data, format!("chunk-{}", i).into_bytes());
    }
    b.close();
    assert!(sub.next().await.is_none(), "drained subscriber sees EOF");
}

#[tokio::test]
async fn late_subscriber_starts_at_ring_floor() {
    let b = LogBroadcast::new(4);
    publish_n(&b, 10); // seqs 0..9, ring retains 6..9

    let mut sub = b.subscribe(true, true);
    let first = sub.next().await.unwrap();
    assert_eq!(first.seq, 6, "late subscriber starts at head - capacity");

    let mut seen = vec![first.seq];
    b.close();
    while let Some(c) = sub.next().await {
        seen.push(c.seq);
    }
    assert_eq!(seen, vec![6, 7, 8, 9]);
}

#[tokio::test]
async fn follow_only_subscriber_skips_history() {
    let b = LogBroadcast::new(64);
    publish_n(&b, 5);

    let mut sub = b.subscribe(false, true);
    b.publish(LogStream::Stderr, b"live".to_vec());
    let chunk = sub.next().await.unwrap();
    assert_eq!(chunk.seq, 5, "history skipped");
    assert_eq!(chunk.stream, LogStream::Stderr);
}

#[tokio::test]
async fn subscriber_blocks_until_publish() {
    let b = LogBroadcast::new(64);
    let mut sub = b.subscribe(true, true);

    let waiter = tokio::spawn(async move { sub.next().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "subscriber must block on an empty ring");

    b.publish(LogStream::Stdout, b"wake".to_vec());
    let chunk = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("woke after publish")
        .unwrap()
        .expect("got the chunk");
    assert_eq!(chunk.data, b"wake".to_vec());
}

#[tokio::test]
async fn attach_after_close_gets_tail_then_eof() {
    let b = LogBroadcast::new(64);
    publish_n(&b, 3);
    b.close();

    let mut sub = b.subscribe(true, true);
    let mut count = 0;
    while let Some(chunk) = sub.next().await {
        assert_eq!(chunk.seq, count);
        count += 1;
    }
    assert_eq!(count, 3, "tail delivered before EOF");
}

#[tokio::test]
async fn publish_after_close_is_dropped() {
    let b = LogBroadcast::new(64);
    publish_n(&b, 2);
    b.close();
    b.publish(LogStream::Stdout, b"late".to_vec());
    assert_eq!(b.head(), 2, "no sequence assigned after close");
}

#[tokio::test]
async fn registry_is_keyed_and_idempotent() {
    let reg = LogRegistry::new(16);
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    let ba1 = reg.open(a);
    let ba2 = reg.open(a);
    ba1.publish(LogStream::Stdout, b"x".to_vec());
    assert_eq!(ba2.head(), 1, "open twice yields the same broadcast");

    assert!(reg.get(&b).is_none(), "unopened job has no broadcast");
    reg.close(&a);
    assert!(reg.get(&a).expect("still resident").is_closed());
}

#[tokio::test]
async fn non_follow_subscriber_stops_at_attach_head() {
    let b = LogBroadcast::new(64);
    publish_n(&b, 4);

    let mut sub = b.subscribe(true, false);
    b.publish(LogStream::Stdout, b"after-attach".to_vec());

    let mut seen = Vec::new();
    while let Some(chunk) = sub.next().await {
        seen.push(chunk.seq);
    }
    assert_eq!(seen, vec![0, 1, 2, 3], "non-follow drains only the attach-time tail");
}

#[tokio::test]
async fn bounded_subscriber_with_evicted_range_terminates() {
    let b = LogBroadcast::new(2);
    publish_n(&b, 2); // seqs 0,1

    // Bounded to [0, 2); later publishes evict that range entirely.
    let mut sub = b.subscribe(true, false);
    publish_n(&b, 4); // seqs 2..5, ring retains 4,5

    // The requested range is gone and the broadcast is still open; the
    // stream must end rather than wait for data that can never arrive.
    let ended = tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .expect("bounded subscriber must not hang on an evicted range");
    assert!(ended.is_none(), "evicted bounded range yields end-of-stream");
}
