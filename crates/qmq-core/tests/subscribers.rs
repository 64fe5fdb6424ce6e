//! Subscriber model: fan-out isolation, promotion without copy, and the
//! channel state machine.

use qmq_core::{ChannelConfig, QueueNode};
use qmq_error::QmqError;
use tempfile::tempdir;

fn open(dir: &std::path::Path) -> QueueNode {
    QueueNode::open(dir, ChannelConfig::default()).expect("open node")
}

#[test]
fn subscriber_isolation() {
    let dir = tempdir().expect("tempdir");
    let mut node = open(dir.path());
    let channel = node.get_channel("c").expect("channel");
    channel.subscribe("").expect("subscribe default");
    channel.subscribe("s1").expect("subscribe s1");
    channel.subscribe("s2").expect("subscribe s2");

    channel.push(b"r1").expect("push");
    let mut buf = Vec::new();
    for subscriber in ["", "s1", "s2"] {
        let storage = channel
            .subscriber_storage(subscriber)
            .expect("subscriber exists");
        assert!(storage.pop(&mut buf).expect("pop"), "{subscriber} first pop");
        assert_eq!(buf, b"r1");
        assert!(
            !storage.pop(&mut buf).expect("pop"),
            "{subscriber} got a duplicate"
        );
    }

    channel.push(b"r2").expect("push");
    for subscriber in ["", "s1", "s2"] {
        let storage = channel
            .subscriber_storage(subscriber)
            .expect("subscriber exists");
        assert!(storage.pop(&mut buf).expect("pop"));
        assert_eq!(buf, b"r2");
    }
}

#[test]
fn promotion_moves_no_records() {
    let dir = tempdir().expect("tempdir");
    let mut node = open(dir.path());
    let channel = node.get_channel("c").expect("channel");
    for i in 0..7u8 {
        channel.push(&[i]).expect("push");
    }
    assert!(!channel.has_subscribers());

    let storage = channel.subscribe("a").expect("subscribe");
    assert_eq!(storage.name().as_str(), "a@c");
    assert_eq!(storage.num_records(), 7);
    let mut buf = Vec::new();
    for i in 0..7u8 {
        assert!(storage.pop(&mut buf).expect("pop"));
        assert_eq!(buf, [i]);
    }
    assert!(channel.has_subscribers());
}

#[test]
fn default_subscriber_promotion_keeps_display_id() {
    let dir = tempdir().expect("tempdir");
    let mut node = open(dir.path());
    let channel = node.get_channel("c").expect("channel");
    channel.push(b"x").expect("push");
    let storage = channel.subscribe("").expect("subscribe");
    assert_eq!(storage.name().as_str(), "@c");
    assert_eq!(storage.display_id(), "c");
}

#[test]
fn later_subscribers_start_empty() {
    let dir = tempdir().expect("tempdir");
    let mut node = open(dir.path());
    let channel = node.get_channel("c").expect("channel");
    channel.subscribe("early").expect("subscribe");
    channel.push(b"before").expect("push");
    let late = channel.subscribe("late").expect("subscribe");
    assert_eq!(late.num_records(), 0);
    channel.push(b"after").expect("push");

    let mut buf = Vec::new();
    let late = channel.subscriber_storage("late").expect("late");
    assert!(late.pop(&mut buf).expect("pop"));
    assert_eq!(buf, b"after");
    assert!(!late.pop(&mut buf).expect("pop"));

    let early = channel.subscriber_storage("early").expect("early");
    assert!(early.pop(&mut buf).expect("pop"));
    assert_eq!(buf, b"before");
    assert!(early.pop(&mut buf).expect("pop"));
    assert_eq!(buf, b"after");
}

#[test]
fn subscribe_twice_returns_the_same_storage() {
    let dir = tempdir().expect("tempdir");
    let mut node = open(dir.path());
    let channel = node.get_channel("c").expect("channel");
    channel.subscribe("s").expect("subscribe");
    channel.push(b"one").expect("push");
    let again = channel.subscribe("s").expect("subscribe again");
    assert_eq!(again.num_records(), 1);
    // Still only one storage.
    assert_eq!(channel.storages().count(), 1);
}

#[test]
fn pop_on_subscribed_channel_is_refused() {
    let dir = tempdir().expect("tempdir");
    let mut node = open(dir.path());
    let channel = node.get_channel("c").expect("channel");
    channel.subscribe("s").expect("subscribe");
    let mut buf = Vec::new();
    let err = channel.pop(&mut buf).unwrap_err();
    assert!(matches!(err, QmqError::HasSubscribers { .. }), "{err}");
}

#[test]
fn storage_unless_subscribed_reflects_state() {
    let dir = tempdir().expect("tempdir");
    let mut node = open(dir.path());
    let channel = node.get_channel("c").expect("channel");
    assert!(channel.is_reset());
    assert!(channel.storage_unless_subscribed().is_none());

    channel.push(b"x").expect("push");
    assert!(channel.storage_unless_subscribed().is_some());

    channel.subscribe("s").expect("subscribe");
    assert!(channel.storage_unless_subscribed().is_none());
}

#[test]
fn reset_returns_channel_to_reset_state() {
    let dir = tempdir().expect("tempdir");
    let mut node = open(dir.path());
    let channel = node.get_channel("c").expect("channel");
    channel.subscribe("s1").expect("subscribe");
    channel.subscribe("s2").expect("subscribe");
    channel.push(b"data").expect("push");
    channel.reset().expect("reset");
    assert!(channel.is_reset());
    assert!(!channel.has_subscribers());
    assert_eq!(channel.num_records(), 0);

    // The next push recreates an anonymous storage.
    channel.push(b"fresh").expect("push");
    let mut buf = Vec::new();
    assert!(channel.pop(&mut buf).expect("pop"));
    assert_eq!(buf, b"fresh");
}

#[test]
fn subscriber_counts_sum_at_channel_level() {
    let dir = tempdir().expect("tempdir");
    let mut node = open(dir.path());
    let channel = node.get_channel("c").expect("channel");
    channel.subscribe("a").expect("subscribe");
    channel.subscribe("b").expect("subscribe");
    channel.push(b"12345").expect("push");
    assert_eq!(channel.num_records(), 2);
    assert_eq!(channel.num_bytes(), 10);
}

#[test]
fn subscriber_storages_survive_restart() {
    let dir = tempdir().expect("tempdir");
    {
        let mut node = open(dir.path());
        let channel = node.get_channel("c").expect("channel");
        channel.subscribe("a").expect("subscribe");
        channel.subscribe("b").expect("subscribe");
        channel.push(b"payload").expect("push");
        let mut buf = Vec::new();
        channel
            .subscriber_storage("a")
            .expect("a")
            .pop(&mut buf)
            .expect("pop");
        node.close();
    }
    let mut node = open(dir.path());
    let channel = node.get_channel("c").expect("channel");
    assert!(channel.has_subscribers());
    let mut buf = Vec::new();
    assert!(!channel
        .subscriber_storage("a")
        .expect("a")
        .pop(&mut buf)
        .expect("pop"));
    assert!(channel
        .subscriber_storage("b")
        .expect("b")
        .pop(&mut buf)
        .expect("pop"));
    assert_eq!(buf, b"payload");
}

#[test]
fn invalid_subscriber_names_rejected() {
    let dir = tempdir().expect("tempdir");
    let mut node = open(dir.path());
    let channel = node.get_channel("c").expect("channel");
    assert!(channel.subscribe("has@at").is_err());
    assert!(channel.subscribe("sp ace").is_err());
}
