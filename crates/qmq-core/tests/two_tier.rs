//! Property coverage of the two-tier storage: any traffic pattern over a
//! tiny ring must behave exactly like an unbounded FIFO.

use std::collections::VecDeque;

use proptest::prelude::*;
use qmq_core::{ChannelConfig, QueueNode};
use tempfile::tempdir;

#[derive(Debug, Clone)]
enum Op {
    Push(Vec<u8>),
    Pop,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => prop::collection::vec(any::<u8>(), 0..40).prop_map(Op::Push),
        2 => Just(Op::Pop),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn two_tier_storage_is_a_fifo(ops in prop::collection::vec(op_strategy(), 1..100)) {
        let dir = tempdir().expect("tempdir");
        // A 64-byte ring forces constant spilling and tier transitions.
        let config = ChannelConfig {
            default_capacity: 64,
            ..Default::default()
        };
        let mut node = QueueNode::open(dir.path(), config).expect("open");
        let mut model: VecDeque<Vec<u8>> = VecDeque::new();
        let mut buf = Vec::new();

        for op in ops {
            match op {
                Op::Push(payload) => {
                    node.get_channel("ch").expect("channel").push(&payload).expect("push");
                    model.push_back(payload);
                }
                Op::Pop => {
                    let got = node
                        .get_channel("ch")
                        .expect("channel")
                        .pop(&mut buf)
                        .expect("pop");
                    match model.pop_front() {
                        Some(expected) => {
                            prop_assert!(got);
                            prop_assert_eq!(&buf, &expected);
                        }
                        None => prop_assert!(!got),
                    }
                }
            }
            prop_assert_eq!(node.num_records(), model.len() as u64);
        }

        while let Some(expected) = model.pop_front() {
            prop_assert!(node.get_channel("ch").expect("channel").pop(&mut buf).expect("pop"));
            prop_assert_eq!(&buf, &expected);
        }
    }

    #[test]
    fn restart_preserves_the_queue(payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..40), 1..30), popped in 0usize..10) {
        let dir = tempdir().expect("tempdir");
        let config = ChannelConfig {
            default_capacity: 96,
            ..Default::default()
        };
        let popped = popped.min(payloads.len());
        {
            let mut node = QueueNode::open(dir.path(), config.clone()).expect("open");
            let mut buf = Vec::new();
            for payload in &payloads {
                node.get_channel("ch").expect("channel").push(payload).expect("push");
            }
            for expected in payloads.iter().take(popped) {
                prop_assert!(node.get_channel("ch").expect("channel").pop(&mut buf).expect("pop"));
                prop_assert_eq!(&buf, expected);
            }
            node.close();
        }
        let mut node = QueueNode::open(dir.path(), config).expect("reopen");
        let mut buf = Vec::new();
        for expected in payloads.iter().skip(popped) {
            prop_assert!(node.get_channel("ch").expect("channel").pop(&mut buf).expect("pop"));
            prop_assert_eq!(&buf, expected);
        }
        prop_assert!(!node.get_channel("ch").expect("channel").pop(&mut buf).expect("pop"));
    }
}
