//! Property-based tests for the shell session state machine
//!
//! Random configure/ack/commit/destroy interleavings must preserve the
//! handshake invariants: a completion callback fires at most once, only for
//! the serial of the most recent configure, and never after teardown.

use super::*;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Configure { width: u32, height: u32 },
    AckLatest,
    AckSerial(u32),
    Commit,
    Destroy,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1u32..4096, 1u32..4096).prop_map(|(width, height)| Op::Configure { width, height }),
        3 => Just(Op::AckLatest),
        1 => (0u32..64u32).prop_map(Op::AckSerial),
        2 => Just(Op::Commit),
        1 => Just(Op::Destroy),
    ]
}

proptest! {
    #[test]
    fn handshake_invariants(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let mut mgr = ShellSessionManager::new();
        let id = mgr.request_surface(1, 10).expect("bind surface");
        let fired: Arc<Mutex<Vec<(u32, u32)>>> = Arc::new(Mutex::new(Vec::new()));

        // Mirror of what the manager should be doing.
        let mut destroyed = false;
        let mut latest: Option<PendingConfigure> = None;
        let mut callback_pending = false;
        let mut expected_fires: Vec<(u32, u32)> = Vec::new();
        let mut was_mapped = false;

        for op in ops {
            match op {
                Op::Configure { width, height } => {
                    let fired_cb = fired.clone();
                    let result = mgr.configure(
                        id,
                        width,
                        height,
                        Some(Box::new(move |w, h| fired_cb.lock().push((w, h)))),
                    );
                    if destroyed {
                        prop_assert!(result.is_err());
                    } else {
                        let pending = result.expect("configure on live session");
                        prop_assert_eq!(pending.width, width);
                        prop_assert_eq!(pending.height, height);
                        if let Some(prev) = latest {
                            prop_assert!(pending.serial > prev.serial);
                        }
                        latest = Some(pending);
                        callback_pending = true;
                    }
                }
                Op::AckLatest => {
                    let serial = latest.map(|p| p.serial).unwrap_or(0);
                    let result = mgr.ack_configure(10, serial);
                    if !destroyed && callback_pending {
                        let p = latest.unwrap();
                        prop_assert_eq!(result, Some((p.width, p.height)));
                        expected_fires.push((p.width, p.height));
                        callback_pending = false;
                    } else {
                        prop_assert_eq!(result, None);
                    }
                }
                Op::AckSerial(serial) => {
                    let result = mgr.ack_configure(10, serial);
                    let matches_latest =
                        !destroyed && callback_pending && latest.map(|p| p.serial) == Some(serial);
                    if matches_latest {
                        let p = latest.unwrap();
                        prop_assert_eq!(result, Some((p.width, p.height)));
                        expected_fires.push((p.width, p.height));
                        callback_pending = false;
                    } else {
                        prop_assert_eq!(result, None);
                    }
                }
                Op::Commit => {
                    let outcome = mgr.commit(10);
                    if destroyed {
                        prop_assert_eq!(outcome, CommitOutcome::Ignored);
                    } else if was_mapped {
                        prop_assert_eq!(outcome, CommitOutcome::AlreadyMapped);
                    } else {
                        prop_assert_eq!(outcome, CommitOutcome::Mapped);
                        was_mapped = true;
                    }
                }
                Op::Destroy => {
                    let result = mgr.destroy_surface(10);
                    if destroyed {
                        prop_assert_eq!(result, None);
                    } else {
                        prop_assert_eq!(result, Some(id));
                        destroyed = true;
                        callback_pending = false;
                        latest = None;
                    }
                }
            }
        }

        // Every fire observed by the callbacks matches the model, in order.
        prop_assert_eq!(fired.lock().clone(), expected_fires);
    }

    #[test]
    fn serials_strictly_increase(sizes in prop::collection::vec((1u32..10_000, 1u32..10_000), 1..64)) {
        let mut mgr = ShellSessionManager::new();
        let id = mgr.request_surface(1, 10).expect("bind surface");
        let mut last = 0u32;
        for (w, h) in sizes {
            let pending = mgr.configure(id, w, h, None).expect("configure");
            prop_assert!(pending.serial > last);
            last = pending.serial;
        }
    }
}
