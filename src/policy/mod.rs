//! Window-policy side table
//!
//! Surface-keyed visibility records for policy-interested subscribers. The
//! registry is owned by the compositor instance rather than living in a
//! process-wide global, so several instances can coexist in one test
//! process. Records exist only while at least one subscriber holds a
//! reference; visibility pushes for unsubscribed surfaces fall through to
//! the view's own hint and are not recorded here.

use std::collections::HashMap;

use log::{debug, trace};

use crate::shell::SurfaceKey;

/// Opaque handle for one policy subscriber of one surface.
pub type SubscriberId = u64;

/// Visibility state pushed to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Visibility {
    Unobscured = 0,
    PartiallyObscured = 1,
    FullyObscured = 2,
}

/// A queued visibility push for a single subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibilityNotice {
    pub surface: SurfaceKey,
    pub subscriber: SubscriberId,
    pub state: Visibility,
}

#[derive(Debug, Default)]
struct PolicyRecord {
    subscribers: Vec<SubscriberId>,
    visibility: Option<Visibility>,
}

/// Reference-counted per-surface policy records.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    records: HashMap<SurfaceKey, PolicyRecord>,
    pending: Vec<VisibilityNotice>,
    next_subscriber: SubscriberId,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or references the record for a surface, returning the
    /// subscriber handle to pass back to [`unref`](Self::unref).
    pub fn get_or_ref(&mut self, surface: SurfaceKey) -> SubscriberId {
        self.next_subscriber += 1;
        let id = self.next_subscriber;
        let record = self.records.entry(surface).or_default();
        record.subscribers.push(id);
        trace!(
            "Policy record for surface {} now has {} subscribers",
            surface,
            record.subscribers.len()
        );
        id
    }

    /// Drops one subscriber. The record itself is dropped when the last
    /// subscriber goes away. Unknown pairs are a safe no-op.
    pub fn unref(&mut self, surface: SurfaceKey, subscriber: SubscriberId) -> bool {
        let Some(record) = self.records.get_mut(&surface) else {
            return false;
        };
        let Some(pos) = record.subscribers.iter().position(|s| *s == subscriber) else {
            return false;
        };
        record.subscribers.remove(pos);
        if record.subscribers.is_empty() {
            self.records.remove(&surface);
            debug!("Policy record for surface {} dropped", surface);
        }
        true
    }

    /// Stores a visibility state and queues one notice per subscriber.
    /// Re-setting the current state queues nothing. Returns the number of
    /// notices queued.
    pub fn set_visibility(&mut self, surface: SurfaceKey, state: Visibility) -> usize {
        let Some(record) = self.records.get_mut(&surface) else {
            return 0;
        };
        if record.visibility == Some(state) {
            return 0;
        }
        record.visibility = Some(state);
        for subscriber in &record.subscribers {
            self.pending.push(VisibilityNotice {
                surface,
                subscriber: *subscriber,
                state,
            });
        }
        record.subscribers.len()
    }

    pub fn visibility(&self, surface: SurfaceKey) -> Option<Visibility> {
        self.records.get(&surface).and_then(|r| r.visibility)
    }

    pub fn subscriber_count(&self, surface: SurfaceKey) -> usize {
        self.records.get(&surface).map_or(0, |r| r.subscribers.len())
    }

    /// Surface teardown drops the record regardless of reference count.
    pub fn surface_destroyed(&mut self, surface: SurfaceKey) {
        if self.records.remove(&surface).is_some() {
            debug!("Policy record for destroyed surface {} dropped", surface);
        }
        self.pending.retain(|n| n.surface != surface);
    }

    /// Drains queued notices in arrival order.
    pub fn take_notifications(&mut self) -> Vec<VisibilityNotice> {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_and_unref_lifecycle() {
        let mut policy = PolicyRegistry::new();
        let a = policy.get_or_ref(1);
        let b = policy.get_or_ref(1);
        assert_eq!(policy.subscriber_count(1), 2);

        assert!(policy.unref(1, a));
        assert_eq!(policy.subscriber_count(1), 1);
        assert!(policy.unref(1, b));
        assert_eq!(policy.subscriber_count(1), 0);
        // Record is gone entirely.
        assert_eq!(policy.visibility(1), None);
    }

    #[test]
    fn test_unref_unknown_pair_is_noop() {
        let mut policy = PolicyRegistry::new();
        let a = policy.get_or_ref(1);
        assert!(!policy.unref(2, a));
        assert!(!policy.unref(1, 999));
        assert_eq!(policy.subscriber_count(1), 1);
    }

    #[test]
    fn test_set_visibility_notifies_each_subscriber() {
        let mut policy = PolicyRegistry::new();
        let a = policy.get_or_ref(1);
        let b = policy.get_or_ref(1);

        assert_eq!(policy.set_visibility(1, Visibility::FullyObscured), 2);
        let notices = policy.take_notifications();
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0].subscriber, a);
        assert_eq!(notices[1].subscriber, b);
        assert!(notices.iter().all(|n| n.state == Visibility::FullyObscured));
    }

    #[test]
    fn test_same_state_twice_is_deduplicated() {
        let mut policy = PolicyRegistry::new();
        policy.get_or_ref(1);

        assert_eq!(policy.set_visibility(1, Visibility::Unobscured), 1);
        assert_eq!(policy.set_visibility(1, Visibility::Unobscured), 0);
        assert_eq!(policy.take_notifications().len(), 1);

        assert_eq!(policy.set_visibility(1, Visibility::PartiallyObscured), 1);
        assert_eq!(policy.take_notifications().len(), 1);
    }

    #[test]
    fn test_unsubscribed_surface_is_passthrough() {
        let mut policy = PolicyRegistry::new();
        assert_eq!(policy.set_visibility(42, Visibility::Unobscured), 0);
        assert_eq!(policy.visibility(42), None);
        assert!(policy.take_notifications().is_empty());
    }

    #[test]
    fn test_surface_destroy_drops_record_and_pending() {
        let mut policy = PolicyRegistry::new();
        policy.get_or_ref(1);
        policy.get_or_ref(2);
        policy.set_visibility(1, Visibility::FullyObscured);
        policy.set_visibility(2, Visibility::FullyObscured);

        policy.surface_destroyed(1);
        assert_eq!(policy.subscriber_count(1), 0);

        let notices = policy.take_notifications();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].surface, 2);
    }

    #[test]
    fn test_resubscribe_starts_clean() {
        let mut policy = PolicyRegistry::new();
        let a = policy.get_or_ref(1);
        policy.set_visibility(1, Visibility::FullyObscured);
        policy.unref(1, a);

        policy.get_or_ref(1);
        assert_eq!(policy.visibility(1), None);
        // The stale state does not suppress a fresh push.
        policy.take_notifications();
        assert_eq!(policy.set_visibility(1, Visibility::FullyObscured), 1);
    }
}
