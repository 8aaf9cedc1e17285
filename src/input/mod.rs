//! Touch-point routing and keyboard focus
//!
//! Pure routing state for the single default seat. The host injects touch
//! and key events through the compositor root; this module decides which
//! view (if any) receives each event and how host keycodes translate to
//! the evdev codes clients expect. Wire delivery stays in the server layer.

use std::collections::HashMap;

use log::{debug, trace};

use crate::view::ViewId;

/// Tracks which view captured each active touch point.
///
/// A view holds at most one point; registering a second point for the same
/// view supersedes the first, mirroring the per-view capture slot.
#[derive(Debug, Default)]
pub struct TouchRegistry {
    points: HashMap<i32, ViewId>,
}

impl TouchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a point against a view. Returns false for a duplicate
    /// point id, which callers drop as spurious.
    pub fn register(&mut self, point: i32, view: ViewId) -> bool {
        if self.points.contains_key(&point) {
            debug!("Touch point {} already down, ignoring", point);
            return false;
        }
        // Enforce one captured point per view.
        self.points.retain(|_, v| *v != view);
        self.points.insert(point, view);
        trace!("Touch point {} captured by view {}", point, view);
        true
    }

    /// View currently capturing a point, if any.
    pub fn route(&self, point: i32) -> Option<ViewId> {
        self.points.get(&point).copied()
    }

    /// Removes a point, returning the view that held it.
    pub fn deregister(&mut self, point: i32) -> Option<ViewId> {
        self.points.remove(&point)
    }

    pub fn active_points(&self) -> usize {
        self.points.len()
    }
}

/// Outcome of a focus reassignment, naming the views that need
/// wl_keyboard leave and enter.
#[derive(Debug, PartialEq, Eq)]
pub struct FocusChange {
    pub leave: Option<ViewId>,
    pub enter: Option<ViewId>,
}

/// Host-assigned keyboard focus plus keycode translation.
#[derive(Debug)]
pub struct KeyFocus {
    focus: Option<ViewId>,
    keycode_offset: u32,
}

impl KeyFocus {
    pub fn new(keycode_offset: u32) -> Self {
        Self {
            focus: None,
            keycode_offset,
        }
    }

    pub fn focused(&self) -> Option<ViewId> {
        self.focus
    }

    /// Moves focus, reporting which enter/leave events are due. Setting
    /// the same focus twice is a no-op.
    pub fn set_focus(&mut self, view: Option<ViewId>) -> Option<FocusChange> {
        if self.focus == view {
            return None;
        }
        let leave = self.focus.take();
        self.focus = view;
        Some(FocusChange { leave, enter: view })
    }

    /// Clears focus if it points at the given view, as on view teardown.
    pub fn clear_if_focused(&mut self, view: ViewId) -> bool {
        if self.focus == Some(view) {
            self.focus = None;
            true
        } else {
            false
        }
    }

    /// Translates a host X-style keycode to the evdev code clients expect.
    /// Codes below the offset have no evdev equivalent and are dropped.
    pub fn translate(&self, keycode: u32) -> Option<u32> {
        keycode.checked_sub(self.keycode_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_route() {
        let mut touch = TouchRegistry::new();
        assert!(touch.register(0, 1));
        assert!(touch.register(1, 2));
        assert_eq!(touch.route(0), Some(1));
        assert_eq!(touch.route(1), Some(2));
        assert_eq!(touch.route(2), None);
    }

    #[test]
    fn test_duplicate_point_is_spurious() {
        let mut touch = TouchRegistry::new();
        assert!(touch.register(0, 1));
        assert!(!touch.register(0, 2));
        assert_eq!(touch.route(0), Some(1));
    }

    #[test]
    fn test_second_point_on_view_supersedes() {
        let mut touch = TouchRegistry::new();
        assert!(touch.register(0, 1));
        assert!(touch.register(5, 1));
        assert_eq!(touch.route(0), None);
        assert_eq!(touch.route(5), Some(1));
        assert_eq!(touch.active_points(), 1);
    }

    #[test]
    fn test_deregister_returns_owner() {
        let mut touch = TouchRegistry::new();
        touch.register(3, 9);
        assert_eq!(touch.deregister(3), Some(9));
        assert_eq!(touch.deregister(3), None);
    }

    #[test]
    fn test_focus_change_reports_enter_and_leave() {
        let mut keys = KeyFocus::new(8);
        assert_eq!(
            keys.set_focus(Some(4)),
            Some(FocusChange {
                leave: None,
                enter: Some(4),
            })
        );
        assert_eq!(
            keys.set_focus(Some(7)),
            Some(FocusChange {
                leave: Some(4),
                enter: Some(7),
            })
        );
        assert_eq!(
            keys.set_focus(None),
            Some(FocusChange {
                leave: Some(7),
                enter: None,
            })
        );
    }

    #[test]
    fn test_focus_same_view_is_noop() {
        let mut keys = KeyFocus::new(8);
        keys.set_focus(Some(4));
        assert_eq!(keys.set_focus(Some(4)), None);
        assert_eq!(keys.focused(), Some(4));
    }

    #[test]
    fn test_clear_if_focused() {
        let mut keys = KeyFocus::new(8);
        keys.set_focus(Some(4));
        assert!(!keys.clear_if_focused(5));
        assert!(keys.clear_if_focused(4));
        assert_eq!(keys.focused(), None);
    }

    #[test]
    fn test_keycode_translation() {
        let keys = KeyFocus::new(8);
        assert_eq!(keys.translate(38), Some(30));
        assert_eq!(keys.translate(8), Some(0));
        assert_eq!(keys.translate(3), None);
    }
}
