//! Per-frame gesture interpretation.
//!
//! [`GestureInterpreter::step`] takes one landmark frame plus the caller-owned
//! [`InterpreterState`] and yields exactly one [`GestureEvent`]. Rules are
//! checked in priority order, first match wins:
//!
//! 1. pinch click (thumb/index latch with hysteresis)
//! 2. open-palm reset (cooldown)
//! 3. post-click lockout (swallows settling motion)
//! 4. two-hand zoom
//! 5. two-finger pan
//! 6. one-finger rotate

use log::{debug, trace};

use crate::config::Thresholds;
use crate::fingers::{self, FingerStates};
use crate::landmarks::{HandFrame, LandmarkFrame, Point};
use crate::smoothing::MotionFilter;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GestureEvent {
    Rotate { dx: f32, dy: f32 },
    Pan { dx: f32, dy: f32 },
    Zoom { delta: f32 },
    Reset,
    /// Normalized image coordinates of the index tip.
    Click { x: f32, y: f32 },
    /// No camera change this frame.
    None,
}

impl GestureEvent {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Rotate { .. } => "rotate",
            Self::Pan { .. } => "pan",
            Self::Zoom { .. } => "zoom",
            Self::Reset => "reset",
            Self::Click { .. } => "click",
            Self::None => "none",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Cross-frame state. Owned by whoever drives the interpreter and handed to
/// every [`GestureInterpreter::step`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterpreterState {
    pub last_fingertip: Option<Point>,
    pub smoothed_velocity: (f32, f32),
    pub last_pinch_distance: Option<f32>,
    pub pinch_engaged: bool,
    pub last_click_ms: Option<u64>,
    pub last_reset_ms: Option<u64>,
    /// Last non-`None` gesture, for status display.
    pub active_label: Option<&'static str>,
}

impl InterpreterState {
    /// Zero hands in view. Click/reset timestamps survive so cooldowns
    /// can't be dodged by hiding the hand.
    fn on_tracking_lost(&mut self) {
        self.last_fingertip = None;
        self.smoothed_velocity = (0.0, 0.0);
        self.last_pinch_distance = None;
        self.pinch_engaged = false;
        self.active_label = None;
    }
}

#[derive(Debug, Clone)]
pub struct GestureInterpreter {
    th: Thresholds,
    filter: MotionFilter,
}

impl GestureInterpreter {
    pub fn new(th: Thresholds) -> Self {
        let filter = MotionFilter::new(th.deadzone, th.smoothing_alpha);
        Self { th, filter }
    }

    pub fn set_thresholds(&mut self, th: Thresholds) {
        *self = Self::new(th);
    }

    pub fn step(
        &self,
        state: &mut InterpreterState,
        frame: &LandmarkFrame,
        now_ms: u64,
    ) -> GestureEvent {
        let Some(primary) = frame.hands.first() else {
            if state.last_fingertip.is_some() || state.active_label.is_some() {
                debug!("tracking lost");
            }
            state.on_tracking_lost();
            return GestureEvent::None;
        };

        match fingers::index_tip(primary) {
            Some(tip) => {
                state.smoothed_velocity =
                    self.filter
                        .update(state.last_fingertip, tip, state.smoothed_velocity);
                state.last_fingertip = Some(tip);
            }
            // restart displacement from zero once the tip is seen again
            None => state.last_fingertip = None,
        }

        if frame.hands.len() != 2 {
            state.last_pinch_distance = None;
        }

        let event = self.classify(state, &frame.hands, now_ms);
        if !event.is_none() {
            state.active_label = Some(event.label());
        }
        trace!("t={now_ms} {event:?}");
        event
    }

    fn classify(
        &self,
        state: &mut InterpreterState,
        hands: &[HandFrame],
        now_ms: u64,
    ) -> GestureEvent {
        let th = &self.th;
        let primary = &hands[0];
        let ext = FingerStates::classify(primary, th.extension_margin);

        if let (Some(d), Some(tip)) = (fingers::pinch_distance(primary), fingers::index_tip(primary))
        {
            if d > th.pinch_release {
                state.pinch_engaged = false;
            } else if d < th.pinch_engage && !state.pinch_engaged {
                state.pinch_engaged = true;
                state.last_click_ms = Some(now_ms);
                return GestureEvent::Click { x: tip.x, y: tip.y };
            }
        }

        if ext.open_palm() {
            let ready = state
                .last_reset_ms
                .is_none_or(|t| now_ms.saturating_sub(t) >= th.reset_cooldown_ms);
            if !ready {
                return GestureEvent::None;
            }
            state.last_reset_ms = Some(now_ms);
            return GestureEvent::Reset;
        }

        if let Some(t) = state.last_click_ms {
            if now_ms.saturating_sub(t) < th.click_lockout_ms {
                return GestureEvent::None;
            }
        }

        if hands.len() == 2 {
            return self.zoom(state, &hands[0], &hands[1]);
        }

        let (vx, vy) = state.smoothed_velocity;
        if ext.two_finger() {
            let gain = th.rotate_gain * th.pan_factor;
            return GestureEvent::Pan {
                dx: -vx * gain,
                dy: vy * gain,
            };
        }
        if ext.one_finger() {
            return GestureEvent::Rotate {
                dx: -vx * th.rotate_gain,
                dy: vy * th.rotate_gain,
            };
        }
        GestureEvent::None
    }

    /// Two hands own the frame: below-threshold changes still update the
    /// stored distance but emit nothing.
    fn zoom(&self, state: &mut InterpreterState, a: &HandFrame, b: &HandFrame) -> GestureEvent {
        let (Some(ta), Some(tb)) = (fingers::index_tip(a), fingers::index_tip(b)) else {
            state.last_pinch_distance = None;
            return GestureEvent::None;
        };
        let dist = ta.distance(&tb);
        match state.last_pinch_distance.replace(dist) {
            Some(prev) => {
                let delta = (dist - prev) * self.th.zoom_gain;
                if delta.abs() > self.th.zoom_min_delta {
                    GestureEvent::Zoom { delta }
                } else {
                    GestureEvent::None
                }
            }
            None => GestureEvent::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Profile;
    use crate::landmarks::idx;
    use crate::landmarks::testing::{frame, hand};

    fn thresholds() -> Thresholds {
        Profile::builtin().unwrap().thresholds
    }

    fn interp() -> GestureInterpreter {
        GestureInterpreter::new(thresholds())
    }

    /// A hand with the given fingers extended, shifted by `(ox, oy)`.
    /// The thumb sits `thumb_gap` away from the index tip.
    fn pose(ext: [bool; 4], ox: f32, oy: f32, thumb_gap: f32) -> HandFrame {
        let fingers = [
            (idx::INDEX_DIP, idx::INDEX_TIP, 0.40),
            (idx::MIDDLE_DIP, idx::MIDDLE_TIP, 0.47),
            (idx::RING_DIP, idx::RING_TIP, 0.54),
            (idx::PINKY_DIP, idx::PINKY_TIP, 0.61),
        ];
        let mut pts = vec![(idx::WRIST, 0.5 + ox, 0.9 + oy)];
        for (i, (dip, tip, x)) in fingers.into_iter().enumerate() {
            pts.push((dip, x + ox, 0.6 + oy));
            let tip_y = if ext[i] { 0.5 } else { 0.68 };
            pts.push((tip, x + ox, tip_y + oy));
        }
        let index_tip_y = if ext[0] { 0.5 } else { 0.68 };
        pts.push((idx::THUMB_TIP, 0.40 + ox - thumb_gap, index_tip_y + oy));
        hand(&pts)
    }

    const FAR: f32 = 0.3;
    const ONE: [bool; 4] = [true, false, false, false];
    const TWO: [bool; 4] = [true, true, false, false];
    const PALM: [bool; 4] = [true, true, true, true];
    const FIST: [bool; 4] = [false, false, false, false];

    #[test]
    fn scenario_a_two_finger_pan_scaled_and_mirrored() {
        let it = interp();
        let th = thresholds();
        let mut st = InterpreterState {
            smoothed_velocity: (0.02, -0.01),
            ..Default::default()
        };
        let ev = it.classify(&mut st, &[pose(TWO, 0.0, 0.0, FAR)], 5_000);
        let g = th.rotate_gain * 1.5;
        match ev {
            GestureEvent::Pan { dx, dy } => {
                assert!((dx - (-0.02 * g)).abs() < 1e-3, "dx={dx}");
                assert!((dy - (-0.01 * g)).abs() < 1e-3, "dy={dy}");
            }
            other => panic!("expected pan, got {other:?}"),
        }
    }

    #[test]
    fn scenario_b_two_hand_zoom() {
        let it = interp();
        let mut st = InterpreterState::default();
        let left = |x: f32| hand(&[(idx::INDEX_TIP, x, 0.5)]);

        let first = frame(0, vec![left(0.40), left(0.48)]);
        assert_eq!(it.step(&mut st, &first, 0), GestureEvent::None);
        assert!((st.last_pinch_distance.unwrap() - 0.08).abs() < 1e-6);

        let second = frame(33, vec![left(0.40), left(0.50)]);
        match it.step(&mut st, &second, 33) {
            GestureEvent::Zoom { delta } => assert!((delta - 0.4).abs() < 1e-4, "delta={delta}"),
            other => panic!("expected zoom, got {other:?}"),
        }
        assert!((st.last_pinch_distance.unwrap() - 0.10).abs() < 1e-6);
    }

    #[test]
    fn small_zoom_changes_are_suppressed_but_tracked() {
        let it = interp();
        let mut st = InterpreterState::default();
        let tip = |x: f32| hand(&[(idx::INDEX_TIP, x, 0.5)]);

        it.step(&mut st, &frame(0, vec![tip(0.2), tip(0.6)]), 0);
        // 0.001 * 20 = 0.02 < zoom_min_delta
        let ev = it.step(&mut st, &frame(33, vec![tip(0.2), tip(0.601)]), 33);
        assert_eq!(ev, GestureEvent::None);
        assert!((st.last_pinch_distance.unwrap() - 0.401).abs() < 1e-5);
    }

    #[test]
    fn scenario_c_click_lockout_blocks_rotate() {
        let it = interp();
        let mut st = InterpreterState::default();

        let click = it.step(&mut st, &frame(1000, vec![pose(ONE, 0.0, 0.0, 0.02)]), 1000);
        assert!(matches!(click, GestureEvent::Click { .. }), "{click:?}");

        let ev = it.step(&mut st, &frame(1200, vec![pose(ONE, 0.05, 0.0, FAR)]), 1200);
        assert_eq!(ev, GestureEvent::None);

        // lockout over
        let ev = it.step(&mut st, &frame(1500, vec![pose(ONE, 0.10, 0.0, FAR)]), 1500);
        assert!(matches!(ev, GestureEvent::Rotate { .. }), "{ev:?}");
    }

    #[test]
    fn scenario_d_tracking_loss_clears_state() {
        let it = interp();
        let mut st = InterpreterState::default();
        it.step(&mut st, &frame(0, vec![pose(TWO, 0.0, 0.0, FAR)]), 0);
        let ev = it.step(&mut st, &frame(33, vec![pose(TWO, 0.02, -0.01, FAR)]), 33);
        assert!(matches!(ev, GestureEvent::Pan { .. }), "{ev:?}");
        assert_eq!(st.active_label, Some("pan"));

        let ev = it.step(&mut st, &frame(66, vec![]), 66);
        assert_eq!(ev, GestureEvent::None);
        assert_eq!(st.last_fingertip, None);
        assert_eq!(st.last_pinch_distance, None);
        assert_eq!(st.active_label, None);
        assert_eq!(st.smoothed_velocity, (0.0, 0.0));
    }

    #[test]
    fn tracking_loss_is_idempotent() {
        let it = interp();
        let mut st = InterpreterState::default();
        it.step(&mut st, &frame(0, vec![pose(ONE, 0.0, 0.0, FAR)]), 0);
        it.step(&mut st, &frame(33, vec![pose(ONE, 0.03, 0.0, FAR)]), 33);

        it.step(&mut st, &frame(66, vec![]), 66);
        let once = st.clone();
        let ev = it.step(&mut st, &frame(99, vec![]), 99);
        assert_eq!(ev, GestureEvent::None);
        assert_eq!(st, once);
    }

    #[test]
    fn rotate_inverts_horizontal_axis() {
        let it = interp();
        let mut st = InterpreterState::default();
        assert_eq!(
            it.step(&mut st, &frame(0, vec![pose(ONE, 0.0, 0.0, FAR)]), 0),
            GestureEvent::Rotate { dx: -0.0, dy: 0.0 }
        );
        match it.step(&mut st, &frame(33, vec![pose(ONE, 0.05, 0.03, FAR)]), 33) {
            GestureEvent::Rotate { dx, dy } => {
                assert!(dx < 0.0, "dx={dx}");
                assert!(dy > 0.0, "dy={dy}");
            }
            other => panic!("expected rotate, got {other:?}"),
        }
    }

    #[test]
    fn open_palm_resets_once_per_cooldown() {
        let it = interp();
        let mut st = InterpreterState::default();
        let mut resets = vec![];
        for t in (0..=6000).step_by(100) {
            if it.step(&mut st, &frame(t, vec![pose(PALM, 0.0, 0.0, FAR)]), t) == GestureEvent::Reset
            {
                resets.push(t);
            }
        }
        assert_eq!(resets, vec![0, 2000, 4000, 6000]);
    }

    #[test]
    fn single_click_per_pinch_with_hysteresis() {
        let it = interp();
        let mut st = InterpreterState::default();
        // crosses engage once, hovers between thresholds, then releases
        let gaps = [0.2, 0.1, 0.049, 0.051, 0.049, 0.07, 0.045, 0.079, 0.09, 0.2];
        let clicks = gaps
            .iter()
            .enumerate()
            .map(|(i, &g)| {
                let t = i as u64 * 33;
                it.step(&mut st, &frame(t, vec![pose(ONE, 0.0, 0.0, g)]), t)
            })
            .filter(|e| matches!(e, GestureEvent::Click { .. }))
            .count();
        assert_eq!(clicks, 1);
        assert!(!st.pinch_engaged);

        // a second full crossing clicks again
        let ev = it.step(&mut st, &frame(2000, vec![pose(ONE, 0.0, 0.0, 0.03)]), 2000);
        assert!(matches!(ev, GestureEvent::Click { .. }));
    }

    #[test]
    fn click_reports_index_tip_position() {
        let it = interp();
        let mut st = InterpreterState::default();
        let ev = it.step(&mut st, &frame(0, vec![pose(ONE, 0.1, -0.1, 0.01)]), 0);
        match ev {
            GestureEvent::Click { x, y } => {
                assert!((x - 0.5).abs() < 1e-6);
                assert!((y - 0.4).abs() < 1e-6);
            }
            other => panic!("expected click, got {other:?}"),
        }
        assert_eq!(st.last_click_ms, Some(0));
    }

    #[test]
    fn click_outranks_open_palm() {
        let it = interp();
        let mut st = InterpreterState::default();
        let ev = it.step(&mut st, &frame(0, vec![pose(PALM, 0.0, 0.0, 0.01)]), 0);
        assert!(matches!(ev, GestureEvent::Click { .. }), "{ev:?}");
        assert_eq!(st.last_reset_ms, None);
    }

    #[test]
    fn fist_is_no_gesture() {
        let it = interp();
        let mut st = InterpreterState::default();
        let ev = it.step(&mut st, &frame(0, vec![pose(FIST, 0.0, 0.0, FAR)]), 0);
        assert_eq!(ev, GestureEvent::None);
        assert_eq!(st.active_label, None);
    }

    #[test]
    fn degenerate_frames_degrade_to_none() {
        let it = interp();
        let mut st = InterpreterState::default();
        let partial = hand(&[(idx::WRIST, 0.5, 0.9), (idx::INDEX_DIP, 0.4, 0.6)]);
        let empty = HandFrame::default();
        let short = HandFrame::new(vec![None, None, None]);
        for (i, h) in [partial, empty, short].into_iter().enumerate() {
            let t = i as u64 * 33;
            assert_eq!(it.step(&mut st, &frame(t, vec![h]), t), GestureEvent::None);
        }
        assert_eq!(st.last_fingertip, None);
    }

    #[test]
    fn leaving_two_hands_forgets_pinch_distance() {
        let it = interp();
        let mut st = InterpreterState::default();
        let tip = |x: f32| hand(&[(idx::INDEX_TIP, x, 0.5)]);
        it.step(&mut st, &frame(0, vec![tip(0.2), tip(0.6)]), 0);
        assert!(st.last_pinch_distance.is_some());
        it.step(&mut st, &frame(33, vec![tip(0.2)]), 33);
        assert_eq!(st.last_pinch_distance, None);
        // reacquiring two hands does not jump
        let ev = it.step(&mut st, &frame(66, vec![tip(0.1), tip(0.9)]), 66);
        assert_eq!(ev, GestureEvent::None);
    }
}
