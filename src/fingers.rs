//! Geometric finger-extension tests on a single hand.
//!
//! A finger counts as extended when its tip lies further from the wrist than
//! its DIP joint by at least the profile's `extension_margin`. Only radial
//! distances from the wrist are compared, so the result does not depend on
//! where the hand is in the image or how it is rotated.

use crate::landmarks::{HandFrame, Point, idx};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finger {
    Index,
    Middle,
    Ring,
    Pinky,
}

impl Finger {
    /// `(dip, tip)` landmark indices.
    fn joints(self) -> (usize, usize) {
        match self {
            Finger::Index => (idx::INDEX_DIP, idx::INDEX_TIP),
            Finger::Middle => (idx::MIDDLE_DIP, idx::MIDDLE_TIP),
            Finger::Ring => (idx::RING_DIP, idx::RING_TIP),
            Finger::Pinky => (idx::PINKY_DIP, idx::PINKY_TIP),
        }
    }
}

/// Extension flags for the four non-thumb fingers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FingerStates {
    pub index: bool,
    pub middle: bool,
    pub ring: bool,
    pub pinky: bool,
}

impl FingerStates {
    pub fn classify(hand: &HandFrame, margin: f32) -> Self {
        Self {
            index: is_extended(hand, Finger::Index, margin),
            middle: is_extended(hand, Finger::Middle, margin),
            ring: is_extended(hand, Finger::Ring, margin),
            pinky: is_extended(hand, Finger::Pinky, margin),
        }
    }

    pub fn open_palm(&self) -> bool {
        self.index && self.middle && self.ring && self.pinky
    }

    /// Index and middle up, ring down.
    pub fn two_finger(&self) -> bool {
        self.index && self.middle && !self.ring
    }

    /// Index up, middle down.
    pub fn one_finger(&self) -> bool {
        self.index && !self.middle
    }
}

/// Fails closed: a missing wrist, DIP or tip means "not extended".
pub fn is_extended(hand: &HandFrame, finger: Finger, margin: f32) -> bool {
    let (dip, tip) = finger.joints();
    let (Some(w), Some(d), Some(t)) = (hand.get(idx::WRIST), hand.get(dip), hand.get(tip)) else {
        return false;
    };
    t.distance(&w) > d.distance(&w) * margin
}

pub fn index_tip(hand: &HandFrame) -> Option<Point> {
    hand.get(idx::INDEX_TIP)
}

/// Thumb-tip to index-tip distance, if both are tracked.
pub fn pinch_distance(hand: &HandFrame) -> Option<f32> {
    let thumb = hand.get(idx::THUMB_TIP)?;
    let index = hand.get(idx::INDEX_TIP)?;
    Some(thumb.distance(&index))
}
