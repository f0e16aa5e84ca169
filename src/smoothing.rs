//! Fingertip motion filter: deadzone followed by an exponential moving average.

use crate::landmarks::Point;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionFilter {
    pub deadzone: f32,
    pub alpha: f32,
}

impl MotionFilter {
    pub fn new(deadzone: f32, alpha: f32) -> Self {
        Self { deadzone, alpha }
    }

    fn clamp_axis(&self, d: f32) -> f32 {
        if d.abs() < self.deadzone { 0.0 } else { d }
    }

    /// Fold the displacement from `prev` to `cur` into `smoothed`.
    ///
    /// With no previous position (first frame after acquisition) the raw
    /// displacement is taken as zero.
    pub fn update(&self, prev: Option<Point>, cur: Point, smoothed: (f32, f32)) -> (f32, f32) {
        let (dx, dy) = match prev {
            Some(p) => (cur.x - p.x, cur.y - p.y),
            None => (0.0, 0.0),
        };
        let dx = self.clamp_axis(dx);
        let dy = self.clamp_axis(dy);
        let a = self.alpha;
        (a * dx + (1.0 - a) * smoothed.0, a * dy + (1.0 - a) * smoothed.1)
    }
}
