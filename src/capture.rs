//! Capture lifecycle: `Idle -> Acquiring -> Active -> Idle`.
//!
//! A [`CaptureSession`] owns the landmark source, the frame scheduler and the
//! interpreter state. Each frame callback processes exactly one frame and
//! requests the next one before returning; stopping cancels the pending
//! callback so nothing fires after `stop` returns.

use log::{debug, info, trace, warn};
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::Thresholds;
use crate::gestures::{GestureEvent, GestureInterpreter, InterpreterState};
use crate::landmarks::{LandmarkSource, SourcePoll};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("hand tracking unavailable: {0}")]
    TrackingUnavailable(String),
    #[error("camera access denied: {0}")]
    DeviceDenied(String),
    #[error("no capture device at {0}")]
    NoDevice(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    Idle,
    Acquiring,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameToken(u64);

pub trait FrameScheduler {
    fn request_frame(&mut self) -> FrameToken;
    fn cancel_frame(&mut self, token: FrameToken);
}

/// Fixed-rate scheduler polled by the daemon loop.
#[derive(Debug)]
pub struct TickScheduler {
    interval: Duration,
    next_id: u64,
    pending: Option<(FrameToken, Instant)>,
}

impl TickScheduler {
    pub fn new(fps: u32) -> Self {
        Self {
            interval: Self::interval_for(fps),
            next_id: 0,
            pending: None,
        }
    }

    fn interval_for(fps: u32) -> Duration {
        Duration::from_secs(1) / fps.max(1)
    }

    pub fn set_fps(&mut self, fps: u32) {
        self.interval = Self::interval_for(fps);
    }

    /// Hands out the pending token once its deadline has passed.
    pub fn due(&mut self, now: Instant) -> Option<FrameToken> {
        match self.pending {
            Some((tok, at)) if at <= now => {
                self.pending = None;
                Some(tok)
            }
            _ => None,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.map(|(_, at)| at)
    }
}

impl FrameScheduler for TickScheduler {
    fn request_frame(&mut self) -> FrameToken {
        self.next_id += 1;
        let tok = FrameToken(self.next_id);
        self.pending = Some((tok, Instant::now() + self.interval));
        tok
    }

    fn cancel_frame(&mut self, token: FrameToken) {
        if self.pending.is_some_and(|(t, _)| t == token) {
            self.pending = None;
        }
    }
}

/// Fires every requested frame immediately; used for offline replays.
#[derive(Debug, Default)]
pub struct ImmediateScheduler {
    next_id: u64,
    pending: Option<FrameToken>,
}

impl ImmediateScheduler {
    pub fn take(&mut self) -> Option<FrameToken> {
        self.pending.take()
    }
}

impl FrameScheduler for ImmediateScheduler {
    fn request_frame(&mut self) -> FrameToken {
        self.next_id += 1;
        let tok = FrameToken(self.next_id);
        self.pending = Some(tok);
        tok
    }

    fn cancel_frame(&mut self, token: FrameToken) {
        if self.pending == Some(token) {
            self.pending = None;
        }
    }
}

pub struct CaptureSession<S, F> {
    source: S,
    scheduler: F,
    interpreter: GestureInterpreter,
    state: CaptureState,
    interp_state: InterpreterState,
    pending: Option<FrameToken>,
    started: Instant,
    /// Last source timestamp and when it arrived.
    source_clock: Option<(u64, Instant)>,
    frames: u64,
}

impl<S: LandmarkSource, F: FrameScheduler> CaptureSession<S, F> {
    pub fn new(source: S, scheduler: F, interpreter: GestureInterpreter) -> Self {
        Self {
            source,
            scheduler,
            interpreter,
            state: CaptureState::Idle,
            interp_state: InterpreterState::default(),
            pending: None,
            started: Instant::now(),
            source_clock: None,
            frames: 0,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn interpreter_state(&self) -> &InterpreterState {
        &self.interp_state
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn scheduler_mut(&mut self) -> &mut F {
        &mut self.scheduler
    }

    pub fn set_thresholds(&mut self, th: Thresholds) {
        self.interpreter.set_thresholds(th);
    }

    /// Swap the landmark source. Only honoured while idle.
    pub fn replace_source(&mut self, source: S) -> bool {
        if self.state != CaptureState::Idle {
            return false;
        }
        self.source = source;
        true
    }

    pub fn toggle(&mut self) -> Result<CaptureState, CaptureError> {
        match self.state {
            CaptureState::Idle => self.start()?,
            _ => self.stop(),
        }
        Ok(self.state)
    }

    /// On failure the session stays `Idle` and the error is returned once.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.state != CaptureState::Idle {
            return Ok(());
        }
        self.state = CaptureState::Acquiring;
        debug!("capture: acquiring");

        if let Err(e) = self.source.open() {
            warn!("capture: start failed: {e}");
            self.state = CaptureState::Idle;
            return Err(e);
        }

        self.interp_state = InterpreterState::default();
        self.started = Instant::now();
        self.source_clock = None;
        self.frames = 0;
        self.state = CaptureState::Active;
        self.pending = Some(self.scheduler.request_frame());
        info!("capture: active");
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.state == CaptureState::Idle {
            return;
        }
        if let Some(tok) = self.pending.take() {
            self.scheduler.cancel_frame(tok);
        }
        self.source.close();
        self.interp_state = InterpreterState::default();
        self.state = CaptureState::Idle;
        info!("capture: stopped after {} frames", self.frames);
    }

    /// Frame callback. Anything but the currently pending token, or any
    /// call while not active, is ignored.
    pub fn on_frame(&mut self, token: FrameToken) -> GestureEvent {
        if self.state != CaptureState::Active || self.pending != Some(token) {
            trace!("capture: ignoring stale callback {token:?}");
            return GestureEvent::None;
        }
        self.pending = None;

        let event = match self.source.poll() {
            SourcePoll::Frame(frame) => {
                let now_ms = self.frame_time(frame.timestamp_ms);
                self.frames += 1;
                self.interpreter.step(&mut self.interp_state, &frame, now_ms)
            }
            SourcePoll::Pending | SourcePoll::Malformed => GestureEvent::None,
            SourcePoll::Ended => {
                info!("capture: landmark source ended");
                self.stop();
                return GestureEvent::None;
            }
        };

        self.pending = Some(self.scheduler.request_frame());
        event
    }

    /// Frame time in ms. Untimed frames extrapolate from the last source
    /// timestamp once one has been seen, otherwise from session start.
    fn frame_time(&mut self, ts: Option<u64>) -> u64 {
        match (ts, self.source_clock) {
            (Some(t), _) => {
                self.source_clock = Some((t, Instant::now()));
                t
            }
            (None, Some((t, at))) => t.saturating_add(at.elapsed().as_millis() as u64),
            (None, None) => self.started.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Profile;
    use crate::landmarks::idx;
    use crate::landmarks::testing::{frame, hand};
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakeSource {
        queue: VecDeque<SourcePoll>,
        open_error: Option<CaptureError>,
        opened: u32,
        closed: u32,
        polled: u32,
    }

    impl LandmarkSource for FakeSource {
        fn open(&mut self) -> Result<(), CaptureError> {
            if let Some(e) = self.open_error.clone() {
                return Err(e);
            }
            self.opened += 1;
            Ok(())
        }

        fn poll(&mut self) -> SourcePoll {
            self.polled += 1;
            self.queue.pop_front().unwrap_or(SourcePoll::Pending)
        }

        fn close(&mut self) {
            self.closed += 1;
        }
    }

    #[derive(Default)]
    struct ManualScheduler {
        next: u64,
        requested: Vec<FrameToken>,
        cancelled: Vec<FrameToken>,
    }

    impl FrameScheduler for ManualScheduler {
        fn request_frame(&mut self) -> FrameToken {
            self.next += 1;
            let t = FrameToken(self.next);
            self.requested.push(t);
            t
        }

        fn cancel_frame(&mut self, token: FrameToken) {
            self.cancelled.push(token);
        }
    }

    fn session(source: FakeSource) -> CaptureSession<FakeSource, ManualScheduler> {
        let th = Profile::builtin().unwrap().thresholds;
        CaptureSession::new(
            source,
            ManualScheduler::default(),
            GestureInterpreter::new(th),
        )
    }

    fn pointing(t: u64, x: f32) -> SourcePoll {
        SourcePoll::Frame(frame(
            t,
            vec![hand(&[
                (idx::WRIST, x, 0.9),
                (idx::INDEX_DIP, x, 0.6),
                (idx::INDEX_TIP, x, 0.5),
            ])],
        ))
    }

    fn last_token(s: &mut CaptureSession<FakeSource, ManualScheduler>) -> FrameToken {
        *s.scheduler_mut().requested.last().unwrap()
    }

    #[test]
    fn denied_device_leaves_session_idle() {
        let mut s = session(FakeSource {
            open_error: Some(CaptureError::DeviceDenied("/dev/video0".into())),
            ..Default::default()
        });
        let err = s.start().unwrap_err();
        assert_eq!(err, CaptureError::DeviceDenied("/dev/video0".into()));
        assert_eq!(s.state(), CaptureState::Idle);
        assert!(s.scheduler_mut().requested.is_empty());
    }

    #[test]
    fn each_frame_schedules_the_next() {
        let mut s = session(FakeSource {
            queue: VecDeque::from([pointing(0, 0.5), pointing(33, 0.55)]),
            ..Default::default()
        });
        assert_eq!(s.toggle().unwrap(), CaptureState::Active);
        assert_eq!(s.source().opened, 1);

        let t1 = last_token(&mut s);
        assert!(matches!(s.on_frame(t1), GestureEvent::Rotate { .. }));
        let t2 = last_token(&mut s);
        assert_ne!(t1, t2);
        match s.on_frame(t2) {
            GestureEvent::Rotate { dx, .. } => assert!(dx < 0.0),
            other => panic!("expected rotate, got {other:?}"),
        }
        assert_eq!(s.frames_processed(), 2);
        assert_eq!(s.interpreter_state().active_label, Some("rotate"));
    }

    #[test]
    fn stale_token_is_ignored_while_active() {
        let mut s = session(FakeSource {
            queue: VecDeque::from([pointing(0, 0.5), pointing(33, 0.5)]),
            ..Default::default()
        });
        s.start().unwrap();
        let t1 = last_token(&mut s);
        s.on_frame(t1);
        assert_eq!(s.on_frame(t1), GestureEvent::None);
        assert_eq!(s.source().polled, 1);
    }

    #[test]
    fn stop_cancels_pending_callback_and_releases_source() {
        let mut s = session(FakeSource {
            queue: VecDeque::from([pointing(0, 0.5)]),
            ..Default::default()
        });
        s.start().unwrap();
        let pending = last_token(&mut s);

        assert_eq!(s.toggle().unwrap(), CaptureState::Idle);
        assert_eq!(s.scheduler_mut().cancelled, vec![pending]);
        assert_eq!(s.source().closed, 1);

        // late callback after stop
        assert_eq!(s.on_frame(pending), GestureEvent::None);
        assert_eq!(s.source().polled, 0);
    }

    #[test]
    fn restart_begins_with_fresh_state() {
        let mut s = session(FakeSource {
            queue: VecDeque::from([pointing(0, 0.5), pointing(33, 0.6)]),
            ..Default::default()
        });
        s.start().unwrap();
        let t = last_token(&mut s);
        s.on_frame(t);
        let t = last_token(&mut s);
        s.on_frame(t);
        assert!(s.interpreter_state().last_fingertip.is_some());

        s.stop();
        s.start().unwrap();
        assert_eq!(s.interpreter_state(), &InterpreterState::default());
        assert_eq!(s.frames_processed(), 0);
        assert_eq!(s.source().opened, 2);
    }

    #[test]
    fn ended_source_stops_capture() {
        let mut s = session(FakeSource {
            queue: VecDeque::from([SourcePoll::Malformed, SourcePoll::Ended]),
            ..Default::default()
        });
        s.start().unwrap();
        let t = last_token(&mut s);
        assert_eq!(s.on_frame(t), GestureEvent::None);
        assert_eq!(s.state(), CaptureState::Active);
        let t = last_token(&mut s);
        assert_eq!(s.on_frame(t), GestureEvent::None);
        assert_eq!(s.state(), CaptureState::Idle);
        assert_eq!(s.source().closed, 1);
    }

    #[test]
    fn untimed_frames_continue_the_source_clock() {
        let pinching = SourcePoll::Frame(frame(
            9_999_000,
            vec![hand(&[
                (idx::WRIST, 0.5, 0.9),
                (idx::INDEX_DIP, 0.5, 0.6),
                (idx::INDEX_TIP, 0.5, 0.5),
                (idx::THUMB_TIP, 0.51, 0.5),
            ])],
        ));
        let mut untimed = pointing(0, 0.5);
        if let SourcePoll::Frame(f) = &mut untimed {
            f.timestamp_ms = None;
        }
        let mut s = session(FakeSource {
            queue: VecDeque::from([pinching, pointing(10_000_000, 0.5), untimed]),
            ..Default::default()
        });
        s.start().unwrap();

        let t = last_token(&mut s);
        assert!(matches!(s.on_frame(t), GestureEvent::Click { .. }));
        let t = last_token(&mut s);
        assert!(matches!(s.on_frame(t), GestureEvent::Rotate { .. }));
        // still past the click lockout, not back at session-relative zero
        let t = last_token(&mut s);
        assert!(matches!(s.on_frame(t), GestureEvent::Rotate { .. }));
    }

    #[test]
    fn frame_time_never_runs_behind_source_timestamps() {
        let mut s = session(FakeSource::default());
        assert!(s.frame_time(None) < 1_000);
        assert_eq!(s.frame_time(Some(1_700_000_000_000)), 1_700_000_000_000);
        let t = s.frame_time(None);
        assert!((1_700_000_000_000..1_700_000_001_000).contains(&t), "t={t}");
    }

    #[test]
    fn source_can_only_be_replaced_while_idle() {
        let mut s = session(FakeSource::default());
        s.start().unwrap();
        assert!(!s.replace_source(FakeSource::default()));
        s.stop();
        assert!(s.replace_source(FakeSource::default()));
        assert_eq!(s.source().opened, 0);
    }

    #[test]
    fn tick_scheduler_honours_deadline_and_cancel() {
        let mut sched = TickScheduler::new(50);
        let before = Instant::now();
        let tok = sched.request_frame();
        assert_eq!(sched.due(before), None);
        assert_eq!(sched.due(before + Duration::from_secs(1)), Some(tok));
        assert_eq!(sched.due(before + Duration::from_secs(2)), None);

        let tok = sched.request_frame();
        sched.cancel_frame(tok);
        assert_eq!(sched.next_deadline(), None);
    }
}
