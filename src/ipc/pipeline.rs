use anyhow::Result;
use log::{error, info, warn};
use serde::Serialize;
use std::{
    sync::{
        Arc, Mutex,
        mpsc::{Receiver, Sender, TryRecvError},
    },
    thread,
    time::{Duration, Instant},
};

use super::dispatch::dispatch_gesture;
use crate::actions::open_viewer_sink;
use crate::capture::{CaptureSession, CaptureState, TickScheduler};
use crate::config::Profile;
use crate::gestures::GestureInterpreter;
use crate::landmarks::JsonLinesSource;

const IDLE_SLEEP: Duration = Duration::from_millis(5);

pub enum PipelineCmd {
    /// `None` toggles, `Some(on)` forces a state.
    Capture {
        want: Option<bool>,
        reply: Sender<std::result::Result<CaptureState, String>>,
    },
    Profile(Box<Profile>),
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub capture: CaptureState,
    pub gesture: Option<&'static str>,
    pub frames: u64,
    pub source: String,
    pub last_error: Option<String>,
}

impl PipelineStatus {
    pub fn new(source: &str) -> Self {
        Self {
            capture: CaptureState::Idle,
            gesture: None,
            frames: 0,
            source: source.to_string(),
            last_error: None,
        }
    }
}

type Session = CaptureSession<JsonLinesSource, TickScheduler>;

pub fn run_pipeline(
    profile: Profile,
    rx: Receiver<PipelineCmd>,
    status: Arc<Mutex<PipelineStatus>>,
) -> Result<()> {
    let mut sink = open_viewer_sink(&profile.viewer)?;
    let mut session: Session = CaptureSession::new(
        JsonLinesSource::live(profile.capture.source.clone()),
        TickScheduler::new(profile.capture.fps),
        GestureInterpreter::new(profile.thresholds.clone()),
    );
    let mut viewer_output = profile.viewer.output.clone();
    let mut pending_source: Option<String> = None;
    let mut last_error: Option<String> = None;

    info!("pipeline: ready (source {})", profile.capture.source);

    loop {
        loop {
            match rx.try_recv() {
                Ok(PipelineCmd::Capture { want, reply }) => {
                    let res = match want {
                        None => session.toggle(),
                        Some(true) => session.start().map(|_| session.state()),
                        Some(false) => {
                            session.stop();
                            Ok(session.state())
                        }
                    };
                    last_error = res.as_ref().err().map(|e| e.to_string());
                    let _ = reply.send(res.map_err(|e| e.to_string()));
                }
                Ok(PipelineCmd::Profile(p)) => {
                    session.set_thresholds(p.thresholds.clone());
                    session.scheduler_mut().set_fps(p.capture.fps);
                    sink.set_viewport(&p.viewer);
                    if p.capture.source != session.source().path() {
                        pending_source = Some(p.capture.source.clone());
                    }
                    if p.viewer.output != viewer_output {
                        warn!("pipeline: viewer.output changes apply after daemon restart");
                        viewer_output = p.viewer.output.clone();
                    }
                    info!("pipeline: profile applied");
                }
                Ok(PipelineCmd::Shutdown) | Err(TryRecvError::Disconnected) => {
                    session.stop();
                    info!("pipeline: shut down");
                    return Ok(());
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        // a changed source is swapped in once capture is stopped
        if session.state() == CaptureState::Idle {
            if let Some(src) = pending_source.take() {
                session.replace_source(JsonLinesSource::live(src.clone()));
                info!("pipeline: landmark source is now {src}");
            }
        }

        let now = Instant::now();
        if let Some(tok) = session.scheduler_mut().due(now) {
            let event = session.on_frame(tok);
            if let Err(e) = dispatch_gesture(&event, &mut sink) {
                error!("dispatch failed: {e}");
            }
        }

        publish(&status, &session, &last_error);

        let wait = session
            .scheduler_mut()
            .next_deadline()
            .map(|at| at.saturating_duration_since(Instant::now()).min(IDLE_SLEEP))
            .unwrap_or(IDLE_SLEEP);
        thread::sleep(wait);
    }
}

fn publish(status: &Arc<Mutex<PipelineStatus>>, session: &Session, last_error: &Option<String>) {
    match status.lock() {
        Ok(mut st) => {
            st.capture = session.state();
            st.gesture = session.interpreter_state().active_label;
            st.frames = session.frames_processed();
            st.source = session.source().path().to_string();
            st.last_error = last_error.clone();
        }
        Err(e) => warn!("pipeline: status lock poisoned: {e}"),
    }
}
