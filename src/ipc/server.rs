use anyhow::{Result, anyhow};
use log::{debug, error, info, warn};
use notify::{EventKind, RecursiveMode, Watcher};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use std::{
    io::{BufRead, BufReader, Write},
    os::unix::net::{UnixListener, UnixStream},
    path::PathBuf,
    sync::{
        Arc, Mutex,
        mpsc::{self, Sender},
    },
    thread,
    time::Duration,
};

use super::pipeline::{PipelineCmd, PipelineStatus, run_pipeline};
use super::runtime::socket_path;
use crate::capture::CaptureState;
use crate::config::{DaemonConfigState, Profile};

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

pub fn run_daemon() -> Result<()> {
    // socket
    let sock = socket_path()?;
    if sock.exists() {
        let _ = std::fs::remove_file(&sock);
    }
    let listener = UnixListener::bind(&sock)?;
    info!("daemon: listening on {}", sock.display());

    // state
    let mut state = DaemonState::new()?;
    info!("daemon: active profile '{}'", state.cfg.active_name);

    // channels
    let (tx_req, rx_req) = mpsc::channel::<IpcMsg>();

    // pipeline thread
    let pipeline = PipelineThread::start(state.cfg.profile.clone())?;

    // signals
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let tx_sig = tx_req.clone();
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!("daemon: caught signal {sig}");
            let _ = tx_sig.send(IpcMsg::Shutdown);
        }
    });

    // profile hot reload
    let tx_watch = tx_req.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(ev) if matches!(ev.kind, EventKind::Create(_) | EventKind::Modify(_)) => {
                for p in ev.paths {
                    let _ = tx_watch.send(IpcMsg::ProfileChanged(p));
                }
            }
            Ok(_) => {}
            Err(e) => warn!("profile watcher error: {e}"),
        }
    })?;
    watcher.watch(&state.cfg.profiles_dir, RecursiveMode::NonRecursive)?;

    // accept loop
    listener.set_nonblocking(true)?;
    loop {
        if let Ok((stream, _)) = listener.accept() {
            let ctx = ClientCtx {
                cfg: state.cfg.clone(),
                socket: sock.clone(),
                status: pipeline.status.clone(),
                tx_req: tx_req.clone(),
                tx_pipe: pipeline.tx.clone(),
            };
            thread::spawn(move || {
                if let Err(e) = handle_client(stream, ctx) {
                    error!("ipc client error: {e}");
                }
            });
        }

        while let Ok(msg) = rx_req.try_recv() {
            match msg {
                IpcMsg::Reload => state.reload(&pipeline),
                IpcMsg::ProfileChanged(path) => {
                    if path == state.cfg.profile_path(&state.cfg.active_name) {
                        debug!("daemon: {} changed on disk", path.display());
                        state.reload(&pipeline);
                    }
                }
                IpcMsg::UseProfile(name) => {
                    if let Err(e) = state.cfg.set_active(&name) {
                        error!("use profile failed: {e}");
                    } else {
                        pipeline.update_profile(state.cfg.profile.clone());
                        info!("switched active profile to {}", state.cfg.active_name);
                    }
                }
                IpcMsg::Shutdown => {
                    drop(watcher);
                    pipeline.shutdown();
                    let _ = std::fs::remove_file(&sock);
                    info!("daemon: bye");
                    return Ok(());
                }
            }
        }

        thread::sleep(Duration::from_millis(5));
    }
}

struct ClientCtx {
    cfg: DaemonConfigState,
    socket: PathBuf,
    status: Arc<Mutex<PipelineStatus>>,
    tx_req: Sender<IpcMsg>,
    tx_pipe: Sender<PipelineCmd>,
}

fn handle_client(mut stream: UnixStream, ctx: ClientCtx) -> Result<()> {
    stream.set_nonblocking(false)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        return Ok(());
    }
    let req: serde_json::Value = serde_json::from_str(&line)?;
    let op = req.get("op").and_then(|v| v.as_str()).unwrap_or("");

    let resp = match op {
        "status" => {
            let st = ctx
                .status
                .lock()
                .map_err(|e| anyhow!("status unavailable: {e}"))?
                .clone();
            serde_json::json!({"ok": true, "data": {
                "capture": st.capture,
                "gesture": st.gesture,
                "frames": st.frames,
                "source": st.source,
                "last_error": st.last_error,
                "active_profile": ctx.cfg.active_name,
                "socket": ctx.socket,
            }})
        }
        "toggle" => capture_request(&ctx, None),
        "capture" => match req.get("state").and_then(|v| v.as_str()) {
            Some("on") => capture_request(&ctx, Some(true)),
            Some("off") => capture_request(&ctx, Some(false)),
            _ => serde_json::json!({"ok": false, "error": "capture state must be 'on' or 'off'"}),
        },
        "reload" => {
            let _ = ctx.tx_req.send(IpcMsg::Reload);
            serde_json::json!({"ok": true, "data": {"active_profile": ctx.cfg.active_name}})
        }
        "use" => {
            let name = req.get("profile").and_then(|v| v.as_str()).unwrap_or("");
            if name.is_empty() {
                serde_json::json!({"ok": false, "error": "missing profile name"})
            } else {
                let _ = ctx.tx_req.send(IpcMsg::UseProfile(name.to_string()));
                serde_json::json!({"ok": true, "data": {"active_profile": name}})
            }
        }
        "list" => {
            let list = ctx.cfg.list_profiles();
            serde_json::json!({"ok": true, "data": {"profiles": list, "active": ctx.cfg.active_name}})
        }
        "doctor" => {
            let report = ctx.cfg.doctor_report();
            serde_json::json!({"ok": true, "data": report})
        }
        "shutdown" => {
            let _ = ctx.tx_req.send(IpcMsg::Shutdown);
            serde_json::json!({"ok": true, "data": "shutting down"})
        }
        _ => serde_json::json!({"ok": false, "error": format!("unknown op: {op}")}),
    };

    writeln!(stream, "{resp}")?;
    Ok(())
}

/// Ask the pipeline to change capture state and wait for the outcome.
fn capture_request(ctx: &ClientCtx, want: Option<bool>) -> serde_json::Value {
    let (reply, rx) = mpsc::channel();
    if ctx.tx_pipe.send(PipelineCmd::Capture { want, reply }).is_err() {
        return serde_json::json!({"ok": false, "error": "pipeline is not running"});
    }
    match rx.recv_timeout(REPLY_TIMEOUT) {
        Ok(Ok(state)) => serde_json::json!({"ok": true, "data": {"capture": state}}),
        Ok(Err(e)) => serde_json::json!({"ok": false, "error": e, "data": {"capture": CaptureState::Idle}}),
        Err(_) => serde_json::json!({"ok": false, "error": "pipeline did not answer"}),
    }
}

struct DaemonState {
    cfg: DaemonConfigState,
}

impl DaemonState {
    fn new() -> Result<Self> {
        let cfg = DaemonConfigState::load_or_install_default()?;
        Ok(Self { cfg })
    }

    fn reload(&mut self, pipeline: &PipelineThread) {
        if let Err(e) = self.cfg.reload() {
            error!("reload failed, keeping last good profile: {e}");
        } else {
            pipeline.update_profile(self.cfg.profile.clone());
            info!("profile reloaded");
        }
    }
}

enum IpcMsg {
    Reload,
    ProfileChanged(PathBuf),
    UseProfile(String),
    Shutdown,
}

struct PipelineThread {
    tx: Sender<PipelineCmd>,
    status: Arc<Mutex<PipelineStatus>>,
    handle: thread::JoinHandle<()>,
}

impl PipelineThread {
    fn start(profile: Profile) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let status = Arc::new(Mutex::new(PipelineStatus::new(&profile.capture.source)));
        let status_clone = status.clone();
        let handle = thread::Builder::new()
            .name("pipeline".into())
            .spawn(move || {
                if let Err(e) = run_pipeline(profile, rx, status_clone) {
                    error!("gesture pipeline failed: {e}");
                }
            })?;
        Ok(Self { tx, status, handle })
    }

    fn update_profile(&self, profile: Profile) {
        if self.tx.send(PipelineCmd::Profile(Box::new(profile))).is_err() {
            warn!("pipeline is gone; profile not applied");
        }
    }

    fn shutdown(self) {
        let _ = self.tx.send(PipelineCmd::Shutdown);
        if self.handle.join().is_err() {
            error!("pipeline thread panicked");
        }
    }
}
