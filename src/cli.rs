use anyhow::{Result, anyhow};
use log::info;
use pico_args::Arguments;
use std::{
    collections::BTreeMap,
    env,
    io::{self, Write},
    process::{Command, Stdio},
    thread,
    time::Duration,
};

use crate::actions::{CameraSink, JsonCommandSink, open_viewer_sink};
use crate::capture::{CaptureSession, CaptureState, ImmediateScheduler};
use crate::config::{self, Profile};
use crate::gestures::GestureInterpreter;
use crate::ipc;
use crate::landmarks::JsonLinesSource;

const REPLAY_WAIT: Duration = Duration::from_millis(1);

pub fn run() -> Result<()> {
    let mut pargs = Arguments::from_env();

    // Hidden daemon mode (spawned by `start`)
    if pargs.contains("--daemon") {
        return ipc::run_daemon();
    }

    // No args -> general help
    if env::args().len() == 1 {
        print_help();
        return Ok(());
    }

    if pargs.contains("-h") || pargs.contains("--help") {
        print_help();
        return Ok(());
    }

    let subcmd: Option<String> = pargs.free_from_str().ok();

    match subcmd.as_deref() {
        Some("help") => {
            let topic: Option<String> = pargs.free_from_str().ok();
            if let Some(t) = topic {
                print_subcmd_help(&t);
            } else {
                print_help();
            }
            Ok(())
        }

        Some("start") => {
            let exe = env::current_exe()?;
            // a daemon must never read the launching terminal
            let child = Command::new(exe)
                .arg("--daemon")
                .stdin(Stdio::null())
                .spawn()?;
            println!("handctl: started daemon (pid={})", child.id());
            Ok(())
        }

        Some("stop") => request(serde_json::json!({"op":"shutdown"})),
        Some("status") => request(serde_json::json!({"op":"status"})),
        Some("toggle") => request(serde_json::json!({"op":"toggle"})),
        Some("reload") => request(serde_json::json!({"op":"reload"})),
        Some("list") => request(serde_json::json!({"op":"list"})),
        Some("doctor") => request(serde_json::json!({"op":"doctor"})),

        Some("capture") => {
            let state: String = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: handctl capture <on|off>"))?;
            if state != "on" && state != "off" {
                return Err(anyhow!("usage: handctl capture <on|off>"));
            }
            request(serde_json::json!({"op":"capture","state":state}))
        }

        Some("use") => {
            let name: String = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: handctl use <profile_name>"))?;
            request(serde_json::json!({"op":"use","profile":name}))
        }

        Some("replay") => {
            let profile: Option<String> = pargs.opt_value_from_str("--profile")?;
            let path: String = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: handctl replay <file|-> [--profile <name>]"))?;
            replay(&path, profile.as_deref())
        }

        Some("emit") => {
            // usage:
            //   handctl emit rotate 4 -2
            //   handctl emit zoom 0.4
            //   handctl emit pick 0.5 0.5
            let profile: Option<String> = pargs.opt_value_from_str("--profile")?;
            let what: String = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: handctl emit <rotate|pan|zoom|reset|pick> ..."))?;
            let profile = resolve_profile(profile.as_deref())?;
            let mut sink = open_viewer_sink(&profile.viewer)?;
            match what.as_str() {
                "rotate" | "pan" | "pick" => {
                    let a: f32 = pargs
                        .free_from_str()
                        .map_err(|_| anyhow!("usage: handctl emit {what} <x> <y>"))?;
                    let b: f32 = pargs
                        .free_from_str()
                        .map_err(|_| anyhow!("usage: handctl emit {what} <x> <y>"))?;
                    match what.as_str() {
                        "rotate" => sink.rotate(a, b)?,
                        "pan" => sink.pan(a, b)?,
                        _ => sink.pick(a, b)?,
                    }
                }
                "zoom" => {
                    let delta: f32 = pargs
                        .free_from_str()
                        .map_err(|_| anyhow!("usage: handctl emit zoom <delta>"))?;
                    sink.zoom(delta)?;
                }
                "reset" => sink.reset()?,
                other => return Err(anyhow!("unknown emit kind: {other}")),
            }
            Ok(())
        }

        Some(other) => {
            eprintln!("unknown subcommand: {other}\n");
            print_help();
            Ok(())
        }

        None => {
            print_help();
            Ok(())
        }
    }
}

fn request(req: serde_json::Value) -> Result<()> {
    let r = ipc::client_request(req)?;
    print_response(&r);
    Ok(())
}

/// Named profile from the config dir, or the built-in default.
fn resolve_profile(name: Option<&str>) -> Result<Profile> {
    match name {
        Some(n) => config::load_profile(&config::config_dir()?.join("profiles"), n),
        None => Profile::builtin(),
    }
}

/// Run a recorded landmark stream through the interpreter without the
/// daemon; commands go to stdout.
fn replay(path: &str, profile: Option<&str>) -> Result<()> {
    let profile = resolve_profile(profile)?;
    let counts = replay_into(path, &profile, io::stdout().lock())?;
    let total: u64 = counts.values().sum();
    info!("replay: {total} frames from {path}: {counts:?}");
    Ok(())
}

/// Step every frame of `path` in order, writing viewer commands to `out`.
/// Returns how many frames produced each gesture kind.
pub fn replay_into<W: Write>(
    path: &str,
    profile: &Profile,
    out: W,
) -> Result<BTreeMap<&'static str, u64>> {
    let mut sink = JsonCommandSink::new(out, &profile.viewer);
    let mut session = CaptureSession::new(
        JsonLinesSource::new(path),
        ImmediateScheduler::default(),
        GestureInterpreter::new(profile.thresholds.clone()),
    );
    session.start().map_err(|e| anyhow!("replay: {e}"))?;

    let mut counts: BTreeMap<&'static str, u64> = BTreeMap::new();
    while session.state() == CaptureState::Active {
        let Some(tok) = session.scheduler_mut().take() else {
            break;
        };
        let before = session.frames_processed();
        let event = session.on_frame(tok);
        if session.frames_processed() > before {
            *counts.entry(event.label()).or_default() += 1;
        } else if session.state() == CaptureState::Active {
            // pipe producer hasn't written the next line yet
            thread::sleep(REPLAY_WAIT);
        }
        ipc::dispatch_gesture(&event, &mut sink)?;
    }
    Ok(counts)
}

fn print_help() {
    println!(
        r#"handctl — hand-gesture camera control for structure viewers

USAGE:
  handctl help [command]                  Show general or command-specific help
  handctl start                           Start the daemon
  handctl stop                            Stop the daemon
  handctl status                          Show capture state and current gesture
  handctl toggle                          Start/stop gesture capture
  handctl capture <on|off>                Force capture on or off
  handctl reload                          Reload active profile
  handctl use <name>                      Switch active profile
  handctl list                            List profiles
  handctl doctor                          Diagnose camera/source setup
  handctl replay <file|-> [--profile n]   Interpret a recorded landmark stream
  handctl emit <kind> ...                 Send one command to the viewer

TIPS:
  - Profiles: ~/.config/handctl/profiles
  - Active profile pointer: ~/.config/handctl/active
  - Landmarks are JSON lines: {{"t": ms, "hands": [[[x,y], ...21], ...]}}
"#
    );
}

fn print_subcmd_help(cmd: &str) {
    match cmd {
        "start" => println!("usage: handctl start\nStarts the background daemon (capture off)."),
        "stop" => println!("usage: handctl stop\nStops the running daemon."),
        "status" => println!(
            "usage: handctl status\nShows capture state, active gesture, frame count, profile, socket."
        ),
        "toggle" => println!(
            "usage: handctl toggle\nStarts capture when idle, stops it otherwise. Camera errors are reported."
        ),
        "capture" => println!("usage: handctl capture <on|off>\nForces capture on or off."),
        "reload" => println!(
            "usage: handctl reload\nReloads the current profile; keeps last good on error."
        ),
        "use" => {
            println!("usage: handctl use <name>\nSwitches active profile to <name> and reloads.")
        }
        "list" => {
            println!("usage: handctl list\nLists available profiles.")
        }
        "doctor" => println!(
            "usage: handctl doctor\nChecks video devices, group membership and configured paths."
        ),
        "replay" => println!(
            "usage: handctl replay <file|-> [--profile <name>]\nRuns recorded landmarks through the interpreter and prints viewer commands."
        ),
        "emit" => println!(
            "usage:\n  handctl emit rotate <dx> <dy>\n  handctl emit pan <dx> <dy>\n  handctl emit zoom <delta>\n  handctl emit reset\n  handctl emit pick <x> <y>"
        ),
        _ => {
            eprintln!("unknown command: {cmd}\n");
            print_help();
        }
    }
}

fn print_response(v: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(v).unwrap_or_default());
}
