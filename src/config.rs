use anyhow::{Result, anyhow};
use directories::UserDirs;
use log::info;
use serde::Deserialize;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Deserialize)]
pub struct Meta {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thresholds {
    pub extension_margin: f32,
    pub deadzone: f32,
    pub smoothing_alpha: f32,
    pub rotate_gain: f32,
    pub pan_factor: f32,
    pub zoom_gain: f32,
    pub zoom_min_delta: f32,
    pub pinch_engage: f32,
    pub pinch_release: f32,
    pub reset_cooldown_ms: u64,
    pub click_lockout_ms: u64,
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_stdio() -> String {
    "-".to_string()
}

fn default_fps() -> u32 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct Viewer {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default)]
    pub mirror_x: bool,
    /// "-" for stdout, otherwise a file or FIFO the viewer reads.
    #[serde(default = "default_stdio")]
    pub output: String,
}

impl Default for Viewer {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            mirror_x: false,
            output: default_stdio(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Capture {
    /// "-" for stdin, otherwise a file or FIFO of landmark JSON lines.
    #[serde(default = "default_stdio")]
    pub source: String,
    #[serde(default = "default_fps")]
    pub fps: u32,
}

impl Default for Capture {
    fn default() -> Self {
        Self {
            source: default_stdio(),
            fps: default_fps(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub meta: Meta,
    pub thresholds: Thresholds,
    #[serde(default)]
    pub viewer: Viewer,
    #[serde(default)]
    pub capture: Capture,
}

impl Profile {
    pub fn parse(txt: &str) -> Result<Self> {
        let profile: Profile = toml::from_str(txt)?;
        validate_profile(&profile)?;
        Ok(profile)
    }

    pub fn builtin() -> Result<Self> {
        Self::parse(default_profile_text())
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfigState {
    pub active_name: String,
    pub profile: Profile,
    pub config_dir: PathBuf,
    pub profiles_dir: PathBuf,
    pub active_ptr: PathBuf,
}

pub fn config_dir() -> Result<PathBuf> {
    let dirs = UserDirs::new().ok_or_else(|| anyhow!("cannot resolve home directory"))?;
    Ok(dirs.home_dir().join(".config").join("handctl"))
}

fn default_profile_text() -> &'static str {
    include_str!("../profiles/default.toml")
}

impl DaemonConfigState {
    pub fn load_or_install_default() -> Result<Self> {
        let cfgdir = config_dir()?;
        let profdir = cfgdir.join("profiles");
        fs::create_dir_all(&profdir)?;

        let def_path = profdir.join("default.toml");
        if !def_path.exists() {
            fs::write(&def_path, default_profile_text())?;
            info!("installed default profile at {}", def_path.display());
        }

        let active_ptr = cfgdir.join("active");
        if !active_ptr.exists() {
            let mut f = fs::File::create(&active_ptr)?;
            f.write_all(b"default")?;
        }

        let active_name = fs::read_to_string(&active_ptr)?.trim().to_string();
        let profile = load_profile(&profdir, &active_name)?;

        Ok(Self {
            active_name,
            profile,
            config_dir: cfgdir,
            profiles_dir: profdir,
            active_ptr,
        })
    }

    /// Keeps the previous profile if the file fails to load.
    pub fn reload(&mut self) -> Result<()> {
        self.profile = load_profile(&self.profiles_dir, &self.active_name)?;
        Ok(())
    }

    pub fn set_active(&mut self, name: &str) -> Result<()> {
        let p = self.profile_path(name);
        if !p.exists() {
            return Err(anyhow!("profile not found: {}", p.display()));
        }
        let profile = load_profile(&self.profiles_dir, name)?;
        fs::write(&self.active_ptr, name.as_bytes())?;
        self.active_name = name.to_string();
        self.profile = profile;
        Ok(())
    }

    pub fn profile_path(&self, name: &str) -> PathBuf {
        self.profiles_dir.join(format!("{name}.toml"))
    }

    pub fn list_profiles(&self) -> Vec<String> {
        let mut v = Vec::new();
        if let Ok(rd) = fs::read_dir(&self.profiles_dir) {
            for e in rd.flatten() {
                let path = e.path();
                if path.extension().is_some_and(|ext| ext == "toml") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        v.push(stem.to_string());
                    }
                }
            }
        }
        v.sort();
        v
    }

    pub fn doctor_report(&self) -> serde_json::Value {
        let video_devices = detect_video_devices();
        let source = &self.profile.capture.source;
        let source_ok = source != "-" && Path::new(source).exists();
        serde_json::json!({
            "video_devices": video_devices,
            "video_group_member": check_in_group("video"),
            "config_dir": self.config_dir,
            "profiles_dir": self.profiles_dir,
            "active_profile": self.active_name,
            "profile_name": self.profile.meta.name,
            "landmark_source": source,
            "landmark_source_present": source_ok,
            "viewer_output": self.profile.viewer.output,
            "hints": {
                "add_user_to_video_group": "sudo usermod -aG video $USER && newgrp video",
                "landmark_fifo": "mkfifo /tmp/handctl.landmarks and point capture.source at it"
            }
        })
    }
}

pub fn load_profile(profiles_dir: &Path, name: &str) -> Result<Profile> {
    let path = profiles_dir.join(format!("{name}.toml"));
    let txt = fs::read_to_string(&path)
        .map_err(|e| anyhow!("failed to read {}: {e}", path.display()))?;
    Profile::parse(&txt).map_err(|e| anyhow!("failed to load {}: {e}", path.display()))
}

fn validate_profile(p: &Profile) -> Result<()> {
    let th = &p.thresholds;
    if th.reset_cooldown_ms == 0 || th.click_lockout_ms == 0 {
        return Err(anyhow!("thresholds must be positive durations"));
    }
    if !(th.smoothing_alpha > 0.0 && th.smoothing_alpha < 1.0) {
        return Err(anyhow!("thresholds.smoothing_alpha must be in (0,1)"));
    }
    if th.extension_margin <= 1.0 {
        return Err(anyhow!("thresholds.extension_margin must be > 1"));
    }
    if !(0.0..1.0).contains(&th.deadzone) {
        return Err(anyhow!(
            "thresholds.deadzone must be in [0,1) normalized units"
        ));
    }
    if th.pinch_engage <= 0.0 || th.pinch_engage >= th.pinch_release {
        return Err(anyhow!(
            "thresholds.pinch_engage must be positive and below pinch_release"
        ));
    }
    for (name, v) in [
        ("rotate_gain", th.rotate_gain),
        ("pan_factor", th.pan_factor),
        ("zoom_gain", th.zoom_gain),
    ] {
        if v <= 0.0 {
            return Err(anyhow!("thresholds.{name} must be positive"));
        }
    }
    if th.zoom_min_delta < 0.0 {
        return Err(anyhow!("thresholds.zoom_min_delta must not be negative"));
    }
    if p.viewer.width == 0 || p.viewer.height == 0 {
        return Err(anyhow!("viewer width/height must be non-zero"));
    }
    if !(1..=240).contains(&p.capture.fps) {
        return Err(anyhow!("capture.fps must be in 1..=240"));
    }
    if p.capture.source.trim().is_empty() || p.viewer.output.trim().is_empty() {
        return Err(anyhow!("capture.source and viewer.output must not be empty"));
    }
    Ok(())
}

fn detect_video_devices() -> Vec<String> {
    let mut out = vec![];
    if let Ok(rd) = fs::read_dir("/dev") {
        for e in rd.flatten() {
            let p = e.path();
            if p.file_name()
                .and_then(|s| s.to_str())
                .is_some_and(|s| s.starts_with("video"))
            {
                out.push(p.display().to_string());
            }
        }
    }
    out.sort();
    out
}

fn check_in_group(group: &str) -> bool {
    let Ok(s) = fs::read_to_string("/etc/group") else {
        return false;
    };
    let user = whoami::username();
    let prefix = format!("{group}:");
    s.lines()
        .filter(|line| line.starts_with(&prefix))
        .any(|line| {
            line.split(':')
                .nth(3)
                .unwrap_or("")
                .split(',')
                .any(|u| u == user)
        })
}
