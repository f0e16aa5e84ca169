use anyhow::{Result, anyhow};
use log::{debug, info};
use serde::Serialize;
use std::{
    fs::OpenOptions,
    io::{self, Write},
};

use crate::config::Viewer;

/// Imperative camera API of the structure viewer.
pub trait CameraSink {
    fn rotate(&mut self, dx: f32, dy: f32) -> Result<()>;
    fn pan(&mut self, dx: f32, dy: f32) -> Result<()>;
    fn zoom(&mut self, delta: f32) -> Result<()>;
    fn reset(&mut self) -> Result<()>;
    /// `x`, `y` are normalized image coordinates.
    fn pick(&mut self, x: f32, y: f32) -> Result<()>;
}

/// One line of the viewer command stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ViewerCommand {
    Rotate { dx: f32, dy: f32 },
    Pan { dx: f32, dy: f32 },
    Zoom { delta: f32 },
    Reset,
    Pick { x: f32, y: f32 },
}

/// Writes [`ViewerCommand`]s as JSON lines.
pub struct JsonCommandSink<W: Write> {
    out: W,
    width: u32,
    height: u32,
    mirror_x: bool,
}

impl<W: Write> JsonCommandSink<W> {
    pub fn new(out: W, viewer: &Viewer) -> Self {
        Self {
            out,
            width: viewer.width,
            height: viewer.height,
            mirror_x: viewer.mirror_x,
        }
    }

    pub fn set_viewport(&mut self, viewer: &Viewer) {
        self.width = viewer.width;
        self.height = viewer.height;
        self.mirror_x = viewer.mirror_x;
    }

    /// Normalized image point to viewport pixels, undoing the mirrored feed.
    pub fn to_viewport(&self, x: f32, y: f32) -> (f32, f32) {
        let x = x.clamp(0.0, 1.0);
        let y = y.clamp(0.0, 1.0);
        let x = if self.mirror_x { 1.0 - x } else { x };
        (x * self.width as f32, y * self.height as f32)
    }

    fn send(&mut self, cmd: ViewerCommand) -> Result<()> {
        debug!("viewer <- {cmd:?}");
        let line = serde_json::to_string(&cmd)?;
        writeln!(self.out, "{line}")?;
        self.out.flush()?;
        Ok(())
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> CameraSink for JsonCommandSink<W> {
    fn rotate(&mut self, dx: f32, dy: f32) -> Result<()> {
        self.send(ViewerCommand::Rotate { dx, dy })
    }

    fn pan(&mut self, dx: f32, dy: f32) -> Result<()> {
        self.send(ViewerCommand::Pan { dx, dy })
    }

    fn zoom(&mut self, delta: f32) -> Result<()> {
        self.send(ViewerCommand::Zoom { delta })
    }

    fn reset(&mut self) -> Result<()> {
        self.send(ViewerCommand::Reset)
    }

    fn pick(&mut self, x: f32, y: f32) -> Result<()> {
        let (x, y) = self.to_viewport(x, y);
        self.send(ViewerCommand::Pick { x, y })
    }
}

/// Open the command stream named by `viewer.output` (`-` = stdout).
///
/// Opening a FIFO blocks until the viewer opens the read end.
pub fn open_viewer_sink(viewer: &Viewer) -> Result<JsonCommandSink<Box<dyn Write + Send>>> {
    let out: Box<dyn Write + Send> = if viewer.output == "-" {
        Box::new(io::stdout())
    } else {
        info!("viewer: opening {}", viewer.output);
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&viewer.output)
            .map_err(|e| anyhow!("failed to open viewer output {}: {e}", viewer.output))?;
        Box::new(f)
    };
    Ok(JsonCommandSink::new(out, viewer))
}
