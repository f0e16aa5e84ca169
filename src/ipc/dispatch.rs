use anyhow::Result;

use crate::actions::CameraSink;
use crate::gestures::GestureEvent;

/// Forward one interpreted gesture to the viewer. `None` is a no-op.
pub fn dispatch_gesture<S: CameraSink + ?Sized>(event: &GestureEvent, sink: &mut S) -> Result<()> {
    match *event {
        GestureEvent::Rotate { dx, dy } => sink.rotate(dx, dy),
        GestureEvent::Pan { dx, dy } => sink.pan(dx, dy),
        GestureEvent::Zoom { delta } => sink.zoom(delta),
        GestureEvent::Reset => sink.reset(),
        GestureEvent::Click { x, y } => sink.pick(x, y),
        GestureEvent::None => Ok(()),
    }
}
