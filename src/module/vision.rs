//! Processing related to visual information.
//!
//! One capture+detect worker runs per camera. Workers never touch core
//! state: each captured frame is pushed through the detector and the
//! resulting detection list is enqueued as an event for the control loop.

pub mod camera;
pub mod detector;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use self::camera::V4l2Camera;
use self::detector::Detector;
use super::control::Event;

/// Surface a camera images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Surface {
    Top,
    Bottom,
}

impl Surface {
    pub fn name(&self) -> &'static str {
        match self {
            Surface::Top => "top",
            Surface::Bottom => "bottom",
        }
    }
}

impl std::fmt::Display for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Start a capture+detect worker for one camera.
///
/// The worker loops until the shutdown flag is set, checking it once per
/// iteration so the camera handle is released promptly on exit. Capture
/// or inference errors are logged and the frame is skipped; the worker
/// itself only exits on shutdown.
pub fn run(
    surface: Surface,
    cam: V4l2Camera,
    det: Box<dyn Detector>,
    tx: Sender<Event>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        log::info!("Camera worker started: {}", surface);
        while !shutdown.load(Ordering::Relaxed) {
            let impath = match cam.take_picture() {
                Ok(path) => path.to_string(),
                Err(e) => {
                    log::warn!("Capture failed on {} camera: {}", surface, e);
                    thread::sleep(Duration::from_millis(200));
                    continue;
                }
            };
            match det.detect(&impath) {
                Ok(dets) => {
                    if tx.send(Event::Frame(surface, dets)).is_err() {
                        // Control loop is gone, nothing left to feed.
                        break;
                    }
                }
                Err(e) => log::warn!("Inference failed on {} camera: {}", surface, e),
            }
        }
        log::info!("Camera worker stopped: {}", surface);
    })
}
