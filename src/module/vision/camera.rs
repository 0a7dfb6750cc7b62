//! Camera Functions
//!

use rscam::{Camera, Config};
use std::fs;
use std::io::Write;

/// Represents a V4L2 camera configuration and capture functionality.
pub struct V4l2Camera {
    cap: Camera,
    img_path: String,
}

impl V4l2Camera {
    /// Opens and starts a V4L2 camera.
    ///
    /// # Arguments
    ///
    /// * `device` - Video device path, e.g. "/dev/video0".
    /// * `width`, `height` - Capture resolution.
    /// * `img_path` - File the last captured frame is written to.
    pub fn new(
        device: &str,
        width: u32,
        height: u32,
        img_path: String,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let mut cap = Camera::new(device)?;

        cap.start(&Config {
            interval: (1, 30), // 30 fps.
            resolution: (width, height),
            format: b"MJPG",
            nbuffers: 1,
            ..Default::default()
        })?;

        Ok(Self { cap, img_path })
    }

    /// Captures a frame and saves it to the configured file path.
    ///
    /// Returns the path of the written image.
    pub fn take_picture(&self) -> Result<&str, Box<dyn std::error::Error>> {
        let _ = self.cap.capture(); // Grab a frame to reduce delay.
        let frame = self.cap.capture()?;

        let mut file = fs::File::create(&self.img_path)?;
        file.write_all(&frame[..])?;
        Ok(&self.img_path)
    }
}
