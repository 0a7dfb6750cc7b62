//! Woodsort grades sawn wood panels from camera detections and routes
//! each piece to a sort gate on the conveyor.

pub mod module;
use crate::module::define;
use crate::module::device::link::{self, SorterLink};
use crate::module::report::JsonFileSink;
use crate::module::util::init::resource::init;
use crate::module::vision::camera::V4l2Camera;
use crate::module::vision::detector::onnx::YoloDefect;
use crate::module::vision::Surface;

use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc};

pub fn main() {
    // Prepare directories and configuration.
    let property = init();

    init_log(property.path.dir.data.as_str(), define::system::NAME);
    log::info!("Starting Woodsort...");

    let shutdown = Arc::new(AtomicBool::new(false));
    let (event_tx, event_rx) = mpsc::channel();
    let (link_tx, link_rx) = mpsc::channel();

    // Serial link to the sorting controller.
    let sorter = SorterLink::new(property.conf.sorter.clone());
    let link_handler = link::run(sorter, link_rx, event_tx.clone(), shutdown.clone());

    // One capture+detect worker per surface.
    let mut camera_handlers = Vec::new();
    let cameras = [
        (
            Surface::Top,
            property.conf.camera.top_device.clone(),
            property.path.img.top.clone(),
        ),
        (
            Surface::Bottom,
            property.conf.camera.bottom_device.clone(),
            property.path.img.bottom.clone(),
        ),
    ];
    for (surface, device, img_path) in cameras {
        let cam = match V4l2Camera::new(
            &device,
            property.conf.camera.width as u32,
            property.conf.camera.height as u32,
            img_path,
        ) {
            Ok(cam) => cam,
            Err(e) => {
                log::error!("Can't open {} camera {}: {}", surface, device, e);
                continue;
            }
        };
        let det = match YoloDefect::new() {
            Ok(det) => Box::new(det),
            Err(e) => {
                log::error!("Can't load defect model for {} camera: {}", surface, e);
                continue;
            }
        };
        camera_handlers.push(module::vision::run(
            surface,
            cam,
            det,
            event_tx.clone(),
            shutdown.clone(),
        ));
    }
    if camera_handlers.is_empty() {
        log::warn!("No camera available, running on device events only.");
    }

    // The control loop owns all grading and session state.
    let sink = Box::new(JsonFileSink::new(property.path.dir.report.clone()));
    let controller = module::control::Controller::new(property.conf.clone(), link_tx, sink);
    let control_handler = module::control::run(controller, event_rx, shutdown.clone());

    // The control loop sets the shutdown flag on exit and the workers follow.
    let _ = control_handler.join();
    for handler in camera_handlers {
        let _ = handler.join();
    }
    let _ = link_handler.join();
    log::info!("Woodsort stopped.");
}

/// Initialize the log4rs file logger.
///
/// # Arguments
/// * `dir` - Directory the log file is stored under.
/// * `name` - Logger and log file name.
fn init_log(dir: &str, name: &str) {
    use crate::module::util::path::join;
    use log::LevelFilter;
    use log4rs::append::file::FileAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let logfile = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{h({d} - {l}: {m}{n})}")))
        .build(join(&[
            dir,
            define::path::LOG_DIR,
            &format!("{}.log", name),
        ]))
        .unwrap();

    let config = Config::builder()
        .appender(Appender::builder().build("logfile", Box::new(logfile)))
        .build(Root::builder().appender("logfile").build(LevelFilter::Info))
        .unwrap();
    log4rs::init_config(config).unwrap();
}
