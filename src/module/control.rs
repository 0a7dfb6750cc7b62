//! Concurrency Orchestrator.
//!
//! All core state (system mode, the detection session, the observed
//! link state) is owned by one control loop fed through a single mpsc
//! queue. Camera workers and the link manager only enqueue events, so
//! no lock ever guards the session or mode. The loop itself never
//! blocks on I/O: it reads the queue with a timeout and computes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::device::link::{LinkRequest, LinkState};
use super::device::protocol::{DeviceCommand, InboundMsg};
use super::grading::{
    grade_surface_by_count, measure, GradingRules, Measurement, SortCommand, SurfaceGrade,
};
use super::report::ReportSink;
use super::session::{ContinuousGrader, SessionOutcome, SessionTracker, SystemMode};
use super::util::conf::Config;
use super::vision::detector::Detection;
use super::vision::Surface;

/// Queue poll interval; bounds how late a session timeout can fire.
const TICK: Duration = Duration::from_millis(100);

/// Everything the control loop can receive.
#[derive(Debug)]
pub enum Event {
    /// Detections of one frame from one camera.
    Frame(Surface, Vec<Detection>),
    /// Parsed inbound message from the sorting controller.
    Device(InboundMsg),
    /// Link state transition observed by the link manager.
    Link(LinkState),
    /// Operator input.
    Operator(OperatorCommand),
}

/// Operator-issued commands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatorCommand {
    SetMode(SystemMode),
    AutoGrade(bool),
    Shutdown,
}

/// The control loop state.
pub struct Controller {
    mode: SystemMode,
    auto_grade: bool,
    rules: GradingRules,
    conf: Config,
    tracker: SessionTracker,
    continuous: ContinuousGrader,
    link_state: LinkState,
    link_tx: Sender<LinkRequest>,
    sink: Box<dyn ReportSink>,
    /// Last status string from the device, always available for display.
    last_status: String,
}

impl Controller {
    pub fn new(conf: Config, link_tx: Sender<LinkRequest>, sink: Box<dyn ReportSink>) -> Self {
        let rules = conf.grading_rules();
        let tracker = SessionTracker::new(
            rules.clone(),
            Duration::from_millis(conf.session.max_duration_ms),
        );
        let continuous =
            ContinuousGrader::new(Duration::from_millis(conf.session.auto_grade_cooldown_ms));
        let mode = SystemMode::from_string(&conf.system.default_mode);
        let auto_grade = conf.session.auto_grade;
        Self {
            mode,
            auto_grade,
            rules,
            conf,
            tracker,
            continuous,
            link_state: LinkState::Disconnected,
            link_tx,
            sink,
            last_status: String::new(),
        }
    }

    pub fn mode(&self) -> SystemMode {
        self.mode
    }

    pub fn last_status(&self) -> &str {
        &self.last_status
    }

    /// Handle one event. `now` is injected so timing paths are testable.
    ///
    /// Returns `false` when the loop should stop.
    pub fn handle_event(&mut self, event: Event, now: Instant) -> bool {
        match event {
            Event::Frame(surface, dets) => self.handle_frame(surface, dets, now),
            Event::Device(msg) => self.handle_device(msg, now),
            Event::Link(state) => {
                log::info!("Link state: {:?}", state);
                self.link_state = state;
            }
            Event::Operator(cmd) => return self.handle_operator(cmd),
        }
        true
    }

    /// Periodic work: force-finalize a session that outlived its budget.
    pub fn tick(&mut self, now: Instant) {
        if let Some(outcome) = self.tracker.check_timeout(now) {
            self.close_session(outcome);
        }
    }

    fn handle_frame(&mut self, surface: Surface, dets: Vec<Detection>, now: Instant) {
        let measurements = self.measure_frame(surface, &dets);
        match self.mode {
            SystemMode::Trigger => {
                self.tracker.on_frame(surface, measurements);
            }
            SystemMode::Continuous => {
                let live = self.live_grade(surface, &dets, measurements);
                log::debug!("Live grade {}: {}", surface, live);
                if self.auto_grade {
                    if let Some((grade, command)) = self.continuous.maybe_grade(&self.rules, now) {
                        log::info!("Auto-grade: {} -> gate {}", grade, command.0);
                        self.send_gate(command);
                    }
                }
            }
            // Display/logging only; nothing is sent.
            SystemMode::Idle => {
                log::debug!("Frame on {} with {} detections (idle)", surface, dets.len());
            }
        }
    }

    /// Live display grade for one continuous-mode frame.
    ///
    /// Detections that yielded no usable size data (degenerate boxes)
    /// fall back to the count-only grade instead of looking clean.
    fn live_grade(
        &mut self,
        surface: Surface,
        dets: &[Detection],
        measurements: Vec<Measurement>,
    ) -> SurfaceGrade {
        if measurements.is_empty() && !dets.is_empty() {
            return grade_surface_by_count(dets.len());
        }
        self.continuous.on_frame(&self.rules, surface, measurements)
    }

    fn measure_frame(&self, surface: Surface, dets: &[Detection]) -> Vec<Measurement> {
        let calib = self.conf.calibration.for_surface(surface);
        let mut measurements = Vec::with_capacity(dets.len());
        for det in dets {
            match measure(det, &calib) {
                Ok(m) => measurements.push(m),
                // Calibration is validated at startup; log and skip.
                Err(e) => log::error!("Measurement failed on {}: {}", surface, e),
            }
        }
        measurements
    }

    fn handle_device(&mut self, msg: InboundMsg, now: Instant) {
        match msg {
            InboundMsg::BeamBroken => match self.mode {
                SystemMode::Trigger => {
                    self.tracker.on_beam_broken(now);
                }
                mode => {
                    log::info!("Beam broken ignored in {} mode", mode.name());
                }
            },
            InboundMsg::DurationReport(ms) => {
                let length_cm = ms as f64 / 1000.0 * self.conf.conveyor.speed_cm_s;
                log::info!("Beam cleared after {} ms, piece length ~{:.2} cm", ms, length_cm);
                if self.mode == SystemMode::Trigger {
                    if let Some(outcome) = self.tracker.on_beam_cleared() {
                        self.close_session(outcome);
                    }
                }
            }
            InboundMsg::StatusText(text) => {
                log::info!("Device status: {}", text);
                self.last_status = text;
            }
        }
    }

    fn handle_operator(&mut self, cmd: OperatorCommand) -> bool {
        match cmd {
            OperatorCommand::SetMode(mode) => {
                log::info!("Mode change: {} -> {}", self.mode.name(), mode.name());
                self.mode = mode;
                self.continuous.reset();
                // The matching conveyor command; the link layer only
                // transports the byte.
                let device_cmd = match mode {
                    SystemMode::Continuous => DeviceCommand::Continuous,
                    SystemMode::Trigger => DeviceCommand::Trigger,
                    SystemMode::Idle => DeviceCommand::Stop,
                };
                self.send_command(device_cmd);
            }
            OperatorCommand::AutoGrade(enabled) => {
                log::info!("Auto-grade: {}", enabled);
                self.auto_grade = enabled;
            }
            OperatorCommand::Shutdown => {
                log::info!("Shutdown requested");
                return false;
            }
        }
        true
    }

    fn close_session(&mut self, outcome: SessionOutcome) {
        self.sink.emit(&outcome.report);
        self.send_gate(outcome.command);
    }

    fn send_gate(&mut self, command: SortCommand) {
        self.send_command(DeviceCommand::Gate(command));
    }

    fn send_command(&mut self, command: DeviceCommand) {
        if self.link_tx.send(LinkRequest::Send(command)).is_err() {
            log::error!("Link manager is gone, dropping {:?}", command);
        }
    }
}

/// Start the control loop thread.
pub fn run(
    mut controller: Controller,
    rx: Receiver<Event>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        log::info!("Control loop started");
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            match rx.recv_timeout(TICK) {
                Ok(event) => {
                    if !controller.handle_event(event, Instant::now()) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            controller.tick(Instant::now());
        }
        // Tell the producers to wind down as well.
        shutdown.store(true, Ordering::Relaxed);
        log::info!("Control loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::report::SessionReport;
    use std::sync::mpsc;
    use std::sync::Mutex;

    struct RecordingSink(Arc<Mutex<Vec<SessionReport>>>);

    impl ReportSink for RecordingSink {
        fn emit(&mut self, report: &SessionReport) {
            self.0.lock().unwrap().push(report.clone());
        }
    }

    fn test_config(default_mode: &str) -> Config {
        let mut conf = crate::module::util::conf::toml::load_default_for_test();
        conf.system.default_mode = default_mode.to_string();
        conf
    }

    fn controller(
        default_mode: &str,
    ) -> (
        Controller,
        mpsc::Receiver<LinkRequest>,
        Arc<Mutex<Vec<SessionReport>>>,
    ) {
        let (link_tx, link_rx) = mpsc::channel();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Box::new(RecordingSink(reports.clone()));
        let controller = Controller::new(test_config(default_mode), link_tx, sink);
        (controller, link_rx, reports)
    }

    fn defect_det(w: u32, h: u32) -> Detection {
        Detection {
            x1: 0,
            y1: 0,
            x2: w,
            y2: h,
            xc: w as f32 / 2.0,
            yc: h as f32 / 2.0,
            cls: 1,
            prob: 0.9,
            w,
            h,
            label: "unsound_knots".to_string(),
        }
    }

    #[test]
    fn trigger_session_end_to_end_test() {
        let (mut ctl, link_rx, reports) = controller("trigger");
        let t0 = Instant::now();
        assert!(ctl.handle_event(Event::Device(InboundMsg::BeamBroken), t0));
        // Clean piece: no defects on either surface.
        ctl.handle_event(Event::Frame(Surface::Top, vec![]), t0);
        ctl.handle_event(Event::Frame(Surface::Bottom, vec![]), t0);
        ctl.handle_event(
            Event::Device(InboundMsg::DurationReport(800)),
            t0 + Duration::from_millis(800),
        );
        let report = reports.lock().unwrap().pop().unwrap();
        assert_eq!(report.gate, 1);
        assert!(!report.timed_out);
        assert_eq!(
            link_rx.try_recv().unwrap(),
            LinkRequest::Send(DeviceCommand::Gate(SortCommand(1)))
        );
    }

    #[test]
    fn trigger_defective_piece_test() {
        let (mut ctl, link_rx, reports) = controller("trigger");
        let t0 = Instant::now();
        ctl.handle_event(Event::Device(InboundMsg::BeamBroken), t0);
        // A large unsound knot: 200 px at 2.5 px/mm on top = 80 mm.
        ctl.handle_event(Event::Frame(Surface::Top, vec![defect_det(200, 40)]), t0);
        ctl.handle_event(Event::Device(InboundMsg::DurationReport(900)), t0);
        let report = reports.lock().unwrap().pop().unwrap();
        assert_eq!(report.final_grade.to_string(), "G2-4");
        assert_eq!(report.gate, 3);
        assert_eq!(
            link_rx.try_recv().unwrap(),
            LinkRequest::Send(DeviceCommand::Gate(SortCommand(3)))
        );
    }

    #[test]
    fn idle_mode_sends_nothing_test() {
        let (mut ctl, link_rx, reports) = controller("idle");
        let t0 = Instant::now();
        ctl.handle_event(Event::Device(InboundMsg::BeamBroken), t0);
        ctl.handle_event(Event::Frame(Surface::Top, vec![defect_det(200, 40)]), t0);
        ctl.handle_event(Event::Device(InboundMsg::DurationReport(500)), t0);
        assert!(reports.lock().unwrap().is_empty());
        assert!(link_rx.try_recv().is_err());
    }

    #[test]
    fn beam_ignored_in_continuous_test() {
        let (mut ctl, link_rx, reports) = controller("continuous");
        let t0 = Instant::now();
        ctl.handle_event(Event::Device(InboundMsg::BeamBroken), t0);
        ctl.handle_event(Event::Device(InboundMsg::DurationReport(500)), t0);
        // No beam-driven session exists in continuous mode.
        assert!(reports.lock().unwrap().is_empty());
        assert!(link_rx.try_recv().is_err());
    }

    #[test]
    fn continuous_auto_grade_cooldown_test() {
        let (mut ctl, link_rx, _reports) = controller("continuous");
        ctl.handle_event(Event::Operator(OperatorCommand::AutoGrade(true)), Instant::now());
        let t0 = Instant::now();
        // A small unsound knot: 10 px at 2.5 px/mm = 4 mm, still G2-0.
        ctl.handle_event(Event::Frame(Surface::Top, vec![defect_det(10, 10)]), t0);
        // First frame grades immediately.
        assert_eq!(
            link_rx.try_recv().unwrap(),
            LinkRequest::Send(DeviceCommand::Gate(SortCommand(1)))
        );
        // Within the cooldown nothing more is sent.
        ctl.handle_event(
            Event::Frame(Surface::Top, vec![defect_det(10, 10)]),
            t0 + Duration::from_millis(200),
        );
        assert!(link_rx.try_recv().is_err());
        // After the cooldown the next grade goes out.
        ctl.handle_event(
            Event::Frame(Surface::Top, vec![defect_det(10, 10)]),
            t0 + Duration::from_millis(2100),
        );
        assert!(link_rx.try_recv().is_ok());
    }

    #[test]
    fn continuous_empty_conveyor_sends_nothing_test() {
        let (mut ctl, link_rx, _reports) = controller("continuous");
        ctl.handle_event(Event::Operator(OperatorCommand::AutoGrade(true)), Instant::now());
        let t0 = Instant::now();
        // Frames with nothing in view must not drive the gate.
        ctl.handle_event(Event::Frame(Surface::Top, vec![]), t0);
        ctl.handle_event(
            Event::Frame(Surface::Bottom, vec![]),
            t0 + Duration::from_millis(100),
        );
        ctl.handle_event(
            Event::Frame(Surface::Top, vec![]),
            t0 + Duration::from_secs(5),
        );
        assert!(link_rx.try_recv().is_err());
        // The first piece in view is routed right away.
        ctl.handle_event(
            Event::Frame(Surface::Top, vec![defect_det(10, 10)]),
            t0 + Duration::from_secs(6),
        );
        assert_eq!(
            link_rx.try_recv().unwrap(),
            LinkRequest::Send(DeviceCommand::Gate(SortCommand(1)))
        );
    }

    #[test]
    fn live_grade_count_fallback_test() {
        let (mut ctl, _link_rx, _reports) = controller("continuous");
        // Degenerate boxes carry no size data, so the count-only grade
        // applies instead of an optimistic G2-0.
        let degenerate = vec![defect_det(0, 0); 4];
        assert_eq!(
            ctl.live_grade(Surface::Top, &degenerate, vec![]),
            SurfaceGrade::G22
        );
        // With size data present the window grade wins.
        let dets = vec![defect_det(10, 10)];
        let measurements = ctl.measure_frame(Surface::Top, &dets);
        assert_eq!(measurements.len(), 1);
        assert_eq!(
            ctl.live_grade(Surface::Top, &dets, measurements),
            SurfaceGrade::G20
        );
    }

    #[test]
    fn session_timeout_tick_test() {
        let (mut ctl, link_rx, reports) = controller("trigger");
        let t0 = Instant::now();
        ctl.handle_event(Event::Device(InboundMsg::BeamBroken), t0);
        ctl.handle_event(Event::Frame(Surface::Top, vec![defect_det(10, 10)]), t0);
        ctl.tick(t0 + Duration::from_secs(29));
        assert!(reports.lock().unwrap().is_empty());
        // Past max_duration_ms the session is force-finalized.
        ctl.tick(t0 + Duration::from_secs(31));
        let report = reports.lock().unwrap().pop().unwrap();
        assert!(report.timed_out);
        assert!(link_rx.try_recv().is_ok());
    }

    #[test]
    fn mode_change_forwards_device_command_test() {
        let (mut ctl, link_rx, _reports) = controller("idle");
        let now = Instant::now();
        ctl.handle_event(
            Event::Operator(OperatorCommand::SetMode(SystemMode::Trigger)),
            now,
        );
        assert_eq!(ctl.mode(), SystemMode::Trigger);
        assert_eq!(
            link_rx.try_recv().unwrap(),
            LinkRequest::Send(DeviceCommand::Trigger)
        );
        ctl.handle_event(
            Event::Operator(OperatorCommand::SetMode(SystemMode::Idle)),
            now,
        );
        assert_eq!(
            link_rx.try_recv().unwrap(),
            LinkRequest::Send(DeviceCommand::Stop)
        );
    }

    #[test]
    fn status_text_retained_test() {
        let (mut ctl, _link_rx, _reports) = controller("idle");
        ctl.handle_event(
            Event::Device(InboundMsg::StatusText("conveyor ready".to_string())),
            Instant::now(),
        );
        assert_eq!(ctl.last_status(), "conveyor ready");
    }

    #[test]
    fn shutdown_stops_loop_test() {
        let (mut ctl, _link_rx, _reports) = controller("idle");
        assert!(!ctl.handle_event(Event::Operator(OperatorCommand::Shutdown), Instant::now()));
    }
}
