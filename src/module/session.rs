//! Detection Session State Machine.
//!
//! A session is the bounded window, delimited by beam-broken and
//! beam-cleared, during which detections for one physical piece are
//! accumulated. Exactly one session may be open at a time; a stuck
//! beam is handled by force-finalizing after a maximum duration.
//!
//! The tracker is pure bookkeeping: it is driven by the control loop
//! and never performs I/O, so every transition is directly testable.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use uuid::Uuid;

use super::grading::{GradingRules, Measurement, SortCommand, SurfaceGrade};
use super::report::SessionReport;
use super::vision::Surface;

/// Operator-selected system mode, orthogonal to the session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMode {
    /// All grading suppressed; events logged for display only.
    Idle,
    /// Beam signals open and close grading sessions.
    Trigger,
    /// Live per-frame grading, optionally auto-sent on a cooldown.
    Continuous,
}

impl SystemMode {
    pub fn from_string(s: &str) -> SystemMode {
        match s {
            "trigger" => SystemMode::Trigger,
            "continuous" => SystemMode::Continuous,
            _ => SystemMode::Idle,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SystemMode::Idle => "idle",
            SystemMode::Trigger => "trigger",
            SystemMode::Continuous => "continuous",
        }
    }
}

/// Lifecycle state of the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Accumulating,
}

/// One open detection session.
#[derive(Debug)]
struct DetectionSession {
    id: Uuid,
    start_time: chrono::DateTime<Utc>,
    started_at: Instant,
    measurements: HashMap<Surface, Vec<Measurement>>,
}

impl DetectionSession {
    fn open(now: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            start_time: Utc::now(),
            started_at: now,
            measurements: HashMap::new(),
        }
    }
}

/// A finalized session: the report plus the gate command to send.
#[derive(Debug)]
pub struct SessionOutcome {
    pub report: SessionReport,
    pub command: SortCommand,
}

/// Beam-driven session bookkeeping.
pub struct SessionTracker {
    rules: GradingRules,
    max_duration: Duration,
    session: Option<DetectionSession>,
}

impl SessionTracker {
    pub fn new(rules: GradingRules, max_duration: Duration) -> Self {
        Self {
            rules,
            max_duration,
            session: None,
        }
    }

    pub fn state(&self) -> SessionState {
        match self.session {
            Some(_) => SessionState::Accumulating,
            None => SessionState::Idle,
        }
    }

    /// Beam broken: open a new session.
    ///
    /// A beam-broken while a session is already open is discarded; a
    /// piece must fully clear the beam before the next is accepted.
    /// Returns whether a session was opened.
    pub fn on_beam_broken(&mut self, now: Instant) -> bool {
        if let Some(session) = &self.session {
            log::warn!(
                "Beam broken while session {} is still open, ignoring",
                session.id
            );
            return false;
        }
        let session = DetectionSession::open(now);
        log::info!("Session {} opened", session.id);
        self.session = Some(session);
        true
    }

    /// Append the measurements of one frame to the open session.
    ///
    /// Duplicate frames only add noise, never systemic error: grading
    /// happens at finalize, over the whole buffer. A no-op when no
    /// session is open.
    pub fn on_frame(&mut self, surface: Surface, measurements: Vec<Measurement>) {
        if let Some(session) = &mut self.session {
            session
                .measurements
                .entry(surface)
                .or_default()
                .extend(measurements);
        }
    }

    /// Beam cleared: finalize the open session.
    pub fn on_beam_cleared(&mut self) -> Option<SessionOutcome> {
        match self.session.take() {
            Some(session) => Some(self.finalize(session, false)),
            None => {
                log::warn!("Beam cleared without an open session, ignoring");
                None
            }
        }
    }

    /// Force-finalize a session that outlived the maximum duration.
    ///
    /// A designed degradation path, not an error: a stuck beam sensor
    /// must not wedge the machine in Accumulating forever.
    pub fn check_timeout(&mut self, now: Instant) -> Option<SessionOutcome> {
        let expired = match &self.session {
            Some(session) => now.saturating_duration_since(session.started_at) > self.max_duration,
            None => false,
        };
        if !expired {
            return None;
        }
        let session = self.session.take()?;
        log::warn!(
            "Session {} exceeded {:?}, force-finalizing with partial data",
            session.id,
            self.max_duration
        );
        Some(self.finalize(session, true))
    }

    fn finalize(&self, session: DetectionSession, timed_out: bool) -> SessionOutcome {
        let empty = Vec::new();
        let top = session.measurements.get(&Surface::Top).unwrap_or(&empty);
        let bottom = session.measurements.get(&Surface::Bottom).unwrap_or(&empty);
        let top_grade = self.rules.grade_surface(top);
        let bottom_grade = self.rules.grade_surface(bottom);
        let final_grade = self.rules.combine_final(Some(top_grade), Some(bottom_grade));
        let command = self.rules.to_command(final_grade);
        log::info!(
            "Session {} graded: top={} bottom={} final={} gate={}",
            session.id,
            top_grade,
            bottom_grade,
            final_grade,
            command.0
        );
        let measurements = session
            .measurements
            .into_iter()
            .map(|(surface, list)| (surface.name().to_string(), list))
            .collect();
        SessionOutcome {
            report: SessionReport {
                session_id: session.id,
                start_time: session.start_time,
                end_time: Utc::now(),
                top_grade,
                bottom_grade,
                final_grade,
                gate: command.0,
                timed_out,
                measurements,
            },
            command,
        }
    }
}

/// Continuous-mode live grading over the most recent frame per camera.
///
/// There is no beam-driven session here: each frame replaces that
/// camera's window, and when auto-grade is on a final grade goes to the
/// sorter at most once per cooldown so the actuator is not flooded
/// while the same piece is still in view.
pub struct ContinuousGrader {
    cooldown: Duration,
    latest: HashMap<Surface, Vec<Measurement>>,
    last_sent: Option<Instant>,
}

impl ContinuousGrader {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            latest: HashMap::new(),
            last_sent: None,
        }
    }

    /// Replace the window for one camera and return its live grade.
    pub fn on_frame(
        &mut self,
        rules: &GradingRules,
        surface: Surface,
        measurements: Vec<Measurement>,
    ) -> SurfaceGrade {
        let grade = rules.grade_surface(&measurements);
        self.latest.insert(surface, measurements);
        grade
    }

    /// Compute the current final grade and command if the cooldown allows.
    ///
    /// An empty conveyor produces no command: with nothing in view there
    /// is nothing to route, and the cooldown is left untouched so the
    /// next piece is graded without delay.
    pub fn maybe_grade(
        &mut self,
        rules: &GradingRules,
        now: Instant,
    ) -> Option<(SurfaceGrade, SortCommand)> {
        if self.latest.values().all(|m| m.is_empty()) {
            return None;
        }
        if let Some(last) = self.last_sent {
            if now.saturating_duration_since(last) < self.cooldown {
                return None;
            }
        }
        let top = self
            .latest
            .get(&Surface::Top)
            .map(|m| rules.grade_surface(m));
        let bottom = self
            .latest
            .get(&Surface::Bottom)
            .map(|m| rules.grade_surface(m));
        let final_grade = rules.combine_final(top, bottom);
        self.last_sent = Some(now);
        Some((final_grade, rules.to_command(final_grade)))
    }

    /// Drop the window, e.g. on a mode change.
    pub fn reset(&mut self) {
        self.latest.clear();
        self.last_sent = None;
    }
}
