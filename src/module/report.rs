//! Session reporting.
//!
//! The core only produces the report document; persistence and
//! formatting (PDF, e-mail, JSON logs) are external collaborators
//! reached through the `ReportSink` seam.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::grading::{Measurement, SurfaceGrade};

/// Summary of one closed detection session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub top_grade: SurfaceGrade,
    pub bottom_grade: SurfaceGrade,
    pub final_grade: SurfaceGrade,
    /// Sort gate the piece was routed to.
    pub gate: u8,
    /// Session was force-finalized by the duration guard.
    pub timed_out: bool,
    /// Measurements keyed by surface name.
    pub measurements: HashMap<String, Vec<Measurement>>,
}

/// Destination for closed-session reports.
pub trait ReportSink: Send {
    fn emit(&mut self, report: &SessionReport);
}

/// Default sink: one JSON document per session in the log.
pub struct LogSink;

impl ReportSink for LogSink {
    fn emit(&mut self, report: &SessionReport) {
        match serde_json::to_string(report) {
            Ok(doc) => log::info!("Session closed: {}", doc),
            Err(e) => log::error!("Failed to serialize session report: {}", e),
        }
    }
}

/// Sink writing one JSON file per session into the report directory,
/// in addition to the log line. A failed write is logged, never fatal.
pub struct JsonFileSink {
    dir: String,
    log: LogSink,
}

impl JsonFileSink {
    pub fn new(dir: String) -> Self {
        Self { dir, log: LogSink }
    }
}

impl ReportSink for JsonFileSink {
    fn emit(&mut self, report: &SessionReport) {
        self.log.emit(report);
        let path = crate::module::util::path::join(&[
            &self.dir,
            &format!("{}.json", report.session_id),
        ]);
        let res = match serde_json::to_string_pretty(report) {
            Ok(doc) => std::fs::write(&path, doc),
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
        };
        if let Err(e) = res {
            log::error!("Failed to write session report {}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::grading::SurfaceGrade;
    use std::fs;

    fn report() -> SessionReport {
        SessionReport {
            session_id: Uuid::new_v4(),
            start_time: Utc::now(),
            end_time: Utc::now(),
            top_grade: SurfaceGrade::G20,
            bottom_grade: SurfaceGrade::G21,
            final_grade: SurfaceGrade::G21,
            gate: 2,
            timed_out: false,
            measurements: HashMap::new(),
        }
    }

    #[test]
    fn json_file_sink_test() {
        let dir = "/tmp/woodsorttest/report";
        fs::create_dir_all(dir).unwrap();
        let report = report();
        let mut sink = JsonFileSink::new(dir.to_string());
        sink.emit(&report);
        let path = format!("{}/{}.json", dir, report.session_id);
        let doc = fs::read_to_string(path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&doc).unwrap();
        assert_eq!(value["final_grade"], "G21");
        assert_eq!(value["gate"], 2);
    }
}
