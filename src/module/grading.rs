//! Measurement and Grading Engine.
//!
//! Converts raw detections into physical measurements and SS-EN 1611-1
//! style surface grades. Everything here is pure and deterministic: the
//! only failure mode is a non-positive calibration factor.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::vision::detector::Detection;

/// Grading errors.
#[derive(Debug, Error, PartialEq)]
pub enum GradingError {
    /// Calibration factor is zero or negative. Fatal at startup.
    #[error("invalid calibration: pixels_per_mm = {0}")]
    InvalidCalibration(f64),
    /// Detection bbox has no extent, so there is no size to grade.
    #[error("detection carries no measurable extent")]
    DegenerateDetection,
}

/// Defect classification used by the threshold tables.
///
/// Unsound knots are graded more strictly than sound knots at the same
/// physical size, which is why the two classes carry independent tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DefectClass {
    SoundKnot,
    UnsoundKnot,
}

impl DefectClass {
    /// Map a model output label to a standardized defect class.
    ///
    /// Unknown labels fall back to `UnsoundKnot` so an unrecognized
    /// defect is never graded optimistically.
    pub fn from_label(label: &str) -> DefectClass {
        let normalized = label.to_lowercase().replace('_', " ");
        match normalized.trim() {
            "sound knots" | "sound knot" | "live knot" => DefectClass::SoundKnot,
            "unsound knots" | "unsound knot" | "dead knot" | "missing knot" | "crack knot" => {
                DefectClass::UnsoundKnot
            }
            _ => DefectClass::UnsoundKnot,
        }
    }
}

/// Surface grade per SS-EN 1611-1, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SurfaceGrade {
    G20,
    G21,
    G22,
    G23,
    G24,
}

impl SurfaceGrade {
    /// All grades in ascending severity.
    pub const ALL: [SurfaceGrade; 5] = [
        SurfaceGrade::G20,
        SurfaceGrade::G21,
        SurfaceGrade::G22,
        SurfaceGrade::G23,
        SurfaceGrade::G24,
    ];

    /// Convert a severity index to a grade.
    pub fn from_index(i: usize) -> SurfaceGrade {
        Self::ALL[i.min(4)]
    }

    /// Severity index (0 = best, 4 = worst).
    pub fn index(&self) -> usize {
        match self {
            SurfaceGrade::G20 => 0,
            SurfaceGrade::G21 => 1,
            SurfaceGrade::G22 => 2,
            SurfaceGrade::G23 => 3,
            SurfaceGrade::G24 => 4,
        }
    }
}

impl std::fmt::Display for SurfaceGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SurfaceGrade::G20 => "G2-0",
            SurfaceGrade::G21 => "G2-1",
            SurfaceGrade::G22 => "G2-2",
            SurfaceGrade::G23 => "G2-3",
            SurfaceGrade::G24 => "G2-4",
        };
        write!(f, "{}", s)
    }
}

/// A single defect measurement derived from one detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub class: DefectClass,
    pub size_mm: f64,
    pub size_pct: f64,
}

/// Per-camera pixel-to-physical calibration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CameraCalibration {
    /// Pixels per millimeter at the imaging plane.
    pub pixels_per_mm: f64,
    /// Width of the panel the percentage figures are relative to.
    pub reference_width_mm: f64,
}

impl CameraCalibration {
    /// Validate the calibration. Both factors must be positive.
    pub fn validate(&self) -> Result<(), GradingError> {
        if self.pixels_per_mm <= 0.0 {
            return Err(GradingError::InvalidCalibration(self.pixels_per_mm));
        }
        if self.reference_width_mm <= 0.0 {
            return Err(GradingError::InvalidCalibration(self.reference_width_mm));
        }
        Ok(())
    }
}

/// Ascending (max_size_mm, max_size_pct) bounds for G2-0..G2-3.
///
/// A measurement satisfying *either* bound (inclusive) of a row gets that
/// row's grade; a measurement exceeding every row is G2-4.
pub type ThresholdTable = [(f64, f64); 4];

/// Default bounds for sound knots.
pub const DEFAULT_SOUND_THRESHOLDS: ThresholdTable =
    [(10.0, 5.0), (30.0, 15.0), (50.0, 25.0), (70.0, 35.0)];

/// Default bounds for unsound knots.
pub const DEFAULT_UNSOUND_THRESHOLDS: ThresholdTable =
    [(7.0, 3.5), (20.0, 10.0), (35.0, 17.5), (50.0, 25.0)];

/// Grade-to-sort-gate mapping.
///
/// Gate semantics are deployment-specific, so the table is part of the
/// configuration surface rather than a hardcoded constant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GateMap {
    pub g2_0: u8,
    pub g2_1: u8,
    pub g2_2: u8,
    pub g2_3: u8,
    pub g2_4: u8,
}

impl Default for GateMap {
    fn default() -> Self {
        // Good: G2-0 | Fair: G2-1..G2-3 | Poor: G2-4
        Self {
            g2_0: 1,
            g2_1: 2,
            g2_2: 2,
            g2_3: 2,
            g2_4: 3,
        }
    }
}

/// Sort gate command for the conveyor diverter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortCommand(pub u8);

impl SortCommand {
    /// ASCII byte sent on the wire.
    pub fn to_byte(self) -> u8 {
        b'0' + self.0
    }
}

/// Grading rule set: the two threshold tables plus the gate map.
#[derive(Debug, Clone)]
pub struct GradingRules {
    pub sound: ThresholdTable,
    pub unsound: ThresholdTable,
    pub gates: GateMap,
}

impl Default for GradingRules {
    fn default() -> Self {
        Self {
            sound: DEFAULT_SOUND_THRESHOLDS,
            unsound: DEFAULT_UNSOUND_THRESHOLDS,
            gates: GateMap::default(),
        }
    }
}

impl GradingRules {
    /// Grade a single defect measurement against its class table.
    pub fn grade_defect(&self, m: &Measurement) -> SurfaceGrade {
        let table = match m.class {
            DefectClass::SoundKnot => &self.sound,
            DefectClass::UnsoundKnot => &self.unsound,
        };
        for (i, (max_mm, max_pct)) in table.iter().enumerate() {
            if m.size_mm <= *max_mm || m.size_pct <= *max_pct {
                return SurfaceGrade::from_index(i);
            }
        }
        SurfaceGrade::G24
    }

    /// Grade one surface from all measurements of one session.
    ///
    /// The worst individual grade and the defect-count ceiling are
    /// independent signals; the coarser of the two wins, so adding a
    /// defect can never improve the result.
    pub fn grade_surface(&self, measurements: &[Measurement]) -> SurfaceGrade {
        if measurements.is_empty() {
            return SurfaceGrade::G20;
        }
        let worst = measurements
            .iter()
            .map(|m| self.grade_defect(m))
            .max()
            .unwrap_or(SurfaceGrade::G20);
        match measurements.len() {
            n if n > 6 => SurfaceGrade::G24,
            n if n > 4 => worst.max(SurfaceGrade::G23),
            n if n > 2 => worst.max(SurfaceGrade::G22),
            _ => worst,
        }
    }

    /// Combine two surface grades into the final grade for the piece.
    ///
    /// A missing surface grade counts as G2-0; the worse surface decides.
    pub fn combine_final(
        &self,
        top: Option<SurfaceGrade>,
        bottom: Option<SurfaceGrade>,
    ) -> SurfaceGrade {
        let top = top.unwrap_or(SurfaceGrade::G20);
        let bottom = bottom.unwrap_or(SurfaceGrade::G20);
        top.max(bottom)
    }

    /// Map a final grade to the sort gate command.
    pub fn to_command(&self, grade: SurfaceGrade) -> SortCommand {
        let gate = match grade {
            SurfaceGrade::G20 => self.gates.g2_0,
            SurfaceGrade::G21 => self.gates.g2_1,
            SurfaceGrade::G22 => self.gates.g2_2,
            SurfaceGrade::G23 => self.gates.g2_3,
            SurfaceGrade::G24 => self.gates.g2_4,
        };
        SortCommand(gate)
    }
}

/// Convert one detection to a physical measurement.
///
/// The larger bbox dimension is taken as the defect size (worst case for
/// grading).
pub fn measure(
    det: &Detection,
    calib: &CameraCalibration,
) -> Result<Measurement, GradingError> {
    calib.validate()?;
    let max_dimension_px = det.w.max(det.h) as f64;
    if max_dimension_px <= 0.0 {
        return Err(GradingError::DegenerateDetection);
    }
    let size_mm = max_dimension_px / calib.pixels_per_mm;
    let size_pct = size_mm / calib.reference_width_mm * 100.0;
    Ok(Measurement {
        class: DefectClass::from_label(&det.label),
        size_mm,
        size_pct,
    })
}

/// Legacy count-only surface grade for frames without size data.
///
/// Kept as a fallback from an earlier revision of the grading scheme;
/// the size-based scheme above is canonical.
pub fn grade_surface_by_count(total_defects: usize) -> SurfaceGrade {
    match total_defects {
        0 => SurfaceGrade::G20,
        1..=2 => SurfaceGrade::G20,
        3..=6 => SurfaceGrade::G22,
        _ => SurfaceGrade::G24,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(class: DefectClass, size_mm: f64, size_pct: f64) -> Measurement {
        Measurement {
            class,
            size_mm,
            size_pct,
        }
    }

    fn det(label: &str, w: u32, h: u32) -> Detection {
        Detection {
            x1: 0,
            y1: 0,
            x2: w,
            y2: h,
            xc: w as f32 / 2.0,
            yc: h as f32 / 2.0,
            cls: 0,
            prob: 0.9,
            w,
            h,
            label: label.to_string(),
        }
    }

    #[test]
    fn grade_ordering_test() {
        assert!(SurfaceGrade::G20 < SurfaceGrade::G21);
        assert!(SurfaceGrade::G23 < SurfaceGrade::G24);
        assert_eq!(SurfaceGrade::from_index(9), SurfaceGrade::G24);
        assert_eq!(format!("{}", SurfaceGrade::G22), "G2-2");
    }

    #[test]
    fn label_mapping_test() {
        assert_eq!(DefectClass::from_label("Sound_Knots"), DefectClass::SoundKnot);
        assert_eq!(DefectClass::from_label("live knot"), DefectClass::SoundKnot);
        assert_eq!(DefectClass::from_label("dead_knot"), DefectClass::UnsoundKnot);
        // Unknown labels are graded conservatively.
        assert_eq!(DefectClass::from_label("mystery"), DefectClass::UnsoundKnot);
    }

    #[test]
    fn measure_test() {
        let calib = CameraCalibration {
            pixels_per_mm: 2.5,
            reference_width_mm: 115.0,
        };
        let m = measure(&det("sound knots", 20, 10), &calib).unwrap();
        // 20 px at 2.5 px/mm -> 8 mm, 8/115 -> ~6.96 %
        assert!((m.size_mm - 8.0).abs() < 1e-9);
        assert!((m.size_pct - 8.0 / 115.0 * 100.0).abs() < 1e-9);
        assert_eq!(m.class, DefectClass::SoundKnot);
    }

    #[test]
    fn measure_invalid_calibration_test() {
        let calib = CameraCalibration {
            pixels_per_mm: 0.0,
            reference_width_mm: 115.0,
        };
        assert_eq!(
            measure(&det("sound knots", 20, 10), &calib),
            Err(GradingError::InvalidCalibration(0.0))
        );
    }

    #[test]
    fn measure_degenerate_detection_test() {
        let calib = CameraCalibration {
            pixels_per_mm: 2.5,
            reference_width_mm: 115.0,
        };
        // A zero-extent bbox must not be measured as a 0 mm (best grade)
        // defect.
        assert_eq!(
            measure(&det("unsound knots", 0, 0), &calib),
            Err(GradingError::DegenerateDetection)
        );
    }

    #[test]
    fn grade_defect_boundary_test() {
        let rules = GradingRules::default();
        // Exactly on the G2-0 bound resolves to the better grade (inclusive).
        let on_bound = m(DefectClass::SoundKnot, 10.0, 99.0);
        assert_eq!(rules.grade_defect(&on_bound), SurfaceGrade::G20);
        // Just past both bounds drops to the next grade.
        let past_bound = m(DefectClass::SoundKnot, 10.1, 5.1);
        assert_eq!(rules.grade_defect(&past_bound), SurfaceGrade::G21);
    }

    #[test]
    fn grade_defect_class_asymmetry_test() {
        let rules = GradingRules::default();
        // The same physical size grades worse for an unsound knot.
        let sound = m(DefectClass::SoundKnot, 9.0, 40.0);
        let unsound = m(DefectClass::UnsoundKnot, 9.0, 40.0);
        assert_eq!(rules.grade_defect(&sound), SurfaceGrade::G20);
        assert_eq!(rules.grade_defect(&unsound), SurfaceGrade::G21);
    }

    #[test]
    fn grade_defect_worst_test() {
        let rules = GradingRules::default();
        let huge = m(DefectClass::UnsoundKnot, 80.0, 60.0);
        assert_eq!(rules.grade_defect(&huge), SurfaceGrade::G24);
    }

    #[test]
    fn grade_surface_empty_test() {
        let rules = GradingRules::default();
        assert_eq!(rules.grade_surface(&[]), SurfaceGrade::G20);
    }

    #[test]
    fn grade_surface_count_ceiling_test() {
        let rules = GradingRules::default();
        // Five individually-good unsound defects are capped at G2-3.
        let small = m(DefectClass::UnsoundKnot, 5.0, 2.0);
        let five = vec![small.clone(); 5];
        assert_eq!(rules.grade_surface(&five), SurfaceGrade::G23);
        // Three are capped at G2-2.
        let three = vec![small.clone(); 3];
        assert_eq!(rules.grade_surface(&three), SurfaceGrade::G22);
        // Seven force the worst grade.
        let seven = vec![small; 7];
        assert_eq!(rules.grade_surface(&seven), SurfaceGrade::G24);
    }

    #[test]
    fn grade_surface_monotonic_test() {
        let rules = GradingRules::default();
        let small = m(DefectClass::SoundKnot, 5.0, 2.0);
        let mut list = vec![];
        let mut previous = rules.grade_surface(&list);
        for _ in 0..10 {
            list.push(small.clone());
            let current = rules.grade_surface(&list);
            // Adding a defect never improves the grade.
            assert!(current >= previous);
            previous = current;
        }
    }

    #[test]
    fn combine_final_test() {
        let rules = GradingRules::default();
        for g in SurfaceGrade::ALL {
            assert_eq!(rules.combine_final(Some(g), Some(g)), g);
        }
        assert_eq!(
            rules.combine_final(Some(SurfaceGrade::G20), Some(SurfaceGrade::G24)),
            SurfaceGrade::G24
        );
        assert_eq!(rules.combine_final(None, None), SurfaceGrade::G20);
        assert_eq!(
            rules.combine_final(None, Some(SurfaceGrade::G21)),
            SurfaceGrade::G21
        );
    }

    #[test]
    fn to_command_total_test() {
        let rules = GradingRules::default();
        // Every grade maps to an explicit gate, no default fallthrough.
        assert_eq!(rules.to_command(SurfaceGrade::G20), SortCommand(1));
        assert_eq!(rules.to_command(SurfaceGrade::G21), SortCommand(2));
        assert_eq!(rules.to_command(SurfaceGrade::G22), SortCommand(2));
        assert_eq!(rules.to_command(SurfaceGrade::G23), SortCommand(2));
        assert_eq!(rules.to_command(SurfaceGrade::G24), SortCommand(3));
        assert_eq!(SortCommand(3).to_byte(), b'3');
    }

    #[test]
    fn end_to_end_clean_piece_test() {
        let rules = GradingRules::default();
        let calib = CameraCalibration {
            pixels_per_mm: 2.5,
            reference_width_mm: 200.0,
        };
        // One 8 mm / 4 % sound knot on top, nothing on the bottom.
        let top = vec![measure(&det("sound knots", 20, 12), &calib).unwrap()];
        assert!((top[0].size_mm - 8.0).abs() < 1e-9);
        assert!((top[0].size_pct - 4.0).abs() < 1e-9);
        let top_grade = rules.grade_surface(&top);
        let bottom_grade = rules.grade_surface(&[]);
        assert_eq!(top_grade, SurfaceGrade::G20);
        assert_eq!(bottom_grade, SurfaceGrade::G20);
        let final_grade = rules.combine_final(Some(top_grade), Some(bottom_grade));
        assert_eq!(rules.to_command(final_grade), SortCommand(1));
    }

    #[test]
    fn legacy_count_grade_test() {
        assert_eq!(grade_surface_by_count(0), SurfaceGrade::G20);
        assert_eq!(grade_surface_by_count(2), SurfaceGrade::G20);
        assert_eq!(grade_surface_by_count(5), SurfaceGrade::G22);
        assert_eq!(grade_surface_by_count(7), SurfaceGrade::G24);
    }
}
