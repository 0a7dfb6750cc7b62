//! Config Handler.

use serde::{Deserialize, Serialize};

use crate::module::grading::{
    CameraCalibration, GateMap, GradingRules, ThresholdTable,
};
use crate::module::vision::Surface;

/// Provides TOML config file handling.
pub mod toml {

    use super::DEFAULT_CONFIG;
    use crate::module::define;
    use std::fs::File;
    use std::io::prelude::*;
    use std::path::Path;

    /// Loads a configuration file from the given directory.
    /// If not found, generates a default config file.
    ///
    /// Invalid configuration is fatal at startup.
    ///
    /// # Arguments
    ///
    /// * `dir` - The directory where the configuration file is located or should be created.
    pub fn load(dir: &str) -> Result<super::Config, Box<dyn std::error::Error>> {
        // Check if the config file exists
        let path = Path::new(dir).join(define::path::CONF_FILE);
        let exist: bool = path.is_file();

        if !exist {
            // Create the default config if it doesn't exist
            let config: super::Config = toml::from_str(DEFAULT_CONFIG)?;
            let toml_str = toml::to_string(&config)?;
            let mut file = File::create(&path)?;
            file.write_all(toml_str.as_bytes())?;
        }

        // Load the config
        let conf_str: String = std::fs::read_to_string(&path)?;
        let conf: super::Config = toml::from_str(&conf_str)?;
        conf.validate()?;
        Ok(conf)
    }

    /// Build the default configuration without touching the filesystem.
    #[cfg(test)]
    pub fn load_default_for_test() -> super::Config {
        toml::from_str(DEFAULT_CONFIG).unwrap()
    }

    /// Saves a configuration file to the given directory.
    pub fn save(dir: &str, conf: super::Config) -> Result<(), Box<dyn std::error::Error>> {
        let toml_str = toml::to_string(&conf)?;
        let path = crate::module::util::path::join(&[dir, define::path::CONF_FILE]);
        let mut file = File::create(path)?;
        file.write_all(toml_str.as_bytes())?;
        Ok(())
    }
}

/// Represents the configuration data structure.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub system: System,
    pub camera: Camera,
    pub calibration: Calibration,
    pub grading: Grading,
    pub gates: GateMap,
    pub session: Session,
    pub sorter: Sorter,
    pub conveyor: Conveyor,
}

impl Config {
    /// Validate the configuration. Fatal at startup when it fails.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.calibration.for_surface(Surface::Top).validate()?;
        self.calibration.for_surface(Surface::Bottom).validate()?;
        if self.grading.sound_thresholds.len() != 4 || self.grading.unsound_thresholds.len() != 4 {
            return Err("grading threshold tables must hold 4 rows (G2-0..G2-3)".into());
        }
        if self.sorter.ports.is_empty() {
            return Err("sorter candidate port list is empty".into());
        }
        let gates = [
            self.gates.g2_0,
            self.gates.g2_1,
            self.gates.g2_2,
            self.gates.g2_3,
            self.gates.g2_4,
        ];
        if gates.iter().any(|g| !(1..=3).contains(g)) {
            return Err("gate map values must be within 1..=3".into());
        }
        Ok(())
    }

    /// Build the grading rule set from the configured tables.
    pub fn grading_rules(&self) -> GradingRules {
        GradingRules {
            sound: self.grading.table(&self.grading.sound_thresholds),
            unsound: self.grading.table(&self.grading.unsound_thresholds),
            gates: self.gates,
        }
    }
}

/// Represents system-related configuration parameters.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct System {
    /// Mode selected at startup ('idle', 'trigger', 'continuous').
    pub default_mode: String,
}

/// Represents camera-related configuration parameters.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Camera {
    pub top_device: String,
    pub bottom_device: String,
    pub width: u16,
    pub height: u16,
}

/// Per-camera pixel-to-physical calibration parameters.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Calibration {
    pub top_pixels_per_mm: f64,
    pub bottom_pixels_per_mm: f64,
    /// Nominal panel width the percentage figures are relative to.
    pub reference_width_mm: f64,
}

impl Calibration {
    pub fn for_surface(&self, surface: Surface) -> CameraCalibration {
        let pixels_per_mm = match surface {
            Surface::Top => self.top_pixels_per_mm,
            Surface::Bottom => self.bottom_pixels_per_mm,
        };
        CameraCalibration {
            pixels_per_mm,
            reference_width_mm: self.reference_width_mm,
        }
    }
}

/// SS-EN 1611-1 threshold tables, one row per grade G2-0..G2-3.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Grading {
    pub sound_thresholds: Vec<[f64; 2]>,
    pub unsound_thresholds: Vec<[f64; 2]>,
}

impl Grading {
    fn table(&self, rows: &[[f64; 2]]) -> ThresholdTable {
        // Length is checked in Config::validate.
        [
            (rows[0][0], rows[0][1]),
            (rows[1][0], rows[1][1]),
            (rows[2][0], rows[2][1]),
            (rows[3][0], rows[3][1]),
        ]
    }
}

/// Session lifecycle parameters.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Session {
    /// Force-finalize a session open longer than this.
    pub max_duration_ms: u64,
    /// Minimum gap between auto-grade commands in continuous mode.
    pub auto_grade_cooldown_ms: u64,
    /// Whether continuous mode sends grades on its own.
    pub auto_grade: bool,
}

/// Sorting controller link parameters.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Sorter {
    /// Candidate ports in priority order.
    pub ports: Vec<String>,
    pub baud: u32,
    /// Delay after open while the controller resets.
    pub settle_ms: u64,
    pub read_timeout_ms: u64,
    /// Minimum gap between outbound commands.
    pub command_interval_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
}

/// Conveyor parameters.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Conveyor {
    /// Belt speed used to estimate piece length from beam duration.
    pub speed_cm_s: f64,
}

// Default configuration data in TOML format
const DEFAULT_CONFIG: &str = r#"
[system]
  default_mode = 'trigger' # Startup mode ('idle', 'trigger', 'continuous')

[camera]
  top_device = '/dev/video0' # Top surface camera
  bottom_device = '/dev/video2' # Bottom surface camera
  width = 1280 # Capture width
  height = 720 # Capture height

[calibration]
  top_pixels_per_mm = 2.5 # Top camera at 37cm working distance
  bottom_pixels_per_mm = 3.333 # Bottom camera at 29cm working distance
  reference_width_mm = 115.0 # Nominal panel width (11.5cm)

[grading]
  # Ascending [max_mm, max_pct] rows for G2-0..G2-3; beyond the last row is G2-4.
  sound_thresholds = [[10.0, 5.0], [30.0, 15.0], [50.0, 25.0], [70.0, 35.0]]
  unsound_thresholds = [[7.0, 3.5], [20.0, 10.0], [35.0, 17.5], [50.0, 25.0]]

[gates]
  # Sort gate per final grade. Gate semantics are deployment-specific.
  g2_0 = 1
  g2_1 = 2
  g2_2 = 2
  g2_3 = 2
  g2_4 = 3

[session]
  max_duration_ms = 30000 # Force-finalize a session open longer than this
  auto_grade_cooldown_ms = 2000 # Minimum gap between auto-grade commands
  auto_grade = false # Send grades automatically in continuous mode

[sorter]
  ports = [
    '/dev/ttyACM0', '/dev/ttyACM1', '/dev/ttyACM2', '/dev/ttyACM3',
    '/dev/ttyUSB0', '/dev/ttyUSB1', '/dev/ttyUSB2', '/dev/ttyUSB3',
    '/dev/ttyUSB01', '/dev/ttyACM01',
    '/dev/ttyAMA0', '/dev/ttyAMA1', '/dev/ttyAMA10',
    'COM3', 'COM4', 'COM5', 'COM6', 'COM7', 'COM8', 'COM9', 'COM10',
  ] # Candidate ports in priority order
  baud = 9600
  settle_ms = 3000 # Controller resets on open
  read_timeout_ms = 50
  command_interval_ms = 100 # Minimum gap between outbound commands
  reconnect_attempts = 5
  reconnect_backoff_ms = 2000

[conveyor]
  speed_cm_s = 15.0 # Belt speed for piece length estimation
"#;

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::path::Path;

    #[test]
    fn run_load() {
        fs::create_dir_all(Path::new("/tmp/woodsorttest/")).unwrap();
        let res = toml::load("/tmp/woodsorttest/").unwrap();
        assert_eq!(res.system.default_mode, "trigger");
        assert_eq!(res.sorter.baud, 9600);
        assert_eq!(res.gates.g2_4, 3);
    }

    #[test]
    fn default_config_rules_test() {
        let conf: Config = ::toml::from_str(DEFAULT_CONFIG).unwrap();
        conf.validate().unwrap();
        let rules = conf.grading_rules();
        assert_eq!(rules.sound[0], (10.0, 5.0));
        assert_eq!(rules.unsound[3], (50.0, 25.0));
        // Unsound thresholds are strictly tighter than sound ones.
        for (s, u) in rules.sound.iter().zip(rules.unsound.iter()) {
            assert!(u.0 < s.0 && u.1 < s.1);
        }
    }

    #[test]
    fn invalid_calibration_rejected_test() {
        let mut conf: Config = ::toml::from_str(DEFAULT_CONFIG).unwrap();
        conf.calibration.top_pixels_per_mm = 0.0;
        assert!(conf.validate().is_err());
    }

    #[test]
    fn invalid_gate_map_rejected_test() {
        // A gate above 9 would not even map to a digit on the wire.
        let mut conf: Config = ::toml::from_str(DEFAULT_CONFIG).unwrap();
        conf.gates.g2_4 = 12;
        assert!(conf.validate().is_err());
        let mut conf: Config = ::toml::from_str(DEFAULT_CONFIG).unwrap();
        conf.gates.g2_0 = 0;
        assert!(conf.validate().is_err());
    }
}
