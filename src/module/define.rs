//! Module for Constants and Paths Definitions
//!
//! This module defines various constants and paths used throughout the application.

/// System Constants
pub mod system {
    /// Name of the system
    pub const NAME: &str = "woodsort";
}

/// File Paths
pub mod path {

    // Persistent Data Directory
    pub const PERSISTENT_DIR: &str = "/data/";

    // Ephemeral Data Directory
    pub const EPHEMERAL_DIR: &str = "/run/user/1000/";

    // Image Directory
    pub const IMG_DIR: &str = "img";

    // Log Directory
    pub const LOG_DIR: &str = "log";

    // Session Report Directory
    pub const REPORT_DIR: &str = "report";

    // Configuration File
    pub const CONF_FILE: &str = "conf.toml";

    // Last Captured Image (top camera)
    pub const TOP_IMAGE: &str = "top.jpg";

    // Last Captured Image (bottom camera)
    pub const BOTTOM_IMAGE: &str = "bottom.jpg";

    // Combined Defect Detection Model (640x640)
    pub const DEFECT_640_MODEL: &str = "asset/model/defect_combined_640_640.onnx";
}
