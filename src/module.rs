//! Woodsort modules.

pub mod control;
pub mod define;
pub mod device;
pub mod grading;
pub mod report;
pub mod session;
pub mod util;
pub mod vision;
