//! Path Operations Module
//!
//! This module handles path operations for directories and files.

use std::path::PathBuf;

/// Join Paths
///
/// This function takes a slice of strings as input and joins them into a single path string.
/// It uses the PathBuf type to handle platform-specific separators and conversions.
pub fn join(paths: &[&str]) -> String {
    let mut path: PathBuf = PathBuf::new();
    for p in paths {
        path.push(p);
    }
    path.into_os_string().into_string().unwrap_or_default()
}

pub mod dir {
    //! Directory Operations Submodule

    use std::fs;
    use std::path::Path;

    use super::{WoodsortDir, WoodsortImg, WoodsortPath};
    use crate::module::define;

    /// Create a directory from a path list.
    ///
    /// Returns `Some(path)` if the directory creation succeeds, or `None` if it fails.
    pub fn create_dir_from_path_list(paths: &[&str]) -> Option<String> {
        let path = super::join(paths);
        match fs::create_dir_all(Path::new(&path)) {
            Ok(_) => Some(path),
            Err(_) => None,
        }
    }

    /// Create a subdirectory in whichever parent directory exists.
    ///
    /// Prefers `dir1` when it exists, falls back to `dir2` otherwise.
    pub fn create_subdir_in_either_dir(dir1: &str, dir2: &str, name: &str) -> Option<String> {
        let exist: bool = Path::new(dir1).is_dir();
        let parent: &str = match exist {
            true => dir1,
            false => dir2,
        };
        create_dir_from_path_list(&[parent, name])
    }

    /// Create the application data directory.
    pub fn create_data_dir() -> String {
        let res = create_subdir_in_either_dir(
            define::path::PERSISTENT_DIR,
            define::path::EPHEMERAL_DIR,
            define::system::NAME,
        );
        match res {
            Some(path) => path,
            None => panic!("Can't Create Data Dir."),
        }
    }

    /// Create the application temporary directory.
    pub fn create_tmp_dir() -> String {
        let res = create_dir_from_path_list(&[define::path::EPHEMERAL_DIR, define::system::NAME]);
        match res {
            Some(path) => path,
            None => panic!("Can't Create Tmp Dir."),
        }
    }

    /// Create the application subdirectories and build the path configuration.
    ///
    /// Data, image, log and report directories live under the data dir;
    /// per-camera capture files live in the temporary dir.
    pub fn create_app_sub_dir() -> WoodsortPath {
        let data_dir = create_data_dir();
        let tmp_dir = create_tmp_dir();
        let img_dir = create_dir_from_path_list(&[&data_dir, define::path::IMG_DIR])
            .expect("Can't create img dir.");
        let log_dir = create_dir_from_path_list(&[&data_dir, define::path::LOG_DIR])
            .expect("Can't create log dir.");
        let report_dir = create_dir_from_path_list(&[&data_dir, define::path::REPORT_DIR])
            .expect("Can't create report dir.");
        WoodsortPath {
            dir: WoodsortDir {
                data: data_dir,
                tmp: tmp_dir.clone(),
                img: img_dir,
                log: log_dir,
                report: report_dir,
            },
            img: WoodsortImg {
                top: super::join(&[tmp_dir.as_str(), define::path::TOP_IMAGE]),
                bottom: super::join(&[tmp_dir.as_str(), define::path::BOTTOM_IMAGE]),
            },
        }
    }
}

/// Paths of Resources
#[derive(Debug, Clone)]
pub struct WoodsortPath {
    /// Directories Paths
    pub dir: WoodsortDir,
    /// Images Paths
    pub img: WoodsortImg,
}

/// Paths of Directories
#[derive(Debug, Clone)]
pub struct WoodsortDir {
    /// Data Directory Path
    pub data: String,
    /// Temporary Directory Path
    pub tmp: String,
    /// Image Directory Path
    pub img: String,
    /// Log Directory Path
    pub log: String,
    /// Session Report Directory Path
    pub report: String,
}

/// Paths of Capture Files
#[derive(Debug, Clone)]
pub struct WoodsortImg {
    /// Top Camera Capture Path
    pub top: String,
    /// Bottom Camera Capture Path
    pub bottom: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_join() {
        assert_eq!(join(&["/test/", "test"]), "/test/test");
        assert_eq!(join(&["test", "test", "test"]), "test/test/test");
        assert_eq!(
            join(&["./test/", "test/", "test.txt"]),
            "./test/test/test.txt"
        );
    }

    #[test]
    fn test_create_dir_from_path_list() {
        dir::create_dir_from_path_list(&["/tmp", "woodsorttest", "test_create_dir"]);
        assert!(std::path::Path::new("/tmp/woodsorttest/test_create_dir").is_dir());
    }

    #[test]
    fn test_create_subdir_in_either_dir() {
        dir::create_subdir_in_either_dir(
            "/tmp/woodsorttest-missing",
            "/tmp/woodsorttest",
            "test_create_subdir",
        );
        assert!(std::path::Path::new("/tmp/woodsorttest/test_create_subdir").is_dir());
    }
}
