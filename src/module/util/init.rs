//! This module is responsible for preparing the resources needed by the application, such as directories, configurations and logs.
//!

pub mod resource {
    use super::WoodsortProperty;

    /// Initialize the application resources and return a WoodsortProperty instance containing paths and configurations.
    pub fn init() -> WoodsortProperty {
        // Prepare the app data directory
        let paths = crate::module::util::path::dir::create_app_sub_dir();

        // Load the app configuration file
        let conf =
            crate::module::util::conf::toml::load(&paths.dir.data).expect("Can't load config.");

        WoodsortProperty { path: paths, conf }
    }
}

/// This struct represents the properties of the app, such as paths and configurations.
#[derive(Debug, Clone)]
pub struct WoodsortProperty {
    /// The paths of the app resources
    pub path: crate::module::util::path::WoodsortPath,
    /// The configurations of the app
    pub conf: crate::module::util::conf::Config,
}
