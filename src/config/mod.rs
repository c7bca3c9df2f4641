//! User configuration and home-directory layout.

pub mod home;
pub mod loader;
pub mod model;
pub mod validate;

pub use home::Home;
pub use loader::{load_and_validate, load_config};
pub use model::{Config, PluginConfig, PluginSelection, RawConfigFile};
