pub mod ini;
pub mod settings;

pub use settings::{GlobalSettings, Settings, ShareSettings};
