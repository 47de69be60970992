pub mod settings;

pub use settings::{HttpSettings, Settings, ENV_PREFIX};
