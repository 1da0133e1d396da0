//! Process-level plumbing shared by the gateway binary: settings and logging.

pub mod logger;
pub mod settings;

pub use logger::Logger;
pub use settings::{General, LogSettings, Settings, SourceSettings};
