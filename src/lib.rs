pub mod download;
mod error;
pub mod extract;
pub mod harvest;
pub mod jobs;
pub mod paths;
pub mod presets;
pub mod thumbs;
pub mod verify;

pub use error::{EngineError, Result};
