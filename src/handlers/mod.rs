pub mod config;
pub mod media;
pub mod webhook;

pub use config::*;
pub use media::*;
pub use webhook::*;
