pub mod audio_format;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod state;
