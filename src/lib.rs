pub mod activity;
pub mod audio;
pub mod config;
pub mod error;
pub mod lead;
pub mod session;
pub mod transport;

pub use error::{CallError, Result};
