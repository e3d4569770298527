pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod queue;
pub mod repository;
pub mod storage;

pub use config::Config;
pub use error::{Error, Result};
