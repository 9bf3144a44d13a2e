pub mod backend;
pub mod cli;
pub mod client;
pub mod config;
pub mod dashboard;
pub mod device;
pub mod error;
pub mod models;
pub mod storage;
pub mod sync;

pub use error::{Result, VitalsError};
