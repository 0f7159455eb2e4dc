pub mod config;
pub mod db;
pub mod error;
pub mod media;
pub mod models;
pub mod pipeline;
pub mod segment;
pub mod store;
pub mod timefmt;
pub mod validate;
pub mod workflow;

pub use crate::error::{Error, Result};
pub use crate::models::*;
