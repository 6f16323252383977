//! Product Service
//!
//! Product catalog API plus the asynchronous pipeline that compresses
//! product images. The HTTP server and the image worker are separate
//! binaries built from this library.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;

// Public re-exports
pub use config::Config;
pub use error::{AppError, Result};
