//! Official image catalog and the content-addressed artifact store.

pub mod catalog;
pub mod downloader;
pub mod manager;

pub use catalog::{Descriptor, ImageBackend};
pub use manager::{ImageManager, PreparedPaths};
