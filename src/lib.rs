pub mod bot;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod downloader;
pub mod error;
pub mod extractor;
pub mod http;
pub mod models;
pub mod orchestrator;
pub mod packager;
pub mod registry;
pub mod retry;
pub mod session;
pub mod state;
pub mod transport;

pub use error::{FetchError, GalleryError, Result};
