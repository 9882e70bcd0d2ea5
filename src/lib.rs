pub mod app;
pub mod cancel;
pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod loader;
pub mod output;
pub mod retriever;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod tui;
