pub mod alerts;
pub mod config;
pub mod error;
pub mod handle;
pub mod markers;
pub mod model;
pub mod platform;
pub mod proximity;
pub mod replay;
pub mod sampler;
pub mod session;
pub mod watcher;
