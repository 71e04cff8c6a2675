#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
pub mod core;

pub mod app;
pub mod cli;
pub use app::run;
pub use crate::core::error::MonitorError;
pub use crate::core::session::{Collaborators, MonitorHandle, MonitoringSession};
