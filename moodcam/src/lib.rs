//! Live camera emotion readings from a remote analyzer.

pub mod api;
pub mod camera;
pub mod config;
pub mod console;
pub mod frame;
pub mod logging;
pub mod scheduler;
pub mod session;
pub mod surface;
