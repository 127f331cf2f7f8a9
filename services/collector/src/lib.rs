// collector: Library entry point.
// Exposes modules for integration testing.

pub mod alarm;
pub mod config;
pub mod dispatcher;
pub mod model;
pub mod ndac;
pub mod secrets;
pub mod session;
pub mod status_http;
pub mod storage;
pub mod window;
