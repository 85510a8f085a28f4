//! visreg Web
//!
//! HTTP surface over the visual regression engine: ad-hoc screenshots,
//! suite runs (full or narrowed), stored run reports and artifacts, and
//! baseline maintenance.

pub mod server;

pub use server::{serve, WebServer, WebServerConfig};
