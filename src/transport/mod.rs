//! Network surface of the gateway.

pub mod http;

pub use http::{AppState, router};
