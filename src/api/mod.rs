//! HTTP surface: routes, handlers, wire models and the abort registry.

pub mod handlers;
pub mod models;
pub mod server;
pub mod streams;

pub use handlers::AppState;
pub use server::{ApiConfig, ApiServer};
