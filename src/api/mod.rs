//! HTTP and WebSocket edge
//!
//! Wager placement, live state, the per-mode push channel and operator routes.

pub mod admin;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;
pub mod websocket;

pub use handlers::AppState;
pub use server::ApiServer;
