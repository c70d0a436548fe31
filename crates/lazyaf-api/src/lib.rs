//! API server for the LazyAF execution core: REST facades, step control
//! endpoints, the runner WebSocket, the UI WebSocket, and the internal git
//! smart-HTTP server.

pub mod error;
pub mod git;
pub mod pktline;
pub mod routes;
pub mod runner_ws;
pub mod state;
pub mod ws;

pub use error::ApiError;
pub use state::AppState;
