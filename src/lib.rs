//! # callstream-bridge
//!
//! Terminates telephony media stream sockets (Twilio Media Streams wire
//! format) and bridges their audio to the application.
//!
//! ## Application Architecture:
//! - **media**: the streaming core (frame codec, audio buffers, connections,
//!   provider registry)
//! - **server**: TCP acceptor and WebSocket upgrade for the media socket
//! - **bridge**: drives each accepted call (sessions, echo, DTMF)
//! - **session**: per-call bookkeeping reported by the admin API
//! - **config**: layered configuration (defaults, TOML file, environment)
//! - **state**: shared state for the admin HTTP API
//! - **health** / **handlers** / **middleware**: the admin HTTP API
//! - **error**: admin API error responses

pub mod bridge;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod media;
pub mod middleware;
pub mod server;
pub mod session;
pub mod state;
