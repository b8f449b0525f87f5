//! # callrelay-server
//!
//! Axum HTTP + `WebSocket` signaling relay for WebRTC call setup.
//!
//! - Clients connect to `/ws?callerId=<identity>` and join that identity's mailbox
//! - Inbound call events are relabeled with the sender and delivered to every
//!   connection of the target identity
//! - `/health` and `/metrics` endpoints
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod relay;
pub mod server;
pub mod shutdown;
