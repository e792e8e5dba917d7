//! TinyTorrent daemon: engine coordinator, Transmission-compatible RPC, and
//! WebSocket state sync over a vendored BitTorrent session library.

pub mod assets;
pub mod command_queue;
pub mod config;
pub mod diff;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod handover;
pub mod http_server;
pub mod persistence;
pub mod snapshot;
pub mod wire;
