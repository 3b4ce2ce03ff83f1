//! Connection-level services bridging transports to room actors.

pub mod websocket_service;
