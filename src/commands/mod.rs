//! Command Handler Module
//!
//! This module implements the single-step commands of spoolq. It receives
//! parsed requests from the connection handler, executes them against the
//! queue directory, and returns the reply to send.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │ RequestParser   │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐      set / get
//! │ ConnectionHandler│ ─────────────────> chunked streaming loops
//! └────────┬────────┘
//!          │ stats / version / delete / flush / flush_all
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ QueueDirectory  │  (storage module)
//! └─────────────────┘
//! ```

pub mod handler;

// Re-export the main command handler
pub use handler::CommandHandler;
