//! Text Protocol Implementation
//!
//! This module implements the line-oriented, memcached-style protocol spoken
//! by spoolq.
//!
//! ## Overview
//!
//! Clients send one command per `\r\n`-terminated line. A `set` line is
//! followed by a binary payload of the declared length; a `get` hit is
//! answered with a `VALUE` header, the payload and `END`.
//!
//! ## Modules
//!
//! - `types`: Defines `Request`, `GetOptions` and `Reply`
//! - `parser`: Turns a request line into a `Request`
//!
//! ## Example
//!
//! ```
//! use spoolq::protocol::{parse_request, Reply, Request};
//!
//! let request = parse_request(b"get jobs/open").unwrap();
//! assert!(matches!(request, Request::Get { .. }));
//!
//! assert_eq!(Reply::Stored.serialize(), b"STORED\r\n");
//! ```

pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{is_valid_queue_name, parse_request, ParseError, ParseResult, RequestParser};
pub use types::{GetOptions, Reply, Request, CRLF};
