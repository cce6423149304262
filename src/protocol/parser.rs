//! Request Line Parser
//!
//! This module turns one request line (without its `\r\n` terminator) into a
//! [`Request`]. The connection handler owns the framing: it finds the line in
//! its read buffer and hands the bytes to [`RequestParser::parse`].
//!
//! ## Design Philosophy
//!
//! 1. **Validate Everything**: A request that reaches dispatch is complete and
//!    consistent; malformed lines never do.
//! 2. **Recoverable Errors**: A [`ParseError`] only ever costs the client an
//!    `ERROR` reply. The connection stays usable.
//! 3. **Kestrel Compatible**: `get` options use the `/open`, `/close`,
//!    `/abort`, `/peek` and `/t=<ms>` suffix syntax.

use crate::protocol::types::{GetOptions, Request};
use std::num::ParseIntError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while parsing a request line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The line holds no tokens
    #[error("empty command")]
    EmptyInput,

    /// The line is not valid UTF-8
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// The first token names no known command
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Too few or too many arguments for the command
    #[error("wrong number of arguments for '{0}'")]
    WrongArguments(&'static str),

    /// A numeric argument failed to parse
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// The queue name is empty, too long or uses forbidden characters
    #[error("invalid queue name '{0}'")]
    InvalidQueueName(String),

    /// A `get` option that is not recognised
    #[error("unknown option '{0}'")]
    UnknownOption(String),

    /// A `get` option combination that makes no sense
    #[error("conflicting options: {0}")]
    ConflictingOptions(&'static str),
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum length of a queue name (the memcached key limit)
pub const MAX_QUEUE_NAME_LEN: usize = 250;

/// Returns true if `name` can be used as a queue name.
///
/// Queue names map one-to-one onto directories, so they are limited to
/// ASCII alphanumerics, `_`, `-` and `.`, and may not start with `.`.
pub fn is_valid_queue_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_QUEUE_NAME_LEN
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
}

/// Parser for request lines.
///
/// # Example
///
/// ```
/// use spoolq::protocol::{Request, RequestParser};
///
/// let parser = RequestParser::new();
/// let request = parser.parse(b"set jobs 0 0 5").unwrap();
/// assert_eq!(
///     request,
///     Request::Set { queue: "jobs".to_string(), flags: 0, exptime: 0, bytes: 5 }
/// );
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestParser;

impl RequestParser {
    /// Creates a new parser instance.
    pub fn new() -> Self {
        Self
    }

    /// Parses one request line.
    ///
    /// # Arguments
    ///
    /// * `line` - The line contents without the trailing `\r\n`
    pub fn parse(&self, line: &[u8]) -> ParseResult<Request> {
        let line =
            std::str::from_utf8(line).map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;

        let mut tokens = line.split_ascii_whitespace();
        let command = tokens.next().ok_or(ParseError::EmptyInput)?;
        let args: Vec<&str> = tokens.collect();

        match command {
            "get" => self.parse_get(&args),
            "set" => self.parse_set(&args),
            "delete" => {
                let queue = single_queue_arg("delete", &args)?;
                Ok(Request::Delete { queue })
            }
            "flush" => {
                let queue = single_queue_arg("flush", &args)?;
                Ok(Request::Flush { queue })
            }
            "flush_all" => match args.as_slice() {
                [] => Ok(Request::FlushAll),
                // memcached clients may send a delay; it is accepted and ignored
                [delay] => {
                    parse_u64(delay)?;
                    Ok(Request::FlushAll)
                }
                _ => Err(ParseError::WrongArguments("flush_all")),
            },
            "stats" if args.is_empty() => Ok(Request::Stats),
            "stats" => Err(ParseError::WrongArguments("stats")),
            "version" if args.is_empty() => Ok(Request::Version),
            "version" => Err(ParseError::WrongArguments("version")),
            other => Err(ParseError::UnknownCommand(other.to_string())),
        }
    }

    /// `set <queue> <flags> <exptime> <bytes>`
    fn parse_set(&self, args: &[&str]) -> ParseResult<Request> {
        let [queue, flags, exptime, bytes] = args else {
            return Err(ParseError::WrongArguments("set"));
        };

        let queue = validate_queue_name(queue)?;
        let flags = flags
            .parse::<u32>()
            .map_err(|e: ParseIntError| ParseError::InvalidInteger(e.to_string()))?;
        let exptime = parse_u64(exptime)?;
        let bytes = parse_u64(bytes)?;

        Ok(Request::Set {
            queue,
            flags,
            exptime,
            bytes,
        })
    }

    /// `get <queue>[/open][/close][/abort][/peek][/t=<ms>][ <ms>]`
    fn parse_get(&self, args: &[&str]) -> ParseResult<Request> {
        let (target, trailing_timeout) = match args {
            [target] => (*target, None),
            [target, timeout] => (*target, Some(parse_millis(timeout)?)),
            _ => return Err(ParseError::WrongArguments("get")),
        };

        let mut parts = target.split('/');
        // split always yields at least one item
        let queue = validate_queue_name(parts.next().unwrap_or_default())?;

        let mut options = GetOptions::default();
        for part in parts {
            match part {
                "open" => options.open = true,
                "close" => options.close = true,
                "abort" => options.abort = true,
                "peek" => options.peek = true,
                _ => match part.strip_prefix("t=") {
                    Some(ms) if options.timeout.is_none() => {
                        options.timeout = Some(parse_millis(ms)?);
                    }
                    Some(_) => return Err(ParseError::ConflictingOptions("timeout given twice")),
                    None => return Err(ParseError::UnknownOption(part.to_string())),
                },
            }
        }

        if let Some(timeout) = trailing_timeout {
            if options.timeout.is_some() {
                return Err(ParseError::ConflictingOptions("timeout given twice"));
            }
            options.timeout = Some(timeout);
        }

        if options.close && options.abort {
            return Err(ParseError::ConflictingOptions("close and abort"));
        }
        if options.peek && (options.open || options.close || options.abort) {
            return Err(ParseError::ConflictingOptions(
                "peek with open, close or abort",
            ));
        }
        if options.open && options.abort {
            return Err(ParseError::ConflictingOptions("open and abort"));
        }

        Ok(Request::Get { queue, options })
    }
}

fn single_queue_arg(command: &'static str, args: &[&str]) -> ParseResult<String> {
    match args {
        [queue] => validate_queue_name(queue),
        _ => Err(ParseError::WrongArguments(command)),
    }
}

fn validate_queue_name(name: &str) -> ParseResult<String> {
    if is_valid_queue_name(name) {
        Ok(name.to_string())
    } else {
        Err(ParseError::InvalidQueueName(name.to_string()))
    }
}

fn parse_u64(s: &str) -> ParseResult<u64> {
    s.parse()
        .map_err(|e: ParseIntError| ParseError::InvalidInteger(e.to_string()))
}

fn parse_millis(s: &str) -> ParseResult<Duration> {
    parse_u64(s).map(Duration::from_millis)
}

/// Helper function to parse a single line with a fresh parser.
pub fn parse_request(line: &[u8]) -> ParseResult<Request> {
    RequestParser::new().parse(line)
}
