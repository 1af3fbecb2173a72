use std::{io, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod boundary;
pub mod decoder;
pub mod file;
pub mod iterator;

pub use boundary::{Boundary, BoundaryMatcher};
pub use iterator::{IterState, MboxIterator, MboxIteratorBuilder, MessageSpan, OwnedMessage};

pub type Result<T> = std::result::Result<T, MailboxError>;

/// Separator line of RFC 4155, `From <addr> <asctime date>`.
pub const DEFAULT_PATTERN: &str = r"^From \S+@\S.*\d{4}$";

pub const DEFAULT_CHARSET: &str = "UTF-8";

/// Window capacity, in decoded UTF-8 bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Decoded bytes of one message that may be kept outside the window.
pub const DEFAULT_SPILL_LIMIT: usize = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("cannot access mbox file {path}: {source}")]
    FileAccess {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no From_ separator line found in {path}, not a valid mbox")]
    InvalidMailboxFormat { path: PathBuf },

    #[error("malformed byte sequence at offset {offset}")]
    Decoding { offset: u64 },

    /// `limit` covers the message body plus the next separator line.
    #[error("message starting at decoded offset {offset} plus its next separator line exceeds {limit} bytes")]
    MessageTooLarge { limit: usize, offset: u64 },

    #[error("mbox iterator used after close")]
    Closed,

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Regex flags applied to the separator pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundaryFlags {
    pub multi_line: bool,
    pub case_insensitive: bool,
    /// `^`/`$` also treat `\r\n` as a line terminator.
    pub crlf: bool,
}

impl Default for BoundaryFlags {
    fn default() -> Self {
        Self { multi_line: true, case_insensitive: false, crlf: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MboxConfig {
    /// WHATWG encoding label, e.g. `UTF-8` or `ISO-8859-1`.
    pub charset: String,
    pub pattern: String,
    pub flags: BoundaryFlags,
    /// Window capacity, in decoded UTF-8 bytes.
    pub max_message_size: usize,
    pub spill_limit: usize,
}

impl Default for MboxConfig {
    fn default() -> Self {
        Self {
            charset: DEFAULT_CHARSET.to_string(),
            pattern: DEFAULT_PATTERN.to_string(),
            flags: BoundaryFlags::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            spill_limit: DEFAULT_SPILL_LIMIT,
        }
    }
}

impl MboxConfig {

    pub fn validate(&self) -> Result<()> {
        if self.max_message_size == 0 {
            return Err(MailboxError::InvalidConfiguration(
                "max_message_size must be greater than zero".to_string()));
        }
        Ok(())
    }

}
