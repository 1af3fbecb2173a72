pub mod mailbox;
pub mod message;

pub use mailbox::{MailboxError, MboxConfig, MboxIterator, MessageSpan};
pub use message::Email;
