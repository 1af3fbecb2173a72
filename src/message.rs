use std::fmt::Display;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

use crate::mailbox::{MessageSpan, OwnedMessage};

pub mod headers;

pub use headers::{parse_headers, Headers};

/// asctime layout used by the `From ` line, e.g. `Mon Jan  1 00:00:00 2001`.
const ENVELOPE_DATE_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// Sender and date carried by the `From ` separator line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Envelope {
    pub sender: String,
    pub date: Option<NaiveDateTime>,
}

impl Envelope {

    pub fn parse(separator: &str) -> Option<Self> {
        let rest = separator.strip_prefix("From ")?.trim_start();
        let (sender, date) = match rest.split_once(char::is_whitespace) {
            Some((sender, date)) => (sender, date.trim()),
            None => (rest, ""),
        };
        if sender.is_empty() {
            return None;
        }
        Some(Self {
            sender: sender.to_string(),
            date: NaiveDateTime::parse_from_str(date, ENVELOPE_DATE_FORMAT).ok(),
        })
    }

}

/// Summary of one archived message, as needed to file it in a mail archive.
#[derive(Debug, Clone, Serialize)]
pub struct Email {
    pub index: u64,
    pub offset: u64,
    pub size: usize,
    pub envelope: Option<Envelope>,
    pub from: Option<String>,
    pub subject: Option<String>,
    pub datetime: Option<DateTime<Utc>>,
    pub list_id: Option<String>,
    pub message_id: Option<String>,
}

impl Email {

    fn parse(index: u64, offset: u64, separator: &str, text: &str) -> Self {
        let headers = parse_headers(text);
        Email {
            index,
            offset,
            size: text.len(),
            envelope: Envelope::parse(separator),
            from: headers.decoded("From"),
            subject: headers.decoded("Subject"),
            datetime: headers.get("Date")
                .and_then(|date| DateTime::parse_from_rfc2822(date).ok())
                .map(|dt| dt.to_utc()),
            list_id: headers.decoded("List-Id"),
            message_id: headers.get("Message-ID").map(str::to_string),
        }
    }

}

impl From<&MessageSpan<'_>> for Email {
    fn from(span: &MessageSpan<'_>) -> Self {
        Email::parse(span.index(), span.offset(), span.separator(), span.as_str())
    }
}

impl From<&OwnedMessage> for Email {
    fn from(message: &OwnedMessage) -> Self {
        Email::parse(message.index, message.offset, &message.separator, &message.text)
    }
}

impl Display for Email {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let none = "none".to_string();
        write!(f, "#{} @{} ({} bytes), {}, {}, {}", self.index, self.offset, self.size,
            self.from.as_ref().unwrap_or(&none),
            self.datetime.map(|dt| dt.to_rfc3339()).unwrap_or_else(|| none.clone()),
            self.subject.as_ref().unwrap_or(&none)
        )
    }
}
