use std::{fmt, ops::Range, path::{Path, PathBuf}};

use tracing::{debug, error, info, instrument};

use crate::mailbox::{
    boundary::{Boundary, BoundaryMatcher},
    decoder::{DecodeWindow, WindowDecoder},
    file::MappedFile,
    BoundaryFlags, MailboxError, MboxConfig, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum IterState {
    Initial,
    HasNext,
    Exhausted,
    Closed,
}

/// Lazy, forward-only reader of the messages of an mbox file.
///
/// The file is mapped read-only and decoded into a window of
/// `max_message_size` bytes. Each message is handed out as a [`MessageSpan`]
/// borrowing that window, so it lives until the next call on the iterator.
/// Use the [`Iterator`] impl to get owned copies instead.
///
/// A message outgrowing the window is moved line by line into an owned spill
/// buffer of at most `spill_limit` bytes, and its span then borrows that buffer.
///
/// A span starts right after the line terminator of its `From ` line and
/// stops right before the next `From ` line, so it keeps the newline closing
/// its last line. Text before the first separator is skipped.
///
/// Not meant to be shared between threads: every call advances the window.
/// Parallel readers of one file each need their own iterator.
pub struct MboxIterator {
    source: MappedFile,
    decoder: WindowDecoder,
    window: DecodeWindow,
    matcher: BoundaryMatcher,
    current: Option<Head>,
    // separator line of the last message handed out, or of a carried head
    separator: String,
    // head of a carried message body that no longer fits in the window
    spill: String,
    spill_limit: usize,
    // window[0] is not at a line start
    mid_line: bool,
    state: IterState,
    // decoded offset of window[0]
    window_origin: u64,
    messages_read: u64,
}

/// Separator heading the message to deliver next.
#[derive(Debug, Clone, Copy)]
enum Head {
    Window(Boundary),
    /// Separator moved to `MboxIterator::separator`, the body continues at
    /// window[0] after whatever was spilled.
    Carried { offset: u64 },
}

struct PendingSpan {
    body: Range<usize>,
    offset: u64,
    // the whole text sits in the spill buffer
    spilled: bool,
}

/// First offset of `text` a separator may start at.
fn first_line_start(text: &[u8], mid_line: bool) -> usize {
    if mid_line {
        BoundaryMatcher::line_end(text, 0).unwrap_or(text.len())
    } else {
        0
    }
}

impl MboxIterator {

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::builder(path).build()
    }

    pub fn builder(path: impl AsRef<Path>) -> MboxIteratorBuilder {
        MboxIteratorBuilder { path: path.as_ref().to_path_buf(), config: MboxConfig::default() }
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    fn with_config(path: PathBuf, config: MboxConfig) -> Result<Self> {
        config.validate()?;
        let matcher = BoundaryMatcher::new(&config.pattern, config.flags)?;
        let decoder = WindowDecoder::new(&config.charset, config.max_message_size)?;
        let source = MappedFile::open(&path)?;
        info!(len = source.len(), charset = decoder.encoding().name(),
            max_message_size = config.max_message_size, spill_limit = config.spill_limit, "Open mbox file");
        let mut iter = Self {
            source,
            decoder,
            window: DecodeWindow::with_capacity(config.max_message_size),
            matcher,
            current: None,
            separator: String::new(),
            spill: String::new(),
            spill_limit: config.spill_limit,
            mid_line: false,
            state: IterState::Initial,
            window_origin: 0,
            messages_read: 0,
        };
        if let Err(e) = iter.locate_first_boundary() {
            iter.fail();
            return Err(e);
        }
        Ok(iter)
    }

    pub fn state(&self) -> IterState {
        self.state
    }

    pub fn path(&self) -> &Path {
        self.source.path()
    }

    pub fn messages_read(&self) -> u64 {
        self.messages_read
    }

    /// Decodes until the first separator line, dropping any preamble.
    fn locate_first_boundary(&mut self) -> Result<()> {
        loop {
            self.decoder.decode_next(&mut self.source, &mut self.window)?;
            let text = self.window.bytes();
            let found = self.matcher.find_at(text, first_line_start(text, self.mid_line));
            if let Some(boundary) = found
                    && (boundary.end < text.len() || self.decoder.is_finished()) {
                debug!(start = boundary.start, end = boundary.end, "First separator line");
                self.current = Some(Head::Window(boundary));
                self.mid_line = false;
                self.state = IterState::HasNext;
                return Ok(());
            }
            if self.decoder.is_finished() {
                return Err(MailboxError::InvalidMailboxFormat { path: self.source.path().to_path_buf() });
            }
            let keep_from = match found {
                Some(boundary) => boundary.start,
                None => text.iter().rposition(|&b| b == b'\n').map_or(0, |nl| nl + 1),
            };
            if keep_from > 0 {
                debug!(skipped = keep_from, "Skip mbox preamble");
                self.mid_line = false;
                self.shift_window(keep_from);
            } else if self.window_exhausted() {
                if found.is_some() {
                    return Err(self.too_large(self.window.capacity(), self.window_origin));
                }
                // preamble line longer than the window, resume after its end
                let skipped = text.len();
                debug!(skipped, "Skip mbox preamble");
                self.mid_line = true;
                self.shift_window(skipped);
            }
        }
    }

    fn shift_window(&mut self, from: usize) {
        self.window.compact(from);
        self.window_origin += from as u64;
    }

    /// No room left in the window without dropping undelivered text.
    fn window_exhausted(&self) -> bool {
        self.window.is_full() || self.decoder.is_stalled()
    }

    fn too_large(&self, limit: usize, offset: u64) -> MailboxError {
        error!(limit, offset, spilled = self.spill.len(), "Message does not fit in the decode window");
        MailboxError::MessageTooLarge { limit, offset }
    }

    /// Delimits the message headed by the current separator, refilling the
    /// window as long as its end is not decoded yet.
    fn advance(&mut self) -> Result<PendingSpan> {
        let Some(mut head) = self.current.take() else {
            return Err(MailboxError::Closed);
        };
        self.spill.clear();
        loop {
            let text = self.window.bytes();
            let (body_start, search_from) = match head {
                Head::Window(b) => {
                    let body_start = BoundaryMatcher::line_end(text, b.end).unwrap_or(text.len());
                    (body_start, body_start)
                },
                Head::Carried { .. } => (0, first_line_start(text, self.mid_line)),
            };
            // a match touching the end of the window may still grow
            let next = self.matcher.find_at(text, search_from)
                .filter(|b| b.end < text.len() || self.decoder.is_finished());
            if let Some(next) = next {
                self.current = Some(Head::Window(next));
                self.mid_line = false;
                return self.pending(head, body_start..next.start);
            }
            if self.decoder.is_finished() {
                let body = body_start..text.len();
                self.state = IterState::Exhausted;
                self.source.close();
                info!(messages = self.messages_read + 1, "Mbox file exhausted");
                return self.pending(head, body);
            }
            head = self.make_room(head)?;
            let written = self.decoder.decode_next(&mut self.source, &mut self.window)?;
            debug!(written, window = self.window.len(), "Refilled decode window");
        }
    }

    /// Drops what precedes the pending message from the window. Once its
    /// separator line is complete it is carried aside, leaving the window to the body.
    fn make_room(&mut self, head: Head) -> Result<Head> {
        match head {
            Head::Window(b) => match BoundaryMatcher::line_end(self.window.bytes(), b.end) {
                Some(body_start) => {
                    let offset = self.window_origin + b.start as u64;
                    self.carry_separator(b)?;
                    self.mid_line = false;
                    self.shift_window(body_start);
                    Ok(Head::Carried { offset })
                },
                None if b.start == 0 && self.window_exhausted() => {
                    Err(self.too_large(self.window.capacity(), self.window_origin))
                },
                None => {
                    self.shift_window(b.start);
                    Ok(Head::Window(b.shift_left(b.start)))
                },
            },
            Head::Carried { offset } if self.window_exhausted() => {
                self.spill_window(offset)?;
                Ok(head)
            },
            carried => Ok(carried),
        }
    }

    /// Moves the complete lines of a full window to the spill buffer. The
    /// trailing partial line stays, it may open the next separator.
    fn spill_window(&mut self, offset: u64) -> Result<()> {
        let text = self.window.bytes();
        let last_nl = text.iter().rposition(|&b| b == b'\n');
        let upto = last_nl.map_or(text.len(), |nl| nl + 1);
        if upto == 0 || self.spill.len() + upto > self.spill_limit {
            return Err(self.too_large(self.window.capacity().saturating_add(self.spill_limit), offset));
        }
        let lines = std::str::from_utf8(&text[..upto])
            .map_err(|e| MailboxError::Decoding { offset: self.window_origin + e.valid_up_to() as u64 })?;
        self.spill.push_str(lines);
        self.mid_line = last_nl.is_none();
        debug!(spilled = self.spill.len(), offset, "Spilled message head out of the window");
        self.shift_window(upto);
        Ok(())
    }

    fn carry_separator(&mut self, b: Boundary) -> Result<()> {
        let line = std::str::from_utf8(&self.window.bytes()[b.start..b.end])
            .map_err(|_| MailboxError::Decoding { offset: self.window_origin + b.start as u64 })?;
        self.separator.clear();
        self.separator.push_str(line);
        Ok(())
    }

    fn pending(&mut self, head: Head, body: Range<usize>) -> Result<PendingSpan> {
        let offset = match head {
            Head::Window(b) => {
                self.carry_separator(b)?;
                self.window_origin + b.start as u64
            },
            Head::Carried { offset } => offset,
        };
        let spilled = !self.spill.is_empty();
        if spilled {
            let tail = Self::span_text(&self.window, "", self.window_origin, &PendingSpan { body, offset, spilled: false })?;
            self.spill.push_str(tail);
            return Ok(PendingSpan { body: 0..0, offset, spilled });
        }
        Ok(PendingSpan { body, offset, spilled })
    }

    fn fail(&mut self) {
        self.current = None;
        self.state = IterState::Exhausted;
        self.source.close();
    }

    fn span_text<'a>(window: &'a DecodeWindow, spill: &'a str, window_origin: u64, pending: &PendingSpan) -> Result<&'a str> {
        if pending.spilled {
            return Ok(spill);
        }
        let range = pending.body.clone();
        std::str::from_utf8(&window.bytes()[range.clone()])
            .map_err(|e| MailboxError::Decoding { offset: window_origin + (range.start + e.valid_up_to()) as u64 })
    }

    /// Next message, borrowing the decode window until the next call.
    pub fn next_message(&mut self) -> Result<Option<MessageSpan<'_>>> {
        match self.state {
            IterState::Closed => return Err(MailboxError::Closed),
            IterState::Initial | IterState::Exhausted => return Ok(None),
            IterState::HasNext => (),
        }
        let pending = match self.advance() {
            Ok(pending) => pending,
            Err(e) => {
                self.fail();
                return Err(e);
            },
        };
        let text = match Self::span_text(&self.window, &self.spill, self.window_origin, &pending) {
            Ok(text) => text,
            Err(e) => {
                // window and spill stay borrowed, end the iteration field by field
                self.current = None;
                self.state = IterState::Exhausted;
                self.source.close();
                return Err(e);
            },
        };
        let index = self.messages_read;
        self.messages_read += 1;
        Ok(Some(MessageSpan {
            index,
            offset: pending.offset,
            separator: &self.separator,
            text,
        }))
    }

    pub fn has_next(&mut self) -> Result<bool> {
        match self.state {
            IterState::Closed => Err(MailboxError::Closed),
            IterState::HasNext => Ok(true),
            IterState::Initial | IterState::Exhausted => {
                self.source.close();
                Ok(false)
            },
        }
    }

    pub fn close(&mut self) {
        if self.state != IterState::Closed {
            debug!(state = %self.state, messages = self.messages_read, "Close mbox iterator");
        }
        self.current = None;
        self.state = IterState::Closed;
        self.source.close();
    }

}

impl fmt::Debug for MboxIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MboxIterator")
            .field("path", &self.source.path())
            .field("state", &self.state)
            .field("pattern", &self.matcher.as_str())
            .field("max_message_size", &self.window.capacity())
            .field("messages_read", &self.messages_read)
            .finish()
    }
}

/// Owned messages. Ends after the first error, and right away once closed.
impl Iterator for MboxIterator {
    type Item = Result<OwnedMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state == IterState::Closed {
            return None;
        }
        self.next_message()
            .map(|span| span.map(|s| s.to_owned_message()))
            .transpose()
    }
}

pub struct MboxIteratorBuilder {
    path: PathBuf,
    config: MboxConfig,
}

impl MboxIteratorBuilder {

    pub fn config(mut self, config: MboxConfig) -> Self {
        self.config = config;
        self
    }

    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.config.charset = charset.into();
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.pattern = pattern.into();
        self
    }

    pub fn flags(mut self, flags: BoundaryFlags) -> Self {
        self.config.flags = flags;
        self
    }

    pub fn max_message_size(mut self, max_message_size: usize) -> Self {
        self.config.max_message_size = max_message_size;
        self
    }

    /// Bytes of a message that may be kept outside the window, 0 to fail on
    /// any message that does not fit in it.
    pub fn spill_limit(mut self, spill_limit: usize) -> Self {
        self.config.spill_limit = spill_limit;
        self
    }

    pub fn build(self) -> Result<MboxIterator> {
        MboxIterator::with_config(self.path, self.config)
    }
}

/// One message of the archive, borrowed from the iterator's decode window
/// or from its spill buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSpan<'a> {
    index: u64,
    offset: u64,
    separator: &'a str,
    text: &'a str,
}

impl<'a> MessageSpan<'a> {

    /// Position of the message in the archive, from 0.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Offset of the separator line in the decoded text.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The `From ` line heading the message, without its line terminator.
    pub fn separator(&self) -> &'a str {
        self.separator
    }

    pub fn as_str(&self) -> &'a str {
        self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn to_owned_message(&self) -> OwnedMessage {
        OwnedMessage {
            index: self.index,
            offset: self.offset,
            separator: self.separator.to_string(),
            text: self.text.to_string(),
        }
    }
}

impl AsRef<str> for MessageSpan<'_> {
    fn as_ref(&self) -> &str {
        self.text
    }
}

impl fmt::Display for MessageSpan<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedMessage {
    pub index: u64,
    pub offset: u64,
    pub separator: String,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;
    use tracing_test::traced_test;

    use super::*;

    const TWO_MESSAGES: &str = "From a@b Mon Jan 01 00:00:00 2001\nHello first\nFrom c@d Tue Jan 02 00:00:00 2001\nHello second\n";

    fn temp_mbox(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_two_messages() {
        let file = temp_mbox(TWO_MESSAGES.as_bytes());
        let mut iter = MboxIterator::open(file.path()).unwrap();
        assert_eq!(IterState::HasNext, iter.state());

        let first = iter.next_message().unwrap().unwrap();
        assert_eq!("Hello first\n", first.as_str());
        assert_eq!("From a@b Mon Jan 01 00:00:00 2001", first.separator());
        assert_eq!(0, first.index());
        assert_eq!(0, first.offset());

        let second = iter.next_message().unwrap().unwrap();
        assert_eq!("Hello second\n", second.as_str());
        assert_eq!("From c@d Tue Jan 02 00:00:00 2001", second.separator());
        assert_eq!(46, second.offset());

        assert!(iter.next_message().unwrap().is_none());
        assert!(!iter.has_next().unwrap());
        assert_eq!(IterState::Exhausted, iter.state());
        assert_eq!(2, iter.messages_read());
    }

    #[test]
    fn test_refill_keeps_pending_separator() {
        // the first window stops inside the second separator line
        let file = temp_mbox(TWO_MESSAGES.as_bytes());
        let mut iter = MboxIterator::builder(file.path()).max_message_size(50).build().unwrap();
        let first = iter.next_message().unwrap().unwrap().to_owned_message();
        let second = iter.next_message().unwrap().unwrap().to_owned_message();
        assert_eq!("Hello first\n", first.text);
        assert_eq!("Hello second\n", second.text);
        assert_eq!("From c@d Tue Jan 02 00:00:00 2001", second.separator);
        assert_eq!(46, second.offset);
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_preamble_is_skipped() {
        // preamble longer than the window
        let preamble = "garbage line\n".repeat(5);
        let file = temp_mbox(format!("{preamble}{TWO_MESSAGES}").as_bytes());
        let mut iter = MboxIterator::builder(file.path()).max_message_size(60).build().unwrap();
        let first = iter.next().unwrap().unwrap();
        assert_eq!("Hello first\n", first.text);
        assert_eq!(65, first.offset);
        assert_eq!(1, iter.count());
    }

    #[test]
    fn test_preamble_line_longer_than_window() {
        let content = format!("{}\n{TWO_MESSAGES}", "x".repeat(200));
        let file = temp_mbox(content.as_bytes());
        let mut iter = MboxIterator::builder(file.path()).max_message_size(100).build().unwrap();
        let first = iter.next_message().unwrap().unwrap();
        assert_eq!("Hello first\n", first.as_str());
        assert_eq!(201, first.offset());
        assert_eq!(1, iter.count());
    }

    #[test]
    fn test_message_spilled_out_of_window() {
        let body = "x".repeat(200);
        let content = format!("From a@b Mon Jan 01 00:00:00 2001\n{body}\nFrom c@d Tue Jan 02 00:00:00 2001\nok\n");
        let file = temp_mbox(content.as_bytes());
        let mut iter = MboxIterator::builder(file.path()).max_message_size(100).build().unwrap();
        let first = iter.next_message().unwrap().unwrap();
        assert_eq!(format!("{body}\n"), first.as_str());
        assert_eq!("From a@b Mon Jan 01 00:00:00 2001", first.separator());
        let second = iter.next_message().unwrap().unwrap();
        assert_eq!("ok\n", second.as_str());
        assert_eq!(235, second.offset());
    }

    #[test]
    fn test_message_too_large() {
        let body = "x".repeat(200);
        let content = format!("From a@b Mon Jan 01 00:00:00 2001\n{body}\nFrom c@d Tue Jan 02 00:00:00 2001\nok\n");
        let file = temp_mbox(content.as_bytes());
        let mut iter = MboxIterator::builder(file.path()).max_message_size(100).spill_limit(0).build().unwrap();
        let res = iter.next_message();
        assert!(matches!(res, Err(MailboxError::MessageTooLarge { limit: 100, offset: 0 })));
        assert_eq!(IterState::Exhausted, iter.state());
        assert!(iter.next_message().unwrap().is_none());
    }

    #[test]
    fn test_spill_limit_reached() {
        let body = "line of text\n".repeat(30);
        let content = format!("From a@b Mon Jan 01 00:00:00 2001\n{body}From c@d Tue Jan 02 00:00:00 2001\nok\n");
        let file = temp_mbox(content.as_bytes());
        let mut iter = MboxIterator::builder(file.path()).max_message_size(100).spill_limit(200).build().unwrap();
        let res = iter.next();
        assert!(matches!(res, Some(Err(MailboxError::MessageTooLarge { limit: 300, offset: 0 }))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_span_cut_inside_character() {
        let file = temp_mbox("é".as_bytes());
        let mut source = MappedFile::open(file.path()).unwrap();
        let mut decoder = WindowDecoder::new("UTF-8", 8).unwrap();
        let mut window = DecodeWindow::with_capacity(8);
        decoder.decode_next(&mut source, &mut window).unwrap();
        let pending = PendingSpan { body: 0..1, offset: 0, spilled: false };
        let res = MboxIterator::span_text(&window, "", 10, &pending);
        assert!(matches!(res, Err(MailboxError::Decoding { offset: 10 })));
        let spilled = PendingSpan { body: 0..0, offset: 0, spilled: true };
        assert_eq!("spilled text", MboxIterator::span_text(&window, "spilled text", 10, &spilled).unwrap());
    }

    #[test]
    fn test_use_after_close() {
        let file = temp_mbox(TWO_MESSAGES.as_bytes());
        let mut iter = MboxIterator::open(file.path()).unwrap();
        iter.close();
        iter.close();
        assert!(matches!(iter.next_message(), Err(MailboxError::Closed)));
        assert!(matches!(iter.has_next(), Err(MailboxError::Closed)));
        assert!(iter.next().is_none());
    }

    #[test]
    #[traced_test]
    fn test_exhaustion_is_logged() {
        let file = temp_mbox(TWO_MESSAGES.as_bytes());
        let iter = MboxIterator::open(file.path()).unwrap();
        assert_eq!(2, iter.count());
        assert!(logs_contain("Mbox file exhausted"));
    }
}
