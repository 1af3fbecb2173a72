use encoding_rs::{Decoder, DecoderResult, Encoding};
use tracing::{debug, error};

use crate::mailbox::{file::MappedFile, MailboxError, Result};

/// Fixed-capacity buffer of decoded text. `[0, len)` is always valid UTF-8.
pub struct DecodeWindow {
    buf: Box<[u8]>,
    len: usize,
}

impl DecodeWindow {

    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: vec![0; capacity].into_boxed_slice(), len: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Keeps `[from, len)` by moving it to the start of the window.
    pub fn compact(&mut self, from: usize) {
        let from = from.min(self.len);
        self.buf.copy_within(from..self.len, 0);
        self.len -= from;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.len..]
    }

}

/// Streaming charset decoder filling a [`DecodeWindow`] from a [`MappedFile`].
pub struct WindowDecoder {
    decoder: Decoder,
    encoding: &'static Encoding,
    max_message_size: usize,
    final_chunk: bool,
    finished: bool,
    stalled: bool,
}

impl WindowDecoder {

    pub fn new(charset: &str, max_message_size: usize) -> Result<Self> {
        let encoding = Encoding::for_label(charset.trim().as_bytes())
            .ok_or_else(|| MailboxError::InvalidConfiguration(format!("unknown charset {charset}")))?;
        Ok(Self {
            // no BOM sniffing, the decoded text mirrors the file
            decoder: encoding.new_decoder_without_bom_handling(),
            encoding,
            max_message_size,
            final_chunk: false,
            finished: false,
            stalled: false,
        })
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    /// All bytes decoded and the decoder flushed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The last call had no room left for the next character. Stays accurate
    /// until the window is compacted and decoded again.
    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// Appends decoded text to `window` up to its capacity. Returns the number
    /// of bytes added, zero only at end of input or when the window is full.
    pub fn decode_next(&mut self, source: &mut MappedFile, window: &mut DecodeWindow) -> Result<usize> {
        if self.finished {
            return Ok(0);
        }
        if source.remaining() <= self.max_message_size {
            self.final_chunk = true;
        }
        let (result, written) = source.decode_into(&mut self.decoder, window.spare_mut(), self.final_chunk);
        window.len += written;
        self.stalled = result == DecoderResult::OutputFull && written == 0;
        match result {
            DecoderResult::InputEmpty => {
                if self.final_chunk {
                    self.finished = true;
                }
            },
            DecoderResult::OutputFull => (),
            DecoderResult::Malformed(bad, consumed_after) => {
                self.finished = true;
                let offset = source.position()
                    .saturating_sub(bad as usize + consumed_after as usize) as u64;
                error!(offset, encoding = self.encoding.name(), "Malformed input in mbox file");
                return Err(MailboxError::Decoding { offset });
            },
        }
        debug!(written, remaining = source.remaining(), final_chunk = self.final_chunk, "Decoded chunk");
        Ok(written)
    }

}
