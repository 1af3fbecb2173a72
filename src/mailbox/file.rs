use std::{fs::File, path::{Path, PathBuf}};

use encoding_rs::{Decoder, DecoderResult};
use memmap2::Mmap;
use tracing::debug;

use crate::mailbox::{MailboxError, Result};

/// Read-only mapping of a whole mbox file with a cursor over the bytes not yet decoded.
///
/// Reading goes through the page cache: a page fault on the mapping may block
/// on disk I/O, which is the only blocking point hidden from the caller.
pub struct MappedFile {
    path: PathBuf,
    mapping: Option<Mapping>,
    position: usize,
}

struct Mapping {
    // None for an empty file, mapping zero bytes is not portable
    mmap: Option<Mmap>,
    _file: File,
}

impl MappedFile {

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file_access = |source| MailboxError::FileAccess { path: path.clone(), source };
        let file = File::open(&path).map_err(file_access)?;
        let len = file.metadata().map_err(file_access)?.len();
        let mmap = if len > 0 {
            // unsafe block require in case of file is truncated while in use
            Some(unsafe { Mmap::map(&file) }.map_err(file_access)?)
        } else {
            None
        };
        debug!(path = %path.display(), len, "Mapped mbox file");
        Ok(Self { path, mapping: Some(Mapping { mmap, _file: file }), position: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn bytes(&self) -> &[u8] {
        self.mapping.as_ref()
            .and_then(|m| m.mmap.as_deref())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Absolute offset of the next byte to decode.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.len().saturating_sub(self.position)
    }

    pub fn is_closed(&self) -> bool {
        self.mapping.is_none()
    }

    /// Hands the unread bytes to `decoder`, writing UTF-8 into `dst`.
    /// Returns the decoder result and the number of bytes written.
    pub fn decode_into(&mut self, decoder: &mut Decoder, dst: &mut [u8], last: bool) -> (DecoderResult, usize) {
        let src = self.bytes().get(self.position..).unwrap_or(&[]);
        let (result, read, written) = decoder.decode_to_utf8_without_replacement(src, dst, last);
        self.position += read;
        (result, written)
    }

    pub fn close(&mut self) {
        if self.mapping.take().is_some() {
            debug!(path = %self.path.display(), "Closed mbox file");
        }
    }

}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn temp_file(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_not_exists_file() {
        let res = MappedFile::open("/chemin/vers/fichier/inexistant");
        assert!(matches!(res, Err(MailboxError::FileAccess { .. })));
    }

    #[test]
    fn test_empty_file() {
        let file = temp_file(b"");
        let mapped = MappedFile::open(file.path()).unwrap();
        assert!(mapped.is_empty());
        assert_eq!(0, mapped.remaining());
    }

    #[test]
    fn test_decode_advances_position() {
        let file = temp_file(b"From a@b Mon Jan 01 00:00:00 2001\nbody\n");
        let mut mapped = MappedFile::open(file.path()).unwrap();
        let mut decoder = encoding_rs::UTF_8.new_decoder_without_bom_handling();
        let mut dst = [0u8; 10];
        let (result, written) = mapped.decode_into(&mut decoder, &mut dst, false);
        assert_eq!(DecoderResult::OutputFull, result);
        assert!(written > 0);
        assert_eq!(&b"From a@b M"[..written], &dst[..written]);
        assert_eq!(written, mapped.position());
        assert_eq!(mapped.len() - written, mapped.remaining());
    }

    #[test]
    fn test_close_is_idempotent() {
        let file = temp_file(b"From a@b Mon Jan 01 00:00:00 2001\n");
        let mut mapped = MappedFile::open(file.path()).unwrap();
        mapped.close();
        mapped.close();
        assert!(mapped.is_closed());
        assert_eq!(0, mapped.len());
    }
}
