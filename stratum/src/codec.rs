//! Message Framing
//!
//! The stratum wire format is one UTF-8 JSON envelope per
//! `'\n'`-terminated line. `MessageBuffer` accumulates raw socket
//! reads and yields every complete line, retaining any trailing
//! partial segment for the next read. It does no parsing and no
//! copying beyond what framing requires.

use bytes::{Buf, BytesMut};

use crate::StratumError;

/// Frame delimiter
const DELIMITER: u8 = b'\n';

/// Append-only read buffer that splits a byte stream into messages
#[derive(Debug, Default)]
pub struct MessageBuffer {
    buffer: BytesMut,
}

impl MessageBuffer {
    pub fn new() -> Self {
        MessageBuffer {
            buffer: BytesMut::new(),
        }
    }

    /// Append raw bytes read from the socket
    pub fn write(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Drain every complete message up to the last delimiter observed.
    ///
    /// A trailing partial segment stays buffered. A `'\r'` immediately
    /// before the delimiter is stripped. Empty segments are yielded as
    /// empty strings so the caller can reject them like any other
    /// malformed frame.
    pub fn read_messages(&mut self) -> Result<Vec<String>, StratumError> {
        let last_delimiter = match self.buffer.iter().rposition(|b| *b == DELIMITER) {
            Some(position) => position,
            None => return Ok(Vec::new()),
        };

        let complete = self.buffer.split_to(last_delimiter + 1);
        let mut messages = Vec::new();

        let mut segment_start = 0;
        for (i, byte) in complete.iter().enumerate() {
            if *byte != DELIMITER {
                continue;
            }

            let mut segment = &complete[segment_start..i];
            if segment.last() == Some(&b'\r') {
                segment = &segment[..segment.len() - 1];
            }

            let text =
                std::str::from_utf8(segment).map_err(|_| StratumError::NonUtf8Frame)?;
            messages.push(text.to_string());
            segment_start = i + 1;
        }

        Ok(messages)
    }

    /// Discard everything, including any partial segment
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Bytes currently buffered
    pub fn len(&self) -> usize {
        self.buffer.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_messages_are_drained() {
        let mut buffer = MessageBuffer::new();
        buffer.write(b"hello\nworld\n");
        assert_eq!(buffer.read_messages().unwrap(), vec!["hello", "world"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_segment_is_retained() {
        let mut buffer = MessageBuffer::new();
        buffer.write(b"first\nsecond");
        assert_eq!(buffer.read_messages().unwrap(), vec!["first"]);
        assert_eq!(buffer.len(), "second".len());

        buffer.write(b" half\n");
        assert_eq!(buffer.read_messages().unwrap(), vec!["second half"]);
    }

    #[test]
    fn test_no_delimiter_yields_nothing() {
        let mut buffer = MessageBuffer::new();
        buffer.write(b"no newline yet");
        assert!(buffer.read_messages().unwrap().is_empty());
        assert_eq!(buffer.len(), 14);
    }

    #[test]
    fn test_messages_split_across_writes() {
        let mut buffer = MessageBuffer::new();
        buffer.write(b"{\"id\":");
        buffer.write(b"1}\n{\"id\":2}\n");
        assert_eq!(
            buffer.read_messages().unwrap(),
            vec!["{\"id\":1}", "{\"id\":2}"]
        );
    }

    #[test]
    fn test_carriage_return_is_stripped() {
        let mut buffer = MessageBuffer::new();
        buffer.write(b"line\r\n");
        assert_eq!(buffer.read_messages().unwrap(), vec!["line"]);
    }

    #[test]
    fn test_empty_segments_are_yielded() {
        let mut buffer = MessageBuffer::new();
        buffer.write(b"a\n\nb\n");
        assert_eq!(buffer.read_messages().unwrap(), vec!["a", "", "b"]);
    }

    #[test]
    fn test_invalid_utf8_is_rejected() {
        let mut buffer = MessageBuffer::new();
        buffer.write(&[0xff, 0xfe, DELIMITER]);
        assert!(matches!(
            buffer.read_messages(),
            Err(StratumError::NonUtf8Frame)
        ));
    }

    #[test]
    fn test_clear_discards_partial_segment() {
        let mut buffer = MessageBuffer::new();
        buffer.write(b"partial");
        buffer.clear();
        buffer.write(b"fresh\n");
        assert_eq!(buffer.read_messages().unwrap(), vec!["fresh"]);
    }
}
