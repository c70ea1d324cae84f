//! Frames PTY output for the browser.
//!
//! Output is sent as text when it is valid UTF-8. A multi-byte character
//! split across two reads is held back until its tail arrives; bytes that
//! can never be valid UTF-8 go out as a binary frame.

use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Default)]
pub struct Utf8Framer {
    carry: Vec<u8>,
}

impl Utf8Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn the next chunk into a frame, or `None` if everything was held back.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Message> {
        self.carry.extend_from_slice(chunk);
        match std::str::from_utf8(&self.carry) {
            Ok(_) => {
                let bytes = std::mem::take(&mut self.carry);
                String::from_utf8(bytes).ok().map(Message::Text)
            }
            // Incomplete sequence at the end: send the valid prefix.
            Err(e) if e.error_len().is_none() => {
                let tail = self.carry.split_off(e.valid_up_to());
                let head = std::mem::replace(&mut self.carry, tail);
                if head.is_empty() {
                    return None;
                }
                String::from_utf8(head).ok().map(Message::Text)
            }
            Err(_) => Some(Message::Binary(std::mem::take(&mut self.carry))),
        }
    }

    /// Flush whatever is still held back as a binary frame. Used at
    /// end-of-stream, when no tail is coming.
    pub fn finish(&mut self) -> Option<Message> {
        if self.carry.is_empty() {
            return None;
        }
        Some(Message::Binary(std::mem::take(&mut self.carry)))
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.carry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_passes_through() {
        let mut framer = Utf8Framer::new();
        assert_eq!(framer.push(b"$ ls\r\n"), Some(Message::Text("$ ls\r\n".into())));
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn split_character_is_reassembled() {
        let snowman = "☃".as_bytes();
        let mut framer = Utf8Framer::new();

        let mut first = b"ab".to_vec();
        first.extend_from_slice(&snowman[..1]);
        assert_eq!(framer.push(&first), Some(Message::Text("ab".into())));
        assert_eq!(framer.pending(), 1);

        assert_eq!(framer.push(&snowman[1..2]), None);
        assert_eq!(framer.push(&snowman[2..]), Some(Message::Text("☃".into())));
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn finish_flushes_truncated_tail() {
        let snowman = "☃".as_bytes();
        let mut framer = Utf8Framer::new();
        assert_eq!(framer.finish(), None);

        let mut chunk = b"bye".to_vec();
        chunk.extend_from_slice(&snowman[..2]);
        assert_eq!(framer.push(&chunk), Some(Message::Text("bye".into())));
        assert_eq!(framer.finish(), Some(Message::Binary(snowman[..2].to_vec())));
        assert_eq!(framer.pending(), 0);
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn invalid_bytes_go_binary() {
        let mut framer = Utf8Framer::new();
        assert_eq!(
            framer.push(&[b'a', 0xff, b'b']),
            Some(Message::Binary(vec![b'a', 0xff, b'b']))
        );
        assert_eq!(framer.pending(), 0);
    }
}
