/// Incremental server-sent-events decoder.
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence; only
/// complete lines are decoded. Each blank line terminates an event and yields
/// its `data:` lines joined with `\n`. Other fields and comments are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=newline).collect::<Vec<_>>();
            let line = String::from_utf8_lossy(&line);
            let trimmed = line.trim_end_matches(&['\r', '\n'][..]);
            if trimmed.is_empty() {
                if let Some(event) = self.take_event() {
                    events.push(event);
                }
                continue;
            }
            if let Some(data) = trimmed.strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
        }

        events
    }

    /// Flushes a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&rest);
            if let Some(data) = line.trim_end_matches('\r').strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
        }
        self.take_event()
    }

    fn take_event(&mut self) -> Option<String> {
        if self.data_lines.is_empty() {
            return None;
        }
        let data = self.data_lines.join("\n");
        self.data_lines.clear();
        Some(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_split_chunks() {
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        for chunk in [
            &b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel"[..],
            b"lo\"}}]}\n",
            b"\n",
            b"data: [DONE]\n",
            b"\n",
        ] {
            events.extend(decoder.feed(chunk));
        }

        assert_eq!(
            events,
            vec![
                "{\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}".to_string(),
                "[DONE]".to_string()
            ]
        );
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn keeps_multibyte_characters_split_across_reads() {
        let bytes = "data: héllo\n\n".as_bytes();
        let split = bytes.iter().position(|byte| *byte == 0xC3).unwrap() + 1;
        let mut decoder = SseDecoder::new();

        assert!(decoder.feed(&bytes[..split]).is_empty());
        assert_eq!(decoder.feed(&bytes[split..]), vec!["héllo".to_string()]);
    }

    #[test]
    fn ignores_comments_and_joins_multiline_data() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b": keep-alive\r\n\r\nevent: message\r\ndata: a\r\ndata: b\r\n\r\n");
        assert_eq!(events, vec!["a\nb".to_string()]);
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"a\":1}").is_empty());
        assert_eq!(decoder.finish(), Some("{\"a\":1}".to_string()));
    }
}
