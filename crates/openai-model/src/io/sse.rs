use super::{Chunks, Error};

/// Reads the `data` payloads of server-sent events from a chunk stream.
///
/// Lines may end with `\n` or `\r\n`. Comments and fields other than `data`
/// are skipped, and multiple `data` lines of one event are joined with a
/// newline.
pub struct Sse {
    buf: Vec<u8>,
    data: Vec<String>,
    chunks: Chunks,
    eof: bool,
}

impl Sse {
    #[inline]
    pub fn new(chunks: Chunks) -> Self {
        Self {
            buf: vec![],
            data: vec![],
            chunks,
            eof: false,
        }
    }

    pub async fn next_event(&mut self) -> Result<Option<String>, Error> {
        loop {
            if let Some(event) = self.try_parse_event()? {
                return Ok(Some(event));
            }
            if self.eof {
                // A final event without its blank line still counts.
                if self.data.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_data()));
            }

            match self.chunks.next_chunk().await? {
                Some(bytes) => self.buf.extend_from_slice(&bytes),
                None => {
                    self.eof = true;
                    if !self.buf.is_empty() {
                        self.buf.push(b'\n');
                    }
                }
            }
        }
    }

    fn try_parse_event(&mut self) -> Result<Option<String>, Error> {
        while let Some(eol_idx) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=eol_idx).collect();
            let line = std::str::from_utf8(&line)
                .map_err(|_| Error::InvalidPayload)?
                .trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    return Ok(Some(self.take_data()));
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = line.split_once(':').unwrap_or((line, ""));
            if field == "data" {
                let value = value.strip_prefix(' ').unwrap_or(value);
                self.data.push(value.to_owned());
            }
        }
        Ok(None)
    }

    fn take_data(&mut self) -> String {
        let data = self.data.join("\n");
        self.data.clear();
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(chunks: &[&'static str]) -> Result<Vec<String>, Error> {
        let mut sse = Sse::new(Chunks::from_static(chunks));
        let mut events = vec![];
        while let Some(event) = sse.next_event().await? {
            events.push(event);
        }
        Ok(events)
    }

    #[tokio::test]
    async fn test_normal_events() {
        let events = collect(&["data: hello\n\n", "data: bye\n\n"]).await;
        assert_eq!(events.unwrap(), ["hello", "bye"]);
    }

    #[tokio::test]
    async fn test_split_chunks() {
        let events = collect(&["da", "ta:", " hello\r", "\n", "\r\ndata: b", "ye\n\n"]).await;
        assert_eq!(events.unwrap(), ["hello", "bye"]);
    }

    #[tokio::test]
    async fn test_fields_and_comments() {
        let events = collect(&[
            ": keep-alive\n\n",
            "event: message\nid: 7\ndata: first\ndata: second\n\n",
            "retry: 1000\n\n",
            "data:no-space\n\n",
        ])
        .await;
        assert_eq!(events.unwrap(), ["first\nsecond", "no-space"]);
    }

    #[tokio::test]
    async fn test_unterminated_tail() {
        let events = collect(&["data: hello\n\ndata: [DONE]"]).await;
        assert_eq!(events.unwrap(), ["hello", "[DONE]"]);

        let events = collect(&["id: 1\n"]).await;
        assert!(events.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_utf8() {
        let mut sse = Sse::new(Chunks::VecDeque(
            vec![bytes::Bytes::from_static(b"data: \xff\n\n")].into(),
        ));
        assert_eq!(sse.next_event().await.unwrap_err(), Error::InvalidPayload);
    }
}
