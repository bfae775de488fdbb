//! Incremental decoding of a streamed answer.
//!
//! The responder streams raw bytes. A multi-byte UTF-8 character may be
//! split across two chunks, so decoding keeps the incomplete tail until the
//! next chunk arrives. Invalid sequences decode to U+FFFD.
//!
//! [`ResponseFold`] is the fold the chat engine runs over the stream: each
//! chunk extends a running accumulator, and the caller writes the whole
//! accumulator into the timeline. Writing the accumulator (rather than the
//! delta) makes each step idempotent.

/// Stateful UTF-8 decoder for chunked input.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `pending + chunk` as forms complete characters.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        let mut pos = 0;
        while pos < self.pending.len() {
            match std::str::from_utf8(&self.pending[pos..]) {
                Ok(s) => {
                    out.push_str(s);
                    pos = self.pending.len();
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[pos..pos + valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            pos += valid + bad;
                        }
                        None => {
                            pos += valid;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..pos);
        out
    }

    /// Flush at end of stream; a dangling partial character becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        self.pending.clear();
        char::REPLACEMENT_CHARACTER.to_string()
    }
}

/// Running accumulator over a response stream.
#[derive(Debug, Default)]
pub struct ResponseFold {
    decoder: Utf8StreamDecoder,
    text: String,
    chunks: usize,
}

impl ResponseFold {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return the accumulated text so far.
    pub fn push(&mut self, chunk: &[u8]) -> &str {
        let decoded = self.decoder.decode(chunk);
        self.text.push_str(&decoded);
        self.chunks += 1;
        &self.text
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    /// Close the fold, flushing any partial character.
    pub fn finish(mut self) -> String {
        let tail = self.decoder.finish();
        self.text.push_str(&tail);
        self.text
    }
}

/// Fold a complete chunk sequence into its final text.
pub fn fold_chunks<I, B>(chunks: I) -> String
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut fold = ResponseFold::new();
    for chunk in chunks {
        fold.push(chunk.as_ref());
    }
    fold.finish()
}
