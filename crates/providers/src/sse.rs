//! Shared SSE streaming plumbing for provider adapters.
//!
//! Adapters hand a `reqwest::Response` plus a parser closure mapping each
//! `data:` payload to zero or more text chunks. The stream buffers chunks,
//! splits on `\n\n`, and guarantees a terminal `done` chunk.

use crate::util::from_reqwest;
use hb_domain::error::Result;
use hb_domain::stream::{BoxStream, StreamChunk};

/// Extract complete `data:` payloads from an SSE buffer, draining consumed
/// bytes in place. A trailing partial event stays for the next call.
pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        for line in block.lines() {
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }

    data_lines
}

/// Build a chunk stream from an SSE response and a per-payload parser.
///
/// The parser returns text fragments; `None` marks end-of-stream. A
/// terminal `{done: true}` chunk is always emitted exactly once, whether
/// the parser signalled completion, the body closed, or an error occurred.
pub(crate) fn sse_chunk_stream<F>(
    response: reqwest::Response,
    mut parse_data: F,
) -> BoxStream<'static, Result<StreamChunk>>
where
    F: FnMut(&str) -> SseParse + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();

        'outer: loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for data in drain_data_lines(&mut buffer) {
                        match parse_data(&data) {
                            SseParse::Text(text) if !text.is_empty() => {
                                yield Ok(StreamChunk::text(text));
                            }
                            SseParse::Text(_) => {}
                            SseParse::Done => break 'outer,
                            SseParse::Error(message) => {
                                yield Err(hb_domain::Error::Http(message));
                                break 'outer;
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    yield Err(from_reqwest(e));
                    break;
                }
            }
        }

        yield Ok(StreamChunk::done());
    };
    Box::pin(stream)
}

/// Outcome of parsing one SSE `data:` payload.
pub(crate) enum SseParse {
    Text(String),
    Done,
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_extracts_complete_events_only() {
        let mut buf = "data: one\n\ndata: two\n\ndata: par".to_string();
        let lines = drain_data_lines(&mut buf);
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(buf, "data: par");
    }

    #[test]
    fn drain_skips_non_data_lines() {
        let mut buf = "event: ping\nid: 3\ndata: hello\n\n".to_string();
        let lines = drain_data_lines(&mut buf);
        assert_eq!(lines, vec!["hello"]);
    }

    #[test]
    fn drain_empty_data_ignored() {
        let mut buf = "data:\n\ndata: x\n\n".to_string();
        assert_eq!(drain_data_lines(&mut buf), vec!["x"]);
    }
}
