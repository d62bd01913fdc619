//! Line-oriented SSE relay for streaming completions. Each upstream
//! `data:` line is parsed, has its `model` rewritten to the client's
//! original name, and is re-emitted as its own body frame so chunk
//! boundaries and ordering survive the trip.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::{stream, StreamExt};

const DONE_MARKER: &str = "[DONE]";

struct RelayState {
    upstream: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    buffer: BytesMut,
    pending: VecDeque<Bytes>,
    original_model: String,
    /// Set once `[DONE]` is seen or the upstream ends; remaining upstream
    /// bytes are dropped.
    terminated: bool,
    upstream_exhausted: bool,
}

/// Wraps an upstream streaming response into the relayed client body.
pub fn relay_stream(
    upstream: reqwest::Response,
    original_model: String,
) -> BoxStream<'static, Result<Bytes, std::io::Error>> {
    let state = RelayState {
        upstream: upstream.bytes_stream().boxed(),
        buffer: BytesMut::new(),
        pending: VecDeque::new(),
        original_model,
        terminated: false,
        upstream_exhausted: false,
    };
    relay_from_state(state)
}

fn relay_from_state(state: RelayState) -> BoxStream<'static, Result<Bytes, std::io::Error>> {
    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.pending.pop_front() {
                return Some((Ok(frame), state));
            }
            if state.terminated {
                return None;
            }

            if state.upstream_exhausted {
                // Flush a trailing line that arrived without a newline.
                if !state.buffer.is_empty() {
                    let line = String::from_utf8_lossy(&state.buffer).into_owned();
                    state.buffer.clear();
                    process_line(&line, &state.original_model, &mut state.pending);
                }
                state.terminated = true;
                continue;
            }

            match state.upstream.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    while let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                        let line_bytes = state.buffer.split_to(pos + 1);
                        let line = String::from_utf8_lossy(&line_bytes[..pos]).into_owned();
                        if process_line(&line, &state.original_model, &mut state.pending) {
                            state.terminated = true;
                            break;
                        }
                    }
                }
                Some(Err(err)) => {
                    state.terminated = true;
                    return Some((Err(std::io::Error::other(err)), state));
                }
                None => {
                    state.upstream_exhausted = true;
                }
            }
        }
    }))
}

/// Handles one upstream line; returns true when the stream is complete.
/// `data:` payloads are rewritten and re-framed; unparseable data lines
/// pass through untouched; other non-blank lines keep a single newline.
/// Blank separator lines are dropped — the data-line framing re-emits them.
fn process_line(line: &str, original_model: &str, out: &mut VecDeque<Bytes>) -> bool {
    let line = line.strip_suffix('\r').unwrap_or(line);

    if let Some(data) = line.strip_prefix("data: ") {
        if data == DONE_MARKER {
            out.push_back(Bytes::from_static(b"data: [DONE]\n\n"));
            return true;
        }
        match serde_json::from_str::<serde_json::Value>(data) {
            Ok(mut chunk) => {
                if let Some(fields) = chunk.as_object_mut() {
                    fields.insert(
                        "model".to_string(),
                        serde_json::Value::from(original_model),
                    );
                }
                let rewritten =
                    serde_json::to_string(&chunk).unwrap_or_else(|_| data.to_string());
                out.push_back(Bytes::from(format!("data: {rewritten}\n\n")));
            }
            Err(_) => {
                out.push_back(Bytes::from(format!("{line}\n\n")));
            }
        }
        return false;
    }

    if !line.is_empty() {
        out.push_back(Bytes::from(format!("{line}\n")));
    }
    false
}
