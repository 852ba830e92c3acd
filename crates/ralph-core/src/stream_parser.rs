//! Incremental parser for the Runner's newline-delimited JSON stdout.
//!
//! Grounded in `ClaudeCodeAdapter::parse_stream_json_line`'s per-record
//! matching (`harness/claude_code.rs` in the teacher), but restructured
//! as a push-based, mutex-guarded accumulator instead of an event
//! stream: the Runner feeds raw bytes as they arrive and reads back the
//! accumulated text/result from any other task at any time (§4.B).

use std::sync::{Arc, Mutex};

use tracing::debug;

/// A callback invoked with each piece of streamed text, or with the
/// final `result` string.
pub type TextCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct ParserState {
    raw: Vec<u8>,
    line_buf: String,
    full_text: String,
    result: Option<String>,
}

/// Parses newline-delimited JSON records of the shape emitted by the LM
/// tool's `stream-json` output format.
///
/// Only two record types are recognised; everything else — including
/// malformed JSON — is silently ignored (logged at `debug`).
pub struct StreamParser {
    state: Mutex<ParserState>,
    on_text: Option<TextCallback>,
    on_result: Option<TextCallback>,
}

impl std::fmt::Debug for StreamParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamParser").finish_non_exhaustive()
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ParserState::default()),
            on_text: None,
            on_result: None,
        }
    }

    pub fn with_callbacks(on_text: Option<TextCallback>, on_result: Option<TextCallback>) -> Self {
        Self {
            state: Mutex::new(ParserState::default()),
            on_text,
            on_result,
        }
    }

    /// Feed a chunk of raw stdout bytes. Complete lines (terminated by
    /// `\n`) are parsed immediately; a trailing partial line is buffered
    /// until the next `feed` or `finish` call completes it.
    pub fn feed(&self, chunk: &[u8]) {
        let lines = {
            let mut state = self.state.lock().expect("stream parser mutex poisoned");
            state.raw.extend_from_slice(chunk);
            state.line_buf.push_str(&String::from_utf8_lossy(chunk));

            let mut lines = Vec::new();
            while let Some(idx) = state.line_buf.find('\n') {
                let line: String = state.line_buf.drain(..=idx).collect();
                lines.push(line.trim_end_matches(['\n', '\r']).to_string());
            }
            lines
        };

        for line in lines {
            self.process_line(&line);
        }
    }

    /// Flush any buffered partial line (the Runner reached EOF without a
    /// trailing newline).
    pub fn finish(&self) {
        let leftover = {
            let mut state = self.state.lock().expect("stream parser mutex poisoned");
            if state.line_buf.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut state.line_buf))
            }
        };
        if let Some(line) = leftover {
            self.process_line(line.trim_end_matches(['\n', '\r']));
        }
    }

    fn process_line(&self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }

        let value: serde_json::Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                debug!(line = trimmed, error = %e, "ignoring malformed stream-json line");
                return;
            }
        };

        let record_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
        match record_type {
            "assistant" => self.handle_assistant(&value),
            "result" => self.handle_result(&value),
            other => {
                debug!(record_type = other, "ignoring unrecognised stream record type");
            }
        }
    }

    fn handle_assistant(&self, value: &serde_json::Value) {
        let Some(blocks) = value
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array())
        else {
            return;
        };

        for block in blocks {
            if block.get("type").and_then(|t| t.as_str()) != Some("text") {
                continue;
            }
            let Some(text) = block.get("text").and_then(|t| t.as_str()) else {
                continue;
            };
            if text.is_empty() {
                continue;
            }
            {
                let mut state = self.state.lock().expect("stream parser mutex poisoned");
                state.full_text.push_str(text);
            }
            if let Some(cb) = &self.on_text {
                cb(text);
            }
        }
    }

    fn handle_result(&self, value: &serde_json::Value) {
        let Some(result) = value.get("result").and_then(|r| r.as_str()) else {
            return;
        };
        {
            let mut state = self.state.lock().expect("stream parser mutex poisoned");
            state.result = Some(result.to_string());
        }
        if let Some(cb) = &self.on_result {
            cb(result);
        }
    }

    pub fn full_text(&self) -> String {
        self.state
            .lock()
            .expect("stream parser mutex poisoned")
            .full_text
            .clone()
    }

    pub fn raw_bytes(&self) -> Vec<u8> {
        self.state
            .lock()
            .expect("stream parser mutex poisoned")
            .raw
            .clone()
    }

    pub fn result(&self) -> Option<String> {
        self.state
            .lock()
            .expect("stream parser mutex poisoned")
            .result
            .clone()
    }

    pub fn has_result(&self) -> bool {
        self.result().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn feeds_complete_lines_and_extracts_text() {
        let parser = StreamParser::new();
        parser.feed(b"{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"hello \"}]}}\n");
        parser.feed(b"{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"world\"}]}}\n");
        assert_eq!(parser.full_text(), "hello world");
        assert!(!parser.has_result());
    }

    #[test]
    fn buffers_partial_lines_across_feed_calls() {
        let parser = StreamParser::new();
        parser.feed(b"{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",");
        parser.feed(b"\"text\":\"split across chunks\"}]}}\n");
        assert_eq!(parser.full_text(), "split across chunks");
    }

    #[test]
    fn finish_flushes_trailing_line_without_newline() {
        let parser = StreamParser::new();
        parser.feed(b"{\"type\":\"result\",\"result\":\"done\"}");
        assert!(!parser.has_result());
        parser.finish();
        assert_eq!(parser.result().as_deref(), Some("done"));
    }

    #[test]
    fn ignores_non_text_blocks_and_unknown_record_types() {
        let parser = StreamParser::new();
        parser.feed(b"{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"tool_use\",\"name\":\"Bash\"}]}}\n");
        parser.feed(b"{\"type\":\"system\",\"data\":\"warmup\"}\n");
        assert_eq!(parser.full_text(), "");
        assert!(!parser.has_result());
    }

    #[test]
    fn ignores_malformed_json_and_continues() {
        let parser = StreamParser::new();
        parser.feed(b"not json at all\n");
        parser.feed(b"{\"type\":\"result\",\"result\":\"ok\"}\n");
        assert_eq!(parser.result().as_deref(), Some("ok"));
    }

    #[test]
    fn raw_bytes_retains_everything_fed() {
        let parser = StreamParser::new();
        parser.feed(b"abc");
        parser.feed(b"def");
        assert_eq!(parser.raw_bytes(), b"abcdef");
    }

    #[test]
    fn callbacks_fire_for_each_chunk() {
        let text_calls = Arc::new(AtomicUsize::new(0));
        let result_calls = Arc::new(AtomicUsize::new(0));
        let t2 = Arc::clone(&text_calls);
        let r2 = Arc::clone(&result_calls);

        let parser = StreamParser::with_callbacks(
            Some(Arc::new(move |_: &str| {
                t2.fetch_add(1, Ordering::SeqCst);
            })),
            Some(Arc::new(move |_: &str| {
                r2.fetch_add(1, Ordering::SeqCst);
            })),
        );

        parser.feed(b"{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"hi\"}]}}\n");
        parser.feed(b"{\"type\":\"result\",\"result\":\"done\"}\n");

        assert_eq!(text_calls.load(Ordering::SeqCst), 1);
        assert_eq!(result_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_reads_while_parsing_do_not_deadlock() {
        let parser = Arc::new(StreamParser::new());
        let p2 = Arc::clone(&parser);
        let handle = std::thread::spawn(move || {
            for _ in 0..1000 {
                let _ = p2.full_text();
            }
        });
        for _ in 0..1000 {
            parser.feed(b"{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"x\"}]}}\n");
        }
        handle.join().unwrap();
        assert_eq!(parser.full_text().len(), 1000);
    }
}
