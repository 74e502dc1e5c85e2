//! Incremental Server-Sent-Events decoder for southbound streams.
//!
//! Feed raw body chunks in; complete events come out. Only `event:` and
//! `data:` fields matter for MCP; comments and unknown fields are skipped.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every event completed by it.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();

        // An event ends at a blank line. Keep any trailing partial event
        // buffered for the next chunk.
        while let Some(pos) = find_event_boundary(&self.buf) {
            let raw = self.buf[..pos.body].to_string();
            self.buf.drain(..pos.end);
            if let Some(ev) = parse_event(&raw) {
                out.push(ev);
            }
        }

        out
    }
}

struct Boundary {
    body: usize,
    end: usize,
}

fn find_event_boundary(buf: &str) -> Option<Boundary> {
    // Accept both \n\n and \r\n\r\n separators.
    let lf = buf.find("\n\n").map(|i| Boundary { body: i, end: i + 2 });
    let crlf = buf.find("\r\n\r\n").map(|i| Boundary { body: i, end: i + 4 });
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.body <= b.body { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn parse_event(raw: &str) -> Option<SseEvent> {
    let mut event = String::from("message");
    let mut data_lines: Vec<&str> = Vec::new();

    for line in raw.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim_start().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
    })
}
