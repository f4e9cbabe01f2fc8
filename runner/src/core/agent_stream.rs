//! Parser for the agent's line-delimited JSON event stream.
//!
//! The agent emits one JSON object per stdout line. `assistant` events carry
//! text fragments, `result` events carry the final outcome string. Anything
//! that is not a structured event is forwarded verbatim.

use std::collections::VecDeque;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: Option<String>,
    message: Option<StreamMessage>,
    result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(rename = "type")]
    kind: Option<String>,
    text: Option<String>,
}

/// Interpretation of one stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine {
    /// Not a structured event; forward as-is.
    Raw(String),
    /// Assistant text fragments, in order.
    Text(Vec<String>),
    /// Final outcome string.
    Result(String),
    /// Structured event with nothing to surface.
    Ignored,
}

pub fn parse_stream_line(line: &str) -> StreamLine {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return StreamLine::Raw(line.to_string());
    }
    let Ok(event) = serde_json::from_str::<StreamEvent>(trimmed) else {
        return StreamLine::Raw(line.to_string());
    };
    match event.kind.as_deref() {
        Some("assistant") => {
            let parts: Vec<String> = event
                .message
                .map(|m| m.content)
                .unwrap_or_default()
                .into_iter()
                .filter(|part| part.kind.as_deref() == Some("text"))
                .filter_map(|part| part.text)
                .filter(|text| !text.is_empty())
                .collect();
            if parts.is_empty() {
                StreamLine::Ignored
            } else {
                StreamLine::Text(parts)
            }
        }
        Some("result") => match event.result {
            Some(result) if !result.is_empty() => StreamLine::Result(result),
            _ => StreamLine::Ignored,
        },
        _ => StreamLine::Ignored,
    }
}

/// Rolling window of the last `cap` lines.
#[derive(Debug, Clone)]
pub struct LineTail {
    cap: usize,
    lines: VecDeque<String>,
}

impl LineTail {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            lines: VecDeque::with_capacity(cap.min(64)),
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.cap == 0 {
            return;
        }
        if self.lines.len() == self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn joined(&self) -> String {
        self.lines().collect::<Vec<_>>().join("\n")
    }
}

/// Accumulated view of an agent's stdout.
#[derive(Debug, Clone)]
pub struct StreamAccumulator {
    full_output: String,
    final_result: Option<String>,
    stdout_tail: LineTail,
}

impl StreamAccumulator {
    pub fn new(tail_lines: usize) -> Self {
        Self {
            full_output: String::new(),
            final_result: None,
            stdout_tail: LineTail::new(tail_lines),
        }
    }

    /// Consume one stdout line; returns the lines to forward to output listeners.
    pub fn push_line(&mut self, line: &str) -> Vec<String> {
        self.stdout_tail.push(line);
        match parse_stream_line(line) {
            StreamLine::Raw(raw) => vec![raw],
            StreamLine::Text(parts) => {
                for part in &parts {
                    self.full_output.push_str(part);
                }
                parts
            }
            StreamLine::Result(result) => {
                self.final_result = Some(result);
                Vec::new()
            }
            StreamLine::Ignored => Vec::new(),
        }
    }

    pub fn full_output(&self) -> &str {
        &self.full_output
    }

    pub fn final_result(&self) -> Option<&str> {
        self.final_result.as_deref()
    }

    pub fn stdout_tail(&self) -> &LineTail {
        &self.stdout_tail
    }
}
