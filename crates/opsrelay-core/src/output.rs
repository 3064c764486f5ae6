use std::collections::VecDeque;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Default rolling buffer cap, in lines.
pub const DEFAULT_BUFFER_MAX_LINES: usize = 500;

/// Returns the current time as milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Stdout,
    Stderr,
    Meta,
}

/// One captured unit of process output or a lifecycle event.
///
/// Serializes to the wire form `{"t": <epoch-ms>, "kind": ..., "data": ...}`
/// used both in the replay buffer and on the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLine {
    pub t: u64,
    pub kind: OutputKind,
    pub data: String,
}

impl OutputLine {
    pub fn new(kind: OutputKind, data: impl Into<String>) -> Self {
        Self {
            t: now_ms(),
            kind,
            data: data.into(),
        }
    }
}

/// Bounded FIFO buffer of output lines. Oldest lines are dropped first
/// once the cap is reached.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: VecDeque<OutputLine>,
    max_lines: usize,
}

impl OutputBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_lines.max(1)),
            max_lines: max_lines.max(1),
        }
    }

    pub fn push(&mut self, line: OutputLine) {
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            let _ = self.lines.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<OutputLine> {
        self.lines.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&OutputLine> {
        self.lines.back()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_is_bounded_and_fifo() {
        let mut buf = OutputBuffer::new(2);
        buf.push(OutputLine::new(OutputKind::Stdout, "one"));
        buf.push(OutputLine::new(OutputKind::Stdout, "two"));
        buf.push(OutputLine::new(OutputKind::Stdout, "three"));

        let lines = buf.snapshot();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].data, "two");
        assert_eq!(lines[1].data, "three");
    }

    #[test]
    fn timestamps_non_decreasing_under_eviction() {
        let mut buf = OutputBuffer::new(3);
        for i in 0..10 {
            buf.push(OutputLine::new(OutputKind::Stderr, format!("line {i}")));
        }
        let lines = buf.snapshot();
        assert_eq!(lines.len(), 3);
        assert!(lines.windows(2).all(|w| w[0].t <= w[1].t));
        assert_eq!(lines[0].data, "line 7");
    }

    #[test]
    fn wire_shape() {
        let line = OutputLine::new(OutputKind::Meta, "EXIT 0");
        let json = serde_json::to_value(&line).expect("serialize");
        assert_eq!(json["kind"], "meta");
        assert_eq!(json["data"], "EXIT 0");
        assert!(json["t"].as_u64().is_some());
    }
}
