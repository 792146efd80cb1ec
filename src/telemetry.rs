/// Miner output capture.
///
/// The supervisor feeds every stdout/stderr line of the running miner into an
/// `OutputBuffer`; the control loop drains it once per tick and ships the
/// result to the remote service.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Bounded, shared line buffer. Oldest lines are dropped once full.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<VecDeque<String>>>,
    max_lines: usize,
}

impl OutputBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            max_lines: max_lines.max(1),
        }
    }

    /// Append one line of miner output.
    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.max_lines {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Take everything collected so far, newline-joined.
    pub fn drain(&self) -> String {
        let mut lines = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let joined = lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
        lines.clear();
        joined
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
