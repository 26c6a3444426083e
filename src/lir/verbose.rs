//! Tracer stage: logs every instruction that leaves the pipeline.

use super::{LInsRef, LirBuffer};

#[derive(Debug, Default)]
pub struct VerboseWriter {
    lines: Vec<String>,
}

impl VerboseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the instruction a request resolved to. `reused` is set when the
    /// later stages answered with an instruction that was already in the buffer.
    pub fn record(&mut self, buf: &LirBuffer, r: LInsRef, reused: bool) {
        let mut line = buf.format_ins(r);
        if reused {
            line.push_str(" ; reused");
        }
        log::info!(target: "lirjit::lir", "{}", line);
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn take_lines(&mut self) -> Vec<String> {
        std::mem::take(&mut self.lines)
    }
}
