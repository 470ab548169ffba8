use std::io::Write;

use colored::Colorize;

/// Destination for everything an adapter prints.
pub trait OutputSink {
    fn write(&mut self, text: &str);

    /// Framing text (prompt echo, role labels). Cosmetic styling only.
    fn frame(&mut self, text: &str) {
        self.write(text);
    }

    /// True when this sink already is the process stdout, so adapters that
    /// print there directly must not write the same bytes twice.
    fn mirrors_stdout(&self) -> bool {
        false
    }
}

/// Process stdout, with dimmed framing when `color` is set.
pub struct StdoutSink {
    color: bool,
}

impl StdoutSink {
    pub fn new(color: bool) -> Self {
        Self { color }
    }
}

impl OutputSink for StdoutSink {
    fn write(&mut self, text: &str) {
        let mut out = std::io::stdout().lock();
        if let Err(e) = out.write_all(text.as_bytes()).and_then(|_| out.flush()) {
            tracing::warn!("stdout write failed: {e}");
        }
    }

    fn frame(&mut self, text: &str) {
        if self.color {
            let styled = text.dimmed().to_string();
            self.write(&styled);
        } else {
            self.write(text);
        }
    }

    fn mirrors_stdout(&self) -> bool {
        true
    }
}

/// Collects output in memory.
#[derive(Debug, Default)]
pub struct BufferSink {
    pub output: String,
}

impl OutputSink for BufferSink {
    fn write(&mut self, text: &str) {
        self.output.push_str(text);
    }
}
