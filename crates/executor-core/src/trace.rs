use std::io::Write;
use std::sync::Mutex;

use tracing::warn;

/// Sink for the job's user-visible output.
pub trait JobTrace: Send + Sync {
    /// Append one line of script output.
    fn write_line(&self, line: &str);

    /// Executor-generated status line.
    fn notice(&self, message: &str) {
        self.write_line(message);
    }
}

/// Prints the trace to stdout.
#[derive(Debug, Default)]
pub struct StdoutTrace;

impl JobTrace for StdoutTrace {
    fn write_line(&self, line: &str) {
        write_to(&mut std::io::stdout().lock(), line);
    }

    fn notice(&self, message: &str) {
        write_to(
            &mut std::io::stdout().lock(),
            &format!("\x1b[32;1m{}\x1b[0;m", message),
        );
    }
}

/// Write one line; a failed write is logged and the line dropped.
fn write_to(out: &mut impl Write, line: &str) -> bool {
    match writeln!(out, "{}", line) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to write job trace: {}", e);
            false
        }
    }
}

/// Keeps the trace in memory.
#[derive(Debug, Default)]
pub struct BufferTrace {
    lines: Mutex<Vec<String>>,
    notices: Mutex<Vec<String>>,
}

impl BufferTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script output lines written so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn notices(&self) -> Vec<String> {
        self.notices.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl JobTrace for BufferTrace {
    fn write_line(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }

    fn notice(&self, message: &str) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(message.to_string());
        }
    }
}
