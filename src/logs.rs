//! Per-task log sinks.
//!
//! Build output is never routed through ambient state: every subprocess
//! invocation receives an explicit [`BuildLog`] handle naming where its
//! output goes.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// A line-oriented log sink shared between the threads that stream one
/// task's subprocess output.
pub struct BuildLog {
    sink: Option<Mutex<BufWriter<File>>>,
}

impl BuildLog {
    /// Open a log file, truncating any previous contents.
    pub fn to_file(path: &Path) -> std::io::Result<BuildLog> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(BuildLog {
            sink: Some(Mutex::new(BufWriter::new(file))),
        })
    }

    /// A sink that discards everything.
    pub fn null() -> BuildLog {
        BuildLog { sink: None }
    }

    /// Append one line. Logging is best-effort; write failures are
    /// swallowed so they can never mask the primary error.
    pub fn line(&self, line: &str) {
        if let Some(sink) = &self.sink {
            if let Ok(mut w) = sink.lock() {
                let _ = writeln!(w, "{}", line);
                let _ = w.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BuildLog;

    #[test]
    fn test_log_lines_written() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("task.log");
        let log = BuildLog::to_file(&path).unwrap();
        log.line("first");
        log.line("second");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "first\nsecond\n");
    }

    #[test]
    fn test_null_log_is_silent() {
        let log = BuildLog::null();
        log.line("goes nowhere");
    }
}
