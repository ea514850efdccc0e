//! Append-only operation log.
//!
//! One JSON object per line: `{ ts, session_id, phase, event, detail }`.
//! Logging failures never interrupt a flash; callers downgrade them to
//! warnings.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

#[derive(Serialize)]
struct LogLine<'a> {
    ts: String,
    session_id: &'a str,
    phase: &'a str,
    event: &'a str,
    detail: &'a str,
}

/// JSON-lines log writer, opened in append mode.
pub struct OperationLog {
    writer: BufWriter<File>,
}

impl OperationLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn record(
        &mut self,
        session_id: &str,
        phase: &str,
        event: &str,
        detail: &str,
    ) -> std::io::Result<()> {
        let line = LogLine {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            session_id,
            phase,
            event,
            detail,
        };
        serde_json::to_writer(&mut self.writer, &line)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}
