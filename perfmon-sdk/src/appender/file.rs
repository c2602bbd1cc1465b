//! Appender writing newline-delimited JSON to a file.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use perfmon_types::{IntervalData, ThreadTraceData};
use serde::Serialize;

use super::{Appender, AppenderId};
use crate::error::Result;

/// One line of output.
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum Record<'a> {
    Interval(&'a IntervalData),
    Trace(&'a ThreadTraceData),
}

/// Appends one JSON object per line: `{"interval": {...}}` or
/// `{"trace": {...}}`.
#[derive(Debug)]
pub struct JsonFileAppender {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonFileAppender {
    pub const CLASS: &'static str = "json-file";
    pub const PATH_ATTRIBUTE: &'static str = "path";

    /// Open (creating if needed) the file for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Build from the `path` attribute of an identity.
    pub fn from_id(id: &AppenderId) -> Result<Self> {
        Self::open(id.require(Self::PATH_ATTRIBUTE)?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, record: &Record<'_>) -> io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.flush()
    }
}

impl Appender for JsonFileAppender {
    fn output_interval(&self, data: &IntervalData) -> io::Result<()> {
        self.write(&Record::Interval(data))
    }

    fn output_trace(&self, trace: &ThreadTraceData) -> io::Result<()> {
        self.write(&Record::Trace(trace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[test]
    fn writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perfmon.ndjson");
        let appender = JsonFileAppender::open(&path).unwrap();

        let data = IntervalData::builder("WebRequest").hits(2).build();
        appender.output_interval(&data).unwrap();
        let mut trace = ThreadTraceData::open("WebRequest", 1);
        trace.close(2);
        appender.output_trace(&trace).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["interval"]["monitor"], "WebRequest");
        assert_eq!(first["interval"]["total_hits"], 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["trace"]["name"], "WebRequest");
    }

    #[test]
    fn path_attribute_is_required() {
        let id = AppenderId::new(JsonFileAppender::CLASS, Duration::from_secs(1), BTreeMap::new());
        assert!(matches!(
            JsonFileAppender::from_id(&id),
            Err(crate::PerfMonError::InvalidAppenderAttribute { .. })
        ));
    }

    #[test]
    fn appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ndjson");
        std::fs::write(&path, "{\"existing\":true}\n").unwrap();

        let appender = JsonFileAppender::open(&path).unwrap();
        appender
            .output_interval(&IntervalData::builder("a").build())
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.starts_with("{\"existing\":true}"));
    }
}
