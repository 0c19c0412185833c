//! Append-only CSV sample store
//!
//! The file written here is the only contract exposed to readers (chart
//! renderers, dashboards, ad hoc analysis). The header is written exactly once,
//! when the file is new or empty. Rows are not buffered: each one goes to the
//! file in a single write, so a row that failed is never written later.
//!
//! A sink assumes it is the only writer of its path. There is no locking.

use crate::models::Sample;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Column names, in file order
pub const HEADER: [&str; 6] = [
    "timestamp",
    "container",
    "cpu_pct",
    "mem_usage_mb",
    "mem_limit_mb",
    "mem_pct",
];

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A batch stopped early; rows before the failing one are on disk
    #[error("{source} ({written} rows of the batch written)")]
    Batch {
        written: usize,
        #[source]
        source: Box<SinkError>,
    },

    #[error("malformed row {row}: {message}")]
    Malformed { row: usize, message: String },
}

pub type Result<T> = std::result::Result<T, SinkError>;

/// Append-only writer for sample rows
pub struct SampleSink {
    path: PathBuf,
    writer: Box<dyn Write + Send>,
}

impl SampleSink {
    /// Open or create the file at `path`, writing the header if it is new or empty
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let needs_header = match std::fs::metadata(&path) {
            Ok(meta) => meta.len() == 0,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(source) => return Err(SinkError::Open { path, source }),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| SinkError::Open {
                path: path.clone(),
                source,
            })?;

        let mut sink = Self {
            path,
            writer: Box::new(file),
        };

        if needs_header {
            sink.write_line(&HEADER.join(","))?;
            info!(path = %sink.path.display(), "Created sample file with header");
        } else {
            debug!(path = %sink.path.display(), "Appending to existing sample file");
        }

        Ok(sink)
    }

    /// Sink over an arbitrary writer, for exercising write failures
    #[cfg(test)]
    pub(crate) fn with_writer(
        path: impl Into<PathBuf>,
        writer: impl Write + Send + 'static,
    ) -> Self {
        Self {
            path: path.into(),
            writer: Box::new(writer),
        }
    }

    /// Append one row
    ///
    /// On error nothing is retained for a later retry; the row is dropped.
    pub fn append(&mut self, sample: &Sample) -> Result<()> {
        self.write_line(&format_row(sample))
    }

    /// Append rows in order, stopping at the first failure.
    /// Returns the number of rows written.
    pub fn append_batch(&mut self, samples: &[Sample]) -> Result<usize> {
        for (written, sample) in samples.iter().enumerate() {
            self.append(sample).map_err(|source| SinkError::Batch {
                written,
                source: Box::new(source),
            })?;
        }
        Ok(samples.len())
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        let mut row = String::with_capacity(line.len() + 1);
        row.push_str(line);
        row.push('\n');

        let result = self
            .writer
            .write_all(row.as_bytes())
            .and_then(|()| self.writer.flush());

        result.map_err(|source| SinkError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

/// Render a sample as one CSV line (without the newline)
pub fn format_row(sample: &Sample) -> String {
    format!(
        "{},{},{:.2},{:.2},{:.2},{:.2}",
        sample.captured_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        escape_field(&sample.entity_name),
        sample.cpu_pct,
        sample.mem_usage_mb,
        sample.mem_limit_mb,
        sample.mem_pct,
    )
}

fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Read every sample from a file written by [`SampleSink`]
pub fn read_samples(path: impl AsRef<Path>) -> Result<Vec<Sample>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| SinkError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut records = parse_records(&content)?.into_iter().enumerate();

    match records.next() {
        Some((_, header)) if header == HEADER => {}
        Some(_) => {
            return Err(SinkError::Malformed {
                row: 1,
                message: "missing header".to_string(),
            })
        }
        None => return Ok(Vec::new()),
    }

    records
        .map(|(index, fields)| parse_sample(index + 1, &fields))
        .collect()
}

fn parse_sample(row: usize, fields: &[String]) -> Result<Sample> {
    let malformed = |message: String| SinkError::Malformed { row, message };

    if fields.len() != HEADER.len() {
        return Err(malformed(format!(
            "expected {} fields, found {}",
            HEADER.len(),
            fields.len()
        )));
    }

    let captured_at = DateTime::parse_from_rfc3339(&fields[0])
        .map_err(|e| malformed(format!("bad timestamp '{}': {}", fields[0], e)))?
        .with_timezone(&Utc);

    let number = |i: usize| -> Result<f64> {
        fields[i]
            .parse()
            .map_err(|_| malformed(format!("bad {} '{}'", HEADER[i], fields[i])))
    };

    Ok(Sample {
        captured_at,
        entity_name: fields[1].clone(),
        cpu_pct: number(2)?,
        mem_usage_mb: number(3)?,
        mem_limit_mb: number(4)?,
        mem_pct: number(5)?,
    })
}

/// Split CSV content into records, honoring quoted fields
fn parse_records(content: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(SinkError::Malformed {
            row: records.len() + 1,
            message: "unterminated quoted field".to_string(),
        });
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn sample(name: &str, cpu: f64) -> Sample {
        Sample::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
            name,
            cpu,
            250.0,
            1024.0,
            24.4140625,
        )
    }

    fn lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_header_written_once_across_reopens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.csv");

        for round in 0..3 {
            let mut sink = SampleSink::open(&path).unwrap();
            sink.append(&sample("web", round as f64)).unwrap();
        }

        let lines = lines(&path);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "timestamp,container,cpu_pct,mem_usage_mb,mem_limit_mb,mem_pct");
        assert_eq!(lines.iter().filter(|l| l.starts_with("timestamp")).count(), 1);
    }

    #[test]
    fn test_empty_existing_file_gets_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.csv");
        std::fs::write(&path, "").unwrap();

        SampleSink::open(&path).unwrap();

        assert_eq!(lines(&path), vec![HEADER.join(",")]);
    }

    #[test]
    fn test_existing_file_appended_as_is() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.csv");
        std::fs::write(&path, "something else\n").unwrap();

        let mut sink = SampleSink::open(&path).unwrap();
        sink.append(&sample("web", 1.0)).unwrap();

        let lines = lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "something else");
    }

    #[test]
    fn test_row_format() {
        let row = format_row(&sample("web", 40.0));
        assert_eq!(row, "2024-05-01T12:30:00Z,web,40.00,250.00,1024.00,24.41");
    }

    #[test]
    fn test_row_is_visible_without_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.csv");

        let mut sink = SampleSink::open(&path).unwrap();
        sink.append(&sample("web", 1.0)).unwrap();

        // Sink still alive: the row must already be on disk
        assert_eq!(lines(&path).len(), 2);
        drop(sink);
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.csv");

        let written = vec![
            sample("web", 40.0),
            sample("ns/api", 0.0),
            sample("odd, \"quoted\" name", 12.3),
        ];

        let mut sink = SampleSink::open(&path).unwrap();
        assert_eq!(sink.append_batch(&written).unwrap(), 3);

        let read = read_samples(&path).unwrap();
        assert_eq!(read.len(), written.len());
        for (got, want) in read.iter().zip(&written) {
            assert_eq!(got.captured_at, want.captured_at);
            assert_eq!(got.entity_name, want.entity_name);
            assert!((got.cpu_pct - want.cpu_pct).abs() < 0.006);
            assert!((got.mem_usage_mb - want.mem_usage_mb).abs() < 0.006);
            assert!((got.mem_limit_mb - want.mem_limit_mb).abs() < 0.006);
            assert!((got.mem_pct - want.mem_pct).abs() < 0.006);
        }
    }

    #[test]
    fn test_read_rejects_missing_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.csv");
        std::fs::write(&path, "2024-05-01T12:30:00Z,web,1.00,2.00,3.00,4.00\n").unwrap();

        assert!(matches!(
            read_samples(&path),
            Err(SinkError::Malformed { row: 1, .. })
        ));
    }

    /// Accepts `budget` writes, then fails with ENOSPC
    struct LimitedWriter {
        budget: usize,
    }

    impl Write for LimitedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::from_raw_os_error(28));
            }
            self.budget -= 1;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_row_is_reported() {
        let mut sink = SampleSink::with_writer("stats.csv", LimitedWriter { budget: 1 });

        sink.append(&sample("web", 1.0)).unwrap();
        let err = sink.append(&sample("db", 2.0)).unwrap_err();

        assert!(matches!(err, SinkError::Write { .. }));
        assert!(err.to_string().contains("stats.csv"));
    }

    #[test]
    fn test_batch_reports_rows_written_before_failure() {
        let mut sink = SampleSink::with_writer("stats.csv", LimitedWriter { budget: 2 });
        let batch = [sample("web", 1.0), sample("db", 2.0), sample("cache", 3.0)];

        match sink.append_batch(&batch) {
            Err(SinkError::Batch { written, source }) => {
                assert_eq!(written, 2);
                assert!(matches!(*source, SinkError::Write { .. }));
            }
            other => panic!("expected a batch error, got {:?}", other),
        }
    }

    #[test]
    fn test_open_fails_for_missing_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("stats.csv");

        assert!(matches!(SampleSink::open(&path), Err(SinkError::Open { .. })));
    }
}
