//! Append-only mutation record stream and its replay.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use thiserror::Error;

use super::model::{IndexRange, MutationRecord};

/// Record stream errors.
#[derive(Debug, Error)]
pub enum RecordError {
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Line does not follow the record layout.
    #[error("malformed record line: {0}")]
    Malformed(String),
}

/// Destination for records as they are produced.
pub trait RecordSink {
    /// Persist one record before the next index is processed.
    fn append(&mut self, record: &MutationRecord) -> Result<(), RecordError>;
}

impl RecordSink for Vec<MutationRecord> {
    fn append(&mut self, record: &MutationRecord) -> Result<(), RecordError> {
        self.push(record.clone());
        Ok(())
    }
}

/// Writes one encoded line per record and flushes after each.
#[derive(Debug)]
pub struct RecordWriter<W: Write> {
    inner: W,
}

impl<W: Write> RecordWriter<W> {
    /// Wrap a writer.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Unwrap the writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl RecordWriter<std::fs::File> {
    /// Open `path` for appending, creating it if needed.
    pub fn append_to(path: &Path) -> Result<Self, RecordError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(file))
    }
}

impl<W: Write> RecordSink for RecordWriter<W> {
    fn append(&mut self, record: &MutationRecord) -> Result<(), RecordError> {
        self.inner.write_all(encode_record(record).as_bytes())?;
        self.inner.write_all(b"\n")?;
        self.inner.flush()?;
        Ok(())
    }
}

fn escape_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for ch in field.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape_field(field: &str) -> Option<String> {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next()? {
            '\\' => out.push('\\'),
            't' => out.push('\t'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            _ => return None,
        }
    }
    Some(out)
}

/// Encode a record as `index=detected\tunit\tsource\tdescription\tmember`.
pub fn encode_record(record: &MutationRecord) -> String {
    format!(
        "{}={}\t{}\t{}\t{}\t{}",
        record.index,
        record.detected,
        escape_field(&record.mutated_unit),
        escape_field(&record.source_file),
        escape_field(&record.description),
        escape_field(&record.member_signature),
    )
}

/// Decode one record line.
pub fn decode_record(line: &str) -> Result<MutationRecord, RecordError> {
    let malformed = || RecordError::Malformed(line.to_string());

    let fields: Vec<&str> = line.split('\t').collect();
    let [head, unit, source, description, member] = fields.as_slice() else {
        return Err(malformed());
    };
    let (index, detected) = head.split_once('=').ok_or_else(malformed)?;

    Ok(MutationRecord {
        index: index.parse().map_err(|_| malformed())?,
        detected: detected.parse().map_err(|_| malformed())?,
        mutated_unit: unescape_field(unit).ok_or_else(malformed)?,
        source_file: unescape_field(source).ok_or_else(malformed)?,
        description: unescape_field(description).ok_or_else(malformed)?,
        member_signature: unescape_field(member).ok_or_else(malformed)?,
    })
}

/// Records recovered from a record stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordReplay {
    /// Well-formed records in stream order.
    pub records: Vec<MutationRecord>,
    /// Number of malformed lines ignored.
    pub malformed_lines: usize,
}

impl RecordReplay {
    /// First index of `range` a relaunched worker should start at, or `None` if the range is done.
    pub fn resume_index(&self, range: IndexRange) -> Option<usize> {
        let next = self
            .records
            .iter()
            .filter(|r| range.contains(r.index))
            .map(|r| r.index + 1)
            .max()
            .unwrap_or(range.start);
        (next < range.end).then_some(next)
    }
}

/// Replay a record stream, ignoring malformed lines such as a torn tail.
pub fn read_records(path: &Path) -> Result<RecordReplay, RecordError> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);

    let mut replay = RecordReplay::default();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match decode_record(&line) {
            Ok(record) => replay.records.push(record),
            Err(_) => replay.malformed_lines += 1,
        }
    }
    Ok(replay)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn record(index: usize, detected: bool) -> MutationRecord {
        MutationRecord {
            index,
            detected,
            mutated_unit: "src/calc.rs".to_string(),
            source_file: "calc.rs".to_string(),
            description: "line 3: replaced `+` with `-`".to_string(),
            member_signature: "add(a: i32, b: i32) -> i32".to_string(),
        }
    }

    #[test]
    fn encoded_line_has_fixed_layout() {
        let line = encode_record(&record(4, true));
        assert_eq!(
            line,
            "4=true\tsrc/calc.rs\tcalc.rs\tline 3: replaced `+` with `-`\tadd(a: i32, b: i32) -> i32"
        );
    }

    #[test]
    fn delimiters_inside_fields_are_escaped() {
        let mut rec = record(0, false);
        rec.description = "tab\there\nnewline \\ slash".to_string();
        let line = encode_record(&rec);
        assert!(!line.contains('\n'));
        assert_eq!(line.matches('\t').count(), 4);
        assert_eq!(decode_record(&line).expect("line should decode"), rec);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(decode_record("not a record").is_err());
        assert!(decode_record("x=true\ta\tb\tc\td").is_err());
        assert!(decode_record("1=maybe\ta\tb\tc\td").is_err());
        assert!(decode_record("1=true\ta\tb\tc\\q\td").is_err());
    }

    #[test]
    fn writer_appends_and_replay_ignores_torn_tail() {
        let tmp = tempdir().expect("tempdir should be created");
        let path = tmp.path().join("records.out");

        {
            let mut writer = RecordWriter::append_to(&path).expect("record file should open");
            writer.append(&record(0, true)).expect("first record should append");
            writer.append(&record(1, false)).expect("second record should append");
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("record file should reopen");
        file.write_all(b"2=tr").expect("torn tail should write");

        let replay = read_records(&path).expect("replay should work");
        assert_eq!(replay.records, vec![record(0, true), record(1, false)]);
        assert_eq!(replay.malformed_lines, 1);
    }

    #[test]
    fn resume_index_points_past_last_record_in_range() {
        let replay = RecordReplay {
            records: vec![record(3, true), record(4, false)],
            malformed_lines: 0,
        };
        assert_eq!(replay.resume_index(IndexRange::new(3, 8)), Some(5));
        assert_eq!(replay.resume_index(IndexRange::new(3, 5)), None);
        assert_eq!(replay.resume_index(IndexRange::new(6, 9)), Some(6));
        assert_eq!(RecordReplay::default().resume_index(IndexRange::new(2, 4)), Some(2));
    }

    #[test]
    fn missing_stream_is_an_io_error() {
        let tmp = tempdir().expect("tempdir should be created");
        let err = read_records(&tmp.path().join("missing.out")).expect_err("should fail");
        assert!(matches!(err, RecordError::Io(_)));
    }
}
