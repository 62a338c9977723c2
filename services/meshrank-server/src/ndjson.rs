//! Generic NDJSON tail reader: scoped acquisition of a read stream from a
//! byte offset to current EOF, yielding decoded lines, with the stream
//! guaranteed to close on every exit path. The next tick starts from the
//! previous EOF.
//!
//! If the file shrinks below the last-known offset (truncation, rotation),
//! the cursor resets to 0 and the file is re-read from the start.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use serde::de::DeserializeOwned;

/// Caps the amount of unread backlog a single tick will read in one shot,
/// mirroring the 2 MiB observer-hits reset window (§4.2). Generalised here
/// so other tailers can opt into the same guard.
pub const MAX_BACKLOG_BYTES: u64 = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TailCursor {
    pub offset: u64,
}

pub struct TailTick {
    pub lines: Vec<String>,
    pub next_cursor: TailCursor,
    pub reset: bool,
}

/// Read every complete line appended to `path` since `cursor`. A trailing
/// partial line (no final `\n` yet) is left unread; the next tick picks it
/// up once it's complete.
pub fn tail(path: &Path, cursor: TailCursor) -> std::io::Result<TailTick> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    let (start_offset, reset) = if cursor.offset > len {
        (0, true)
    } else if len - cursor.offset > MAX_BACKLOG_BYTES {
        (len - MAX_BACKLOG_BYTES, true)
    } else {
        (cursor.offset, false)
    };

    file.seek(SeekFrom::Start(start_offset))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut lines = Vec::new();
    let mut consumed = 0u64;
    let mut reader = BufReader::new(buf.as_slice());
    loop {
        let mut line = String::new();
        let n = read_line_lossy(&mut reader, &mut line)?;
        if n == 0 {
            break;
        }
        if !line.ends_with('\n') {
            // Partial trailing line: do not advance past it.
            break;
        }
        consumed += n as u64;
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if reset && consumed <= partial_first_line_skip(&buf) {
            // When we reset into the middle of the file, the first "line"
            // read may be a truncated fragment of a prior line. Drop it.
            continue;
        }
        if !trimmed.is_empty() {
            lines.push(trimmed.to_owned());
        }
    }

    Ok(TailTick {
        lines,
        next_cursor: TailCursor {
            offset: start_offset + consumed,
        },
        reset,
    })
}

fn read_line_lossy(reader: &mut impl BufRead, out: &mut String) -> std::io::Result<usize> {
    let mut raw = Vec::new();
    let n = reader.read_until(b'\n', &mut raw)?;
    out.push_str(&String::from_utf8_lossy(&raw));
    Ok(n)
}

/// When we jumped into the middle of a file on reset, the very first
/// fragment up to the first newline is a dropped partial line, not real
/// data.
fn partial_first_line_skip(buf: &[u8]) -> u64 {
    match buf.iter().position(|&b| b == b'\n') {
        Some(idx) => (idx + 1) as u64,
        None => 0,
    }
}

/// Parse each line as JSON, skipping (and logging) any that fail to decode.
/// Malformed lines never abort the tick.
pub fn parse_lines<T: DeserializeOwned>(lines: &[String]) -> Vec<T> {
    lines
        .iter()
        .filter_map(|line| match serde_json::from_str::<T>(line) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(error = %e, "skipping malformed ndjson line");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn tails_new_lines_since_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.ndjson");
        std::fs::write(&path, "{\"a\":1}\n{\"a\":2}\n").unwrap();
        let tick = tail(&path, TailCursor::default()).unwrap();
        assert_eq!(tick.lines, vec!["{\"a\":1}", "{\"a\":2}"]);
        assert!(!tick.reset);

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{{\"a\":3}}").unwrap();
        let tick2 = tail(&path, tick.next_cursor).unwrap();
        assert_eq!(tick2.lines, vec!["{\"a\":3}"]);
    }

    #[test]
    fn partial_trailing_line_is_not_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.ndjson");
        std::fs::write(&path, "{\"a\":1}\n{\"a\":2}").unwrap();
        let tick = tail(&path, TailCursor::default()).unwrap();
        assert_eq!(tick.lines, vec!["{\"a\":1}"]);
        assert!(tick.next_cursor.offset < 15);
    }

    #[test]
    fn truncated_file_resets_cursor_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.ndjson");
        std::fs::write(&path, "{\"a\":1}\n").unwrap();
        let bogus_cursor = TailCursor { offset: 9_999 };
        let tick = tail(&path, bogus_cursor).unwrap();
        assert!(tick.reset);
        assert_eq!(tick.lines, vec!["{\"a\":1}"]);
    }

    #[test]
    fn malformed_json_lines_are_skipped_not_fatal() {
        let lines = vec!["{\"a\":1}".to_owned(), "not json".to_owned(), "{\"a\":2}".to_owned()];
        #[derive(serde::Deserialize)]
        struct Row {
            #[allow(dead_code)]
            a: i32,
        }
        let parsed: Vec<Row> = parse_lines(&lines);
        assert_eq!(parsed.len(), 2);
    }
}
