//! On-disk persistence of a running reconstruction.
//!
//! Layout of the save directory:
//!
//! ```text
//! ff_save/
//!   anchor_points                n space-separated field values
//!   shift                        n space-separated field values
//!   scan                         marker: shift scan completed
//!   validation.gz                line 1: probe point; lines 2..: outputs
//!   var_order.gz                 n lines: "old_index new_index"
//!   factors/<fun_idx>.gz         factor expression string
//!   states/<fun_idx>_<prime>.gz  serialized per-function state
//!   probes/<fun_idx>_<prime>.gz  probe log: "(zi_order) | t | value"
//!   tmp/                         scratch area for atomic moves
//! ```
//!
//! Files are gzip-compressed text. Writes go through `tmp/` and an atomic
//! rename so a crash never leaves a truncated state behind.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{FireFlyError, Result};
use crate::field::FFInt;

pub const SAVE_DIR: &str = "ff_save";

/// Create the save directory skeleton.
pub fn init_save_dir(base: &Path) -> Result<()> {
    fs::create_dir_all(base.join("states"))?;
    fs::create_dir_all(base.join("probes"))?;
    fs::create_dir_all(base.join("factors"))?;
    fs::create_dir_all(base.join("tmp"))?;
    Ok(())
}

/// Write gzip-compressed text through the scratch area and an atomic rename.
pub fn write_gz(base: &Path, rel: &str, content: &str) -> Result<()> {
    let tmp = base.join("tmp").join(rel.replace('/', "_"));
    if let Some(parent) = tmp.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = fs::File::create(&tmp)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(content.as_bytes())?;
    encoder.finish()?;

    let target = base.join(rel);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(&tmp, &target)?;
    Ok(())
}

/// Read gzip-compressed text; concatenated members from appends are
/// decoded as one stream.
pub fn read_gz(path: &Path) -> Result<String> {
    let file = fs::File::open(path)?;
    let mut decoder = MultiGzDecoder::new(file);
    let mut content = String::new();
    decoder.read_to_string(&mut content)?;
    Ok(content)
}

/// Append a batch of lines to a probe log as an additional gzip member.
pub fn append_gz(path: &Path, content: &str) -> Result<()> {
    let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(content.as_bytes())?;
    encoder.finish()?;
    Ok(())
}

/// Write a plain text file (anchor points, shift, scan marker).
pub fn write_plain(base: &Path, rel: &str, content: &str) -> Result<()> {
    fs::write(base.join(rel), content)?;
    Ok(())
}

pub fn read_plain(path: &Path) -> Result<String> {
    Ok(fs::read_to_string(path)?)
}

/// Parse a line of space-separated field values.
pub fn parse_ff_line(line: &str, expected: usize) -> Result<Vec<FFInt>> {
    let values: std::result::Result<Vec<u64>, _> =
        line.split_whitespace().map(|s| s.parse::<u64>()).collect();
    let values =
        values.map_err(|e| FireFlyError::Resume(format!("malformed field value: {e}")))?;

    if values.len() != expected {
        return Err(FireFlyError::Resume(format!(
            "expected {expected} field values, found {}",
            values.len()
        )));
    }

    // Values may stem from a larger prime field than the active one.
    Ok(values.into_iter().map(FFInt::new).collect())
}

/// Render a vector of field values as one line.
pub fn format_ff_line(values: &[FFInt]) -> String {
    let mut line = String::new();
    for v in values {
        line.push_str(&v.n.to_string());
        line.push(' ');
    }
    line.push('\n');
    line
}

/// One probe-log line: `(o1 o2 ...) | t | value`.
pub fn format_probe_line(zi_order: &[u32], t: FFInt, value: FFInt) -> String {
    let order = zi_order
        .iter()
        .map(|o| o.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    format!("({order}) | {} | {}\n", t.n, value.n)
}

/// Parse a probe log into (zi_order, t, value) triples.
pub fn parse_probe_log(content: &str) -> Result<Vec<(Vec<u32>, FFInt, FFInt)>> {
    let mut probes = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.split('|');
        let order_part = parts
            .next()
            .ok_or_else(|| FireFlyError::Resume(format!("malformed probe line: {line}")))?;
        let t_part = parts
            .next()
            .ok_or_else(|| FireFlyError::Resume(format!("malformed probe line: {line}")))?;
        let value_part = parts
            .next()
            .ok_or_else(|| FireFlyError::Resume(format!("malformed probe line: {line}")))?;

        let order_str = order_part
            .trim()
            .trim_start_matches('(')
            .trim_end_matches(')');
        let zi_order: std::result::Result<Vec<u32>, _> = order_str
            .split_whitespace()
            .map(|s| s.parse::<u32>())
            .collect();
        let zi_order = zi_order
            .map_err(|e| FireFlyError::Resume(format!("malformed zi order: {e}")))?;

        let t: u64 = t_part
            .trim()
            .parse()
            .map_err(|e| FireFlyError::Resume(format!("malformed probe t: {e}")))?;
        let value: u64 = value_part
            .trim()
            .parse()
            .map_err(|e| FireFlyError::Resume(format!("malformed probe value: {e}")))?;

        probes.push((zi_order, FFInt::from_reduced(t), FFInt::from_reduced(value)));
    }

    Ok(probes)
}

/// Locate the state files under `states/`, one per function, and return
/// them sorted by function index together with the stored prime counter.
pub fn list_state_files(base: &Path) -> Result<Vec<(usize, usize, PathBuf)>> {
    let mut files = Vec::new();
    let dir = base.join("states");

    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let stem = name.trim_end_matches(".gz");

        let mut parts = stem.split('_');
        let index: usize = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| FireFlyError::Resume(format!("unexpected state file: {name}")))?;
        let prime: usize = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| FireFlyError::Resume(format!("unexpected state file: {name}")))?;

        files.push((index, prime, entry.path()));
    }

    files.sort_by_key(|(index, ..)| *index);
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn setup() {
        FFInt::set_new_prime(crate::primes::primes()[0]);
    }

    #[test]
    #[serial]
    fn test_gz_roundtrip() {
        setup();
        let dir = std::env::temp_dir().join("firefly_gz_test");
        let _ = fs::remove_dir_all(&dir);
        init_save_dir(&dir).unwrap();

        write_gz(&dir, "states/0_1.gz", "hello\nworld\n").unwrap();
        let content = read_gz(&dir.join("states/0_1.gz")).unwrap();
        assert_eq!(content, "hello\nworld\n");

        let files = list_state_files(&dir).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, 0);
        assert_eq!(files[0].1, 1);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    #[serial]
    fn test_append_members() {
        setup();
        let dir = std::env::temp_dir().join("firefly_append_test");
        let _ = fs::remove_dir_all(&dir);
        init_save_dir(&dir).unwrap();

        let path = dir.join("probes/0_0.gz");
        append_gz(&path, "(1 1) | 5 | 17\n").unwrap();
        append_gz(&path, "(2 2) | 7 | 23\n").unwrap();

        let probes = parse_probe_log(&read_gz(&path).unwrap()).unwrap();
        assert_eq!(probes.len(), 2);
        assert_eq!(probes[0].0, vec![1, 1]);
        assert_eq!(probes[0].1.n, 5);
        assert_eq!(probes[1].2.n, 23);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    #[serial]
    fn test_probe_line_roundtrip() {
        setup();
        let line = format_probe_line(&[3, 1], FFInt::from_reduced(99), FFInt::from_reduced(123));
        let probes = parse_probe_log(&line).unwrap();
        assert_eq!(probes, vec![(vec![3, 1], FFInt::from_reduced(99), FFInt::from_reduced(123))]);
    }

    #[test]
    #[serial]
    fn test_ff_line_roundtrip() {
        setup();
        let values = vec![FFInt::new(1), FFInt::new(2), FFInt::new(3)];
        let line = format_ff_line(&values);
        let parsed = parse_ff_line(line.trim(), 3).unwrap();
        assert_eq!(parsed, values);
    }
}
