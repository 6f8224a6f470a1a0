//! Metadata change log.
//!
//! Append-only textual journal, one mutating operation per line:
//! `version: ts|OP(arg,...)[:ret]`. The line text (without the version
//! prefix) is also the metalogger stream format, so it is preserved
//! byte-for-byte. The current file is `changelog.0.mfs`; rotation shifts
//! every kept file one slot up and happens at the top of the hour or on
//! demand (after an image dump).

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::Result;
use chrono::Timelike;
use log::{debug, warn};

pub const CHANGELOG_KEEP_FILES: u32 = 50;

/// Escape a name or path for a changelog line. Reserved characters and
/// non-printables become `%HH` (upper-case hex).
pub fn escape_name(name: &[u8]) -> String {
    let mut out = String::with_capacity(name.len());
    for &c in name {
        if c <= 32 || c >= 127 || matches!(c, b',' | b'%' | b'(' | b')' | b'|' | b':') {
            out.push('%');
            out.push(char::from_digit((c >> 4) as u32, 16).unwrap().to_ascii_uppercase());
            out.push(char::from_digit((c & 0xF) as u32, 16).unwrap().to_ascii_uppercase());
        } else {
            out.push(c as char);
        }
    }
    out
}

pub struct Changelog {
    dir: Option<PathBuf>,
    file: Option<BufWriter<File>>,
    meta_version: u64,
    last_rotation_hour: u32,
    /// In-memory copy of lines appended since creation; only kept when the
    /// journal runs without a backing directory (tests, dry runs).
    recorded: Vec<String>,
}

impl Changelog {
    /// Journal writing to `dir/changelog.0.mfs`.
    pub fn open(dir: PathBuf) -> Result<Changelog> {
        let path = dir.join("changelog.0.mfs");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("changelog opened: {}", path.display());
        Ok(Changelog {
            dir: Some(dir),
            file: Some(BufWriter::new(file)),
            meta_version: 1,
            last_rotation_hour: chrono::Local::now().hour(),
            recorded: Vec::new(),
        })
    }

    /// Journal counting versions in memory only.
    pub fn memory() -> Changelog {
        Changelog {
            dir: None,
            file: None,
            meta_version: 1,
            last_rotation_hour: 0,
            recorded: Vec::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.meta_version
    }

    pub fn set_version(&mut self, v: u64) {
        self.meta_version = v;
    }

    /// Version bump without a journal line; used during replay where the
    /// line already exists in the log being read.
    pub fn version_inc(&mut self) {
        self.meta_version += 1;
    }

    /// Append one operation line (`ts|OP(...)` without version prefix) and
    /// advance the meta version by exactly one. The line is durable before
    /// the caller writes its reply.
    pub fn append(&mut self, line: &str) {
        if let Some(f) = &mut self.file {
            if writeln!(f, "{}: {}", self.meta_version, line).and_then(|_| f.flush()).is_err() {
                warn!("changelog write failed at version {}", self.meta_version);
            }
        } else {
            self.recorded.push(format!("{}: {}", self.meta_version, line));
        }
        self.meta_version += 1;
    }

    /// Lines recorded by a memory journal.
    pub fn recorded(&self) -> &[String] {
        &self.recorded
    }

    /// Rotate at the top of the hour.
    pub fn maybe_rotate_hourly(&mut self) -> Result<()> {
        let hour = chrono::Local::now().hour();
        if hour != self.last_rotation_hour {
            self.last_rotation_hour = hour;
            self.rotate()?;
        }
        Ok(())
    }

    /// Shift `changelog.N.mfs` to `changelog.N+1.mfs` for every kept file
    /// and start a fresh `changelog.0.mfs`.
    pub fn rotate(&mut self) -> Result<()> {
        let dir = match &self.dir {
            Some(d) => d.clone(),
            None => return Ok(()),
        };
        if let Some(f) = &mut self.file {
            f.flush()?;
        }
        self.file = None;
        let mut n = CHANGELOG_KEEP_FILES;
        let old = dir.join(format!("changelog.{}.mfs", n));
        if old.exists() {
            std::fs::remove_file(&old)?;
        }
        while n > 0 {
            let from = dir.join(format!("changelog.{}.mfs", n - 1));
            let to = dir.join(format!("changelog.{}.mfs", n));
            if from.exists() {
                std::fs::rename(&from, &to)?;
            }
            n -= 1;
        }
        let path = dir.join("changelog.0.mfs");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.file = Some(BufWriter::new(file));
        debug!("changelog rotated");
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(f) = &mut self.file {
            f.flush()?;
        }
        Ok(())
    }
}
