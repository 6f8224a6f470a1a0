//! Offline chunk scan / repair.
//!
//! Walks a chunk-server data tree, validates every chunk file (name, header,
//! CRC table) and optionally repairs headers and checksums or quarantines
//! damaged chunks into a separate directory. Runs only against a stopped
//! chunk server: every scanned directory is guarded by a non-blocking
//! `.lock` acquisition.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use log::debug;
use nix::fcntl::{flock, FlockArg};

use crate::{
    chunk_filename, parse_chunk_filename, ChunkHeader, CHUNK_CRC_SIZE, CHUNK_FILENAME_LENG,
    CHUNK_HDR_MAGIC, MFS_BLOCKS_IN_CHUNK, MFS_BLOCK_MASK, MFS_BLOCK_SIZE,
};

pub const MODE_FAST: u8 = 1;
pub const MODE_EMPTY: u8 = 2;
pub const MODE_NAME: u8 = 4;
pub const MODE_REPAIR: u8 = 8;

/// Scan result bits. Anything non-zero means the chunk needed attention;
/// the two `FIXED` bits mean it no longer does.
pub const STATUS_CHUNK_ERROR: u8 = 1;
pub const STATUS_CRC_ERROR: u8 = 2;
pub const STATUS_HEADER_FIXED: u8 = 4;
pub const STATUS_CRC_FIXED: u8 = 8;
pub const STATUS_FATAL: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathType {
    MfsDir,
    Chunk,
    Any,
    AnyDir,
    First,
}

/// Progress line state for TTY output. Keeps track of how many characters
/// the current status line occupies so it can be erased before any real
/// message is printed.
struct Progress {
    lasttime: Instant,
    nlneeded: usize,
    is_tty: bool,
}

impl Progress {
    fn new() -> Progress {
        Progress {
            lasttime: Instant::now(),
            nlneeded: 0,
            is_tty: unsafe { libc::isatty(libc::STDOUT_FILENO) } == 1,
        }
    }

    fn timer_expired(&mut self) -> bool {
        if self.lasttime.elapsed().as_secs() >= 1 {
            self.lasttime = Instant::now();
            return true;
        }
        false
    }

    /// Erase the pending progress line (ANSI erase plus space fallback).
    fn check_nl(&mut self) {
        if self.nlneeded > 0 {
            print!("\x1b[2K\r");
            while self.nlneeded > 0 {
                print!(" ");
                self.nlneeded -= 1;
            }
            print!("\r");
        }
    }

    fn show(&mut self, scanned: u64, path: &Path) {
        if !self.is_tty {
            return;
        }
        self.check_nl();
        let line = format!("\robjects scanned: {} (path: {}) ... ", scanned, path.display());
        print!("{}", line);
        self.nlneeded = line.len() + 8;
        let _ = std::io::stdout().flush();
    }
}

pub struct Scanner {
    mode: u8,
    showok: bool,
    damaged_dir: Option<PathBuf>,
    scanned: u64,
    progress: Progress,
    buf: Vec<u8>,
}

impl Scanner {
    pub fn new(mode: u8, showok: bool, damaged_dir: Option<PathBuf>) -> Scanner {
        Scanner {
            mode,
            showok,
            damaged_dir,
            scanned: 0,
            progress: Progress::new(),
            buf: vec![0u8; MFS_BLOCK_SIZE],
        }
    }

    pub fn scanned(&self) -> u64 {
        self.scanned
    }

    /// Scan one path given on the command line.
    pub fn scan(&mut self, path: &Path) -> u8 {
        let path = match path.canonicalize() {
            Ok(p) => p,
            Err(_) => {
                self.progress.check_nl();
                println!("{}: realpath error", path.display());
                return STATUS_CHUNK_ERROR;
            }
        };
        self.scan_entry(&path, PathType::First)
    }

    /// Erase the last progress line; call once after the final `scan`.
    pub fn finish(&mut self) {
        self.progress.check_nl();
    }

    fn scan_entry(&mut self, path: &Path, pathtype: PathType) -> u8 {
        if !self.showok && self.progress.timer_expired() {
            self.progress.show(self.scanned, path);
        }
        if let Some(dmg) = &self.damaged_dir {
            if path.starts_with(dmg) {
                // never scan the quarantine itself
                return 0;
            }
        }
        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(_) => {
                self.progress.check_nl();
                println!("{}: can't stat path", path.display());
                return STATUS_CHUNK_ERROR;
            }
        };
        if meta.is_dir() {
            match pathtype {
                PathType::MfsDir | PathType::Any | PathType::AnyDir | PathType::First => {
                    self.scan_dir(path, pathtype)
                }
                PathType::Chunk => self.wrong_path(path),
            }
        } else if meta.is_file() {
            match pathtype {
                PathType::Chunk | PathType::Any | PathType::First => self.scan_file(path),
                _ => self.wrong_path(path),
            }
        } else {
            self.wrong_path(path)
        }
    }

    fn wrong_path(&mut self, path: &Path) -> u8 {
        self.progress.check_nl();
        if self.mode & MODE_NAME != 0 {
            println!("{}: not a directory nor a file", path.display());
        } else {
            println!("{}: not a correct chunk-server path", path.display());
        }
        STATUS_CHUNK_ERROR
    }

    fn scan_dir(&mut self, path: &Path, pathtype: PathType) -> u8 {
        // refuse to touch a disk that a running chunk server owns
        let lockpath = path.join(".lock");
        let lockfile = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&lockpath)
            .ok();
        if let Some(lf) = &lockfile {
            if flock(lf.as_raw_fd(), FlockArg::LockExclusiveNonblock).is_err() {
                self.progress.check_nl();
                println!(
                    "found active lock file: {} - there is a working chunkserver using this disk - skip scanning",
                    lockpath.display()
                );
                return STATUS_CHUNK_ERROR;
            }
        }
        let rd = match std::fs::read_dir(path) {
            Ok(rd) => rd,
            Err(_) => {
                self.progress.check_nl();
                println!("{}: can't open directory", path.display());
                return STATUS_CHUNK_ERROR;
            }
        };
        let mut ret = 0;
        for de in rd.flatten() {
            let fname = de.file_name();
            let name = fname.to_string_lossy();
            if name == "." || name == ".." || name == ".lock" || name == ".metaid" || name == ".chunkdb" {
                continue;
            }
            let goodname = if self.mode & MODE_NAME != 0 {
                Some(PathType::Any)
            } else if name.len() == 2
                && name.bytes().all(|c| c.is_ascii_hexdigit())
                && (pathtype == PathType::AnyDir || pathtype == PathType::First)
            {
                Some(PathType::MfsDir)
            } else if name.len() == CHUNK_FILENAME_LENG
                && parse_chunk_filename(&name).is_some()
                && (pathtype == PathType::MfsDir || pathtype == PathType::First)
            {
                Some(PathType::Chunk)
            } else if pathtype == PathType::AnyDir || pathtype == PathType::First {
                Some(PathType::AnyDir)
            } else {
                None
            };
            if let Some(gt) = goodname {
                if name.len() > 255 {
                    self.progress.check_nl();
                    println!("{}/{}: name too long", path.display(), name);
                    ret |= STATUS_CHUNK_ERROR;
                } else {
                    ret |= self.scan_entry(&de.path(), gt);
                }
            }
        }
        drop(lockfile);
        ret
    }

    fn scan_file(&mut self, path: &Path) -> u8 {
        let (ret, newname) = self.chunk_repair(path);
        self.scanned += 1;
        if ret != 0 {
            if let (Some(dmg), Some(newname)) = (&self.damaged_dir, &newname) {
                let fname = match newname.file_name() {
                    Some(f) if f.len() == CHUNK_FILENAME_LENG => f,
                    _ => {
                        self.progress.check_nl();
                        println!("{}: wrong chunk file name", newname.display());
                        return ret;
                    }
                };
                let dest = dmg.join(fname);
                if let Err(e) = std::fs::rename(newname, &dest) {
                    if e.raw_os_error() == Some(libc::EXDEV) {
                        if let Err(e) = self.move_file(newname, &dest) {
                            self.progress.check_nl();
                            println!("{} -> {}: {}", newname.display(), dest.display(), e);
                        }
                    } else {
                        self.progress.check_nl();
                        println!("{} -> {}: rename error !!!", newname.display(), dest.display());
                    }
                }
            }
        }
        ret
    }

    /// Copy-then-delete fallback for a quarantine move across filesystems.
    fn move_file(&mut self, oldname: &Path, newname: &Path) -> Result<()> {
        debug!("cross-device move {} -> {}", oldname.display(), newname.display());
        let mut src = File::open(oldname)?;
        let mut dst = OpenOptions::new().write(true).create_new(true).open(newname)?;
        loop {
            let n = src.read(&mut self.buf)?;
            if n == 0 {
                break;
            }
            if let Err(e) = dst.write_all(&self.buf[..n]) {
                drop(dst);
                let _ = std::fs::remove_file(newname);
                return Err(e.into());
            }
        }
        dst.sync_all()?;
        drop(dst);
        std::fs::remove_file(oldname)?;
        Ok(())
    }

    fn fatal(&mut self, ret: u8, path: &Path, msg: &str) -> (u8, Option<PathBuf>) {
        self.progress.check_nl();
        println!("{}: {}", path.display(), msg);
        (ret | STATUS_FATAL, None)
    }

    /// Validate one chunk file; repair it in place when `MODE_REPAIR` /
    /// `MODE_NAME` ask for it. Returns the status bits and the path the
    /// chunk ended up under (used for quarantining; `None` once a file has
    /// been fixed - fixed files are never moved).
    pub fn chunk_repair(&mut self, fname: &Path) -> (u8, Option<PathBuf>) {
        let mut mode = self.mode;
        let mut ret: u8 = 0;

        let mut fd = match if mode & MODE_REPAIR != 0 {
            OpenOptions::new().read(true).write(true).open(fname)
        } else {
            File::open(fname)
        } {
            Ok(f) => f,
            Err(_) => {
                self.progress.check_nl();
                println!("{}: error opening file !!!", fname.display());
                return (ret | STATUS_FATAL, None);
            }
        };

        let named = fname
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .and_then(|n| parse_chunk_filename(&n).map(|iv| (n, iv)));

        let mut newname: Option<PathBuf>;
        let mut hdrbuf = [0u8; 20];

        match named {
            None => {
                if mode & MODE_NAME != 0 {
                    self.progress.check_nl();
                    println!(
                        "{}: wrong chunk name - try to fix it using header data",
                        fname.display()
                    );
                    if fd.read_exact(&mut hdrbuf).is_err() {
                        println!("{}: error reading header !!!", fname.display());
                        return (ret | STATUS_FATAL, None);
                    }
                    let hdr = match ChunkHeader::parse(&hdrbuf) {
                        Some(h) => h,
                        None => {
                            println!("{}: wrong chunk header !!!", fname.display());
                            return (ret | STATUS_FATAL, None);
                        }
                    };
                    if hdr.variant == b'1' {
                        mode |= MODE_EMPTY;
                    }
                    let fixed = fname
                        .parent()
                        .map(|p| p.to_path_buf())
                        .unwrap_or_default()
                        .join(chunk_filename(hdr.chunkid, hdr.version));
                    if std::fs::rename(fname, &fixed).is_err() {
                        println!("{}->{}: rename error !!!", fname.display(), fixed.display());
                        return (ret | STATUS_FATAL, None);
                    }
                    println!("{}: changed name to: {}", fname.display(), fixed.display());
                    newname = Some(fixed);
                } else {
                    self.progress.check_nl();
                    println!("{}: wrong chunk name format !!! (skip header)", fname.display());
                    ret |= STATUS_CHUNK_ERROR;
                    newname = None;
                }
            }
            Some((_, (namechunkid, nameversion))) => {
                newname = Some(fname.to_path_buf());
                if fd.read_exact(&mut hdrbuf).is_err() {
                    self.progress.check_nl();
                    println!("{}: error reading header !!!", fname.display());
                    return (ret | STATUS_FATAL, None);
                }
                if &hdrbuf[0..7] != CHUNK_HDR_MAGIC || (hdrbuf[7] != b'0' && hdrbuf[7] != b'1') {
                    self.progress.check_nl();
                    println!("{}: wrong chunk header !!!", fname.display());
                    hdrbuf[0..7].copy_from_slice(CHUNK_HDR_MAGIC);
                    hdrbuf[7] = b'0';
                    ret |= STATUS_CHUNK_ERROR;
                }
                if hdrbuf[7] == b'1' {
                    mode |= MODE_EMPTY;
                }
                if u64::from_be_bytes(hdrbuf[8..16].try_into().unwrap()) != namechunkid {
                    self.progress.check_nl();
                    println!("{}: wrong chunk number in header !!!", fname.display());
                    hdrbuf[8..16].copy_from_slice(&namechunkid.to_be_bytes());
                    ret |= STATUS_CHUNK_ERROR;
                }
                if u32::from_be_bytes(hdrbuf[16..20].try_into().unwrap()) != nameversion {
                    self.progress.check_nl();
                    println!("{}: wrong chunk version in header !!!", fname.display());
                    hdrbuf[16..20].copy_from_slice(&nameversion.to_be_bytes());
                    ret |= STATUS_CHUNK_ERROR;
                }
                if mode & MODE_REPAIR != 0 && ret & STATUS_CHUNK_ERROR != 0 {
                    if fd.seek(SeekFrom::Start(0)).is_err() || fd.write_all(&hdrbuf).is_err() {
                        return self.fatal(ret, fname, "error writing header !!!");
                    }
                    ret |= STATUS_HEADER_FIXED;
                }
            }
        }

        let fsize = match fd.seek(SeekFrom::End(0)) {
            Ok(s) => s,
            Err(_) => return self.fatal(ret, fname, "error setting file pointer"),
        };
        if fsize < CHUNK_CRC_SIZE as u64 {
            return self.fatal(ret, fname, "wrong file size");
        }
        let hdrsize = (fsize - CHUNK_CRC_SIZE as u64) & MFS_BLOCK_MASK;
        if hdrsize != 1024 && hdrsize != 4096 {
            return self.fatal(ret, fname, "wrong file size");
        }

        // read the crc table
        if fd.seek(SeekFrom::Start(hdrsize)).is_err() {
            return self.fatal(ret, fname, "error setting file pointer");
        }
        let mut crcbuf = [0u8; CHUNK_CRC_SIZE];
        if fd.read_exact(&mut crcbuf).is_err() {
            return self.fatal(ret, fname, "error reading checksum block");
        }
        let mut crc = [0u32; MFS_BLOCKS_IN_CHUNK];
        for (i, c) in crc.iter_mut().enumerate() {
            *c = u32::from_be_bytes(crcbuf[i * 4..i * 4 + 4].try_into().unwrap());
        }

        let datastart = hdrsize + CHUNK_CRC_SIZE as u64;
        if mode & (MODE_FAST | MODE_REPAIR) == MODE_FAST {
            // fast check: only the last present data block
            let lastidx: i64;
            if fsize < MFS_BLOCK_SIZE as u64 {
                // chunk with no data blocks
                lastidx = -1;
            } else {
                let pos = fsize - MFS_BLOCK_SIZE as u64;
                if pos < datastart || (pos - datastart) % MFS_BLOCK_SIZE as u64 != 0 {
                    return self.fatal(ret, fname, "wrong file size");
                }
                lastidx = ((pos - datastart) >> 16) as i64;
                if fd.seek(SeekFrom::Start(pos)).is_err() {
                    return self.fatal(ret, fname, "error setting file pointer");
                }
                if fd.read_exact(&mut self.buf).is_err() {
                    return self.fatal(ret, fname, "error reading last data block");
                }
                let crcblock = crc_engine::crc32(0, &self.buf);
                if crc[lastidx as usize] != crcblock {
                    self.progress.check_nl();
                    println!(
                        "{}: crc error (last block ; header crc: {:08X} ; block crc: {:08X})",
                        fname.display(),
                        crc[lastidx as usize],
                        crcblock
                    );
                    ret |= STATUS_CRC_ERROR;
                }
            }
            if mode & MODE_EMPTY != 0 && lastidx < (MFS_BLOCKS_IN_CHUNK - 1) as i64 {
                let nextidx = (lastidx + 1) as usize;
                let zerocrc = crc_engine::crc32_zeroblock(0, MFS_BLOCK_SIZE as u32);
                if crc[nextidx] != zerocrc && crc[nextidx] != 0 {
                    self.progress.check_nl();
                    println!(
                        "{}: crc error (first empty block ({}) has 'non zero' crc: {:08X})",
                        fname.display(),
                        nextidx,
                        crc[nextidx]
                    );
                    ret |= STATUS_CRC_ERROR;
                }
            }
        } else {
            // full check: every block, with absent trailing blocks expected
            // to carry the zero-block crc (1.1) or anything (1.0)
            if fd.seek(SeekFrom::Start(datastart)).is_err() {
                return self.fatal(ret, fname, "error setting file pointer");
            }
            let zerocrc = crc_engine::crc32_zeroblock(0, MFS_BLOCK_SIZE as u32);
            for i in 0..MFS_BLOCKS_IN_CHUNK {
                let n = match read_block(&mut fd, &mut self.buf) {
                    Ok(n) => n,
                    Err(_) => {
                        return self.fatal(ret, fname, &format!("error reading data block: {}", i))
                    }
                };
                let crcblock;
                if n == 0 {
                    crcblock = zerocrc;
                    if mode & MODE_EMPTY == 0 || crc[i] == 0 {
                        crc[i] = crcblock;
                    }
                } else if n != MFS_BLOCK_SIZE {
                    return self.fatal(ret, fname, &format!("error reading data block: {}", i));
                } else {
                    crcblock = crc_engine::crc32(0, &self.buf);
                }
                if crc[i] != crcblock {
                    self.progress.check_nl();
                    println!(
                        "{}: crc error (block: {} ; header crc: {:08X} ; block crc: {:08X})",
                        fname.display(),
                        i,
                        crc[i],
                        crcblock
                    );
                    crc[i] = crcblock;
                    ret |= STATUS_CRC_ERROR;
                }
            }
            if mode & MODE_REPAIR != 0 && ret & STATUS_CRC_ERROR != 0 {
                for (i, c) in crc.iter().enumerate() {
                    crcbuf[i * 4..i * 4 + 4].copy_from_slice(&c.to_be_bytes());
                }
                if fd.seek(SeekFrom::Start(hdrsize)).is_err() {
                    return self.fatal(ret, fname, "error setting file pointer");
                }
                if fd.write_all(&crcbuf).is_err() {
                    return self.fatal(ret, fname, "error writing checksum block");
                }
                ret |= STATUS_CRC_FIXED;
            }
        }
        drop(fd);

        if ret == 0 && self.showok {
            self.progress.check_nl();
            println!("{}: OK", fname.display());
        }
        if ret & STATUS_HEADER_FIXED != 0 {
            self.progress.check_nl();
            println!("{}: header fixed", fname.display());
            newname = None; // do not move fixed files !!!
        }
        if ret & STATUS_CRC_FIXED != 0 {
            self.progress.check_nl();
            println!("{}: crc fixed", fname.display());
            newname = None;
        }
        (ret, newname)
    }
}

// read a full 64 KiB block; short reads at EOF are reported as-is
fn read_block(fd: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = fd.read(&mut buf[pos..])?;
        if n == 0 {
            break;
        }
        pos += n;
    }
    Ok(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn testdir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("chunk_disk_test_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    // write a valid 1.0 chunk with `blocks` data blocks of pattern data
    fn write_chunk(dir: &Path, chunkid: u64, version: u32, blocks: usize) -> Result<PathBuf> {
        let path = dir.join(chunk_filename(chunkid, version));
        let mut f = File::create(&path)?;
        let hdr = ChunkHeader { variant: b'0', chunkid, version };
        let mut head = vec![0u8; 1024];
        head[0..20].copy_from_slice(&hdr.pack());
        f.write_all(&head)?;
        let mut crcbuf = vec![0u8; CHUNK_CRC_SIZE];
        let mut data = Vec::new();
        for b in 0..blocks {
            let block: Vec<u8> = (0..MFS_BLOCK_SIZE).map(|i| (i + b * 7) as u8).collect();
            let crc = crc_engine::crc32(0, &block);
            crcbuf[b * 4..b * 4 + 4].copy_from_slice(&crc.to_be_bytes());
            data.extend_from_slice(&block);
        }
        f.write_all(&crcbuf)?;
        f.write_all(&data)?;
        Ok(path)
    }

    #[test]
    fn clean_chunk_scans_ok() -> Result<()> {
        let dir = testdir("clean");
        let path = write_chunk(&dir, 0x1234, 1, 2)?;
        let mut sc = Scanner::new(0, false, None);
        let (ret, newname) = sc.chunk_repair(&path);
        assert_eq!(ret, 0);
        assert_eq!(newname, Some(path));
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn fast_mode_checks_last_block() -> Result<()> {
        let dir = testdir("fast");
        let path = write_chunk(&dir, 0x77, 3, 3)?;
        // corrupt one byte of the last data block
        let mut f = OpenOptions::new().write(true).open(&path)?;
        f.seek(SeekFrom::End(-1))?;
        f.write_all(&[0xFF])?;
        drop(f);
        let mut sc = Scanner::new(MODE_FAST, false, None);
        let (ret, _) = sc.chunk_repair(&path);
        assert_eq!(ret, STATUS_CRC_ERROR);
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn repair_rewrites_header_from_filename() -> Result<()> {
        let dir = testdir("hdrfix");
        let path = write_chunk(&dir, 0xABCD, 2, 1)?;
        // flip a chunkid byte at header offset 8
        let mut f = OpenOptions::new().write(true).open(&path)?;
        f.seek(SeekFrom::Start(8))?;
        f.write_all(&[0x5A])?;
        drop(f);
        let mut sc = Scanner::new(MODE_REPAIR, false, None);
        let (ret, newname) = sc.chunk_repair(&path);
        assert_eq!(ret & STATUS_HEADER_FIXED, STATUS_HEADER_FIXED);
        assert_eq!(newname, None); // fixed files are not quarantined
        // a subsequent fast check is clean
        let mut sc = Scanner::new(MODE_FAST, false, None);
        let (ret, _) = sc.chunk_repair(&path);
        assert_eq!(ret, 0);
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn repair_rewrites_crc_table() -> Result<()> {
        let dir = testdir("crcfix");
        let path = write_chunk(&dir, 0x99, 1, 2)?;
        // corrupt the stored crc of block 0
        let mut f = OpenOptions::new().write(true).open(&path)?;
        f.seek(SeekFrom::Start(1024))?;
        f.write_all(&[0, 0, 0, 0])?;
        drop(f);
        let mut sc = Scanner::new(MODE_REPAIR, false, None);
        let (ret, _) = sc.chunk_repair(&path);
        assert_eq!(ret & STATUS_CRC_FIXED, STATUS_CRC_FIXED);
        let mut sc = Scanner::new(0, false, None);
        let (ret, _) = sc.chunk_repair(&path);
        assert_eq!(ret, 0);
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn rename_mode_fixes_filename() -> Result<()> {
        let dir = testdir("rename");
        let path = write_chunk(&dir, 0x42, 5, 1)?;
        let bad = dir.join("chunk_garbage.mfs");
        std::fs::rename(&path, &bad)?;
        let mut sc = Scanner::new(MODE_NAME, false, None);
        let (ret, newname) = sc.chunk_repair(&bad);
        assert_eq!(ret, 0);
        assert_eq!(newname, Some(dir.join(chunk_filename(0x42, 5))));
        assert!(newname.unwrap().exists());
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn damaged_chunk_is_quarantined() -> Result<()> {
        let dir = testdir("quarantine");
        let dmg = testdir("quarantine_dmg");
        let path = write_chunk(&dir, 0x55, 1, 1)?;
        let mut f = OpenOptions::new().write(true).open(&path)?;
        f.seek(SeekFrom::Start(1024))?;
        f.write_all(&[1, 2, 3, 4])?;
        drop(f);
        let mut sc = Scanner::new(0, false, Some(dmg.clone()));
        let ret = sc.scan(&dir);
        assert_eq!(ret, STATUS_CRC_ERROR);
        assert!(!path.exists());
        assert!(dmg.join(chunk_filename(0x55, 1)).exists());
        std::fs::remove_dir_all(&dir)?;
        std::fs::remove_dir_all(&dmg)?;
        Ok(())
    }

    #[test]
    fn empty_tolerance_for_old_chunks() -> Result<()> {
        let dir = testdir("empty");
        // chunk with 1 block; stored crc for block 1 (absent) left as zero
        let path = write_chunk(&dir, 0x31, 1, 1)?;
        let mut sc = Scanner::new(MODE_FAST | MODE_EMPTY, false, None);
        let (ret, _) = sc.chunk_repair(&path);
        assert_eq!(ret, 0);
        // a non-zero, non-zeroblock crc on the first absent block is an error
        let mut f = OpenOptions::new().write(true).open(&path)?;
        f.seek(SeekFrom::Start(1024 + 4))?;
        f.write_all(&[0xDE, 0xAD, 0xBE, 0xEF])?;
        drop(f);
        let mut sc = Scanner::new(MODE_FAST | MODE_EMPTY, false, None);
        let (ret, _) = sc.chunk_repair(&path);
        assert_eq!(ret, STATUS_CRC_ERROR);
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
