//! Changelog replay.
//!
//! Reads journal lines (`version: ts|OP(arg,...)[:ret]`) in version order
//! and re-applies each operation through the subsystems' `mr_` entry
//! points. Dispatch hashes the first four opcode bytes and confirms with
//! a prefix compare, accepting the historical spellings (`AQUIRE`,
//! `EMPTYRESERVED`, `INCVERSION`). A gap or mismatch between the expected
//! meta version and the on-disk state fails the restore.

use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{debug, warn};

use crate::rmfs_lib::changelog::Changelog;
use crate::rmfs_lib::patterns::Pattern;
use crate::rmfs_lib::sclass::{SclassSet, StorageClass};
use crate::rmfs_lib::sessions::NewSessionParams;
use crate::rmfs_lib::types::MfsStatus;
use crate::rmfs_lib::Master;

/// 32-bit hash of the first four opcode bytes.
const fn hashcode(b: &[u8; 4]) -> u32 {
    (((b[0] as u32) * 256 + b[1] as u32) * 256 + b[2] as u32) * 256 + b[3] as u32
}

const HC_IDLE: u32 = hashcode(b"IDLE");
const HC_ACCE: u32 = hashcode(b"ACCE");
const HC_ACQU: u32 = hashcode(b"ACQU");
const HC_AQUI: u32 = hashcode(b"AQUI");
const HC_AMTI: u32 = hashcode(b"AMTI");
const HC_ATTR: u32 = hashcode(b"ATTR");
const HC_CREA: u32 = hashcode(b"CREA");
const HC_CHUN: u32 = hashcode(b"CHUN");
const HC_EMPT: u32 = hashcode(b"EMPT");
const HC_FLOC: u32 = hashcode(b"FLOC");
const HC_FREE: u32 = hashcode(b"FREE");
const HC_INCV: u32 = hashcode(b"INCV");
const HC_LENG: u32 = hashcode(b"LENG");
const HC_LINK: u32 = hashcode(b"LINK");
const HC_MOVE: u32 = hashcode(b"MOVE");
const HC_NEXT: u32 = hashcode(b"NEXT");
const HC_PATA: u32 = hashcode(b"PATA");
const HC_PATD: u32 = hashcode(b"PATD");
const HC_POSI: u32 = hashcode(b"POSI");
const HC_PURG: u32 = hashcode(b"PURG");
const HC_QUOT: u32 = hashcode(b"QUOT");
const HC_RELE: u32 = hashcode(b"RELE");
const HC_SCDE: u32 = hashcode(b"SCDE");
const HC_SCDU: u32 = hashcode(b"SCDU");
const HC_SCRE: u32 = hashcode(b"SCRE");
const HC_SCSE: u32 = hashcode(b"SCSE");
const HC_SESA: u32 = hashcode(b"SESA");
const HC_SESC: u32 = hashcode(b"SESC");
const HC_SESD: u32 = hashcode(b"SESD");
const HC_SETA: u32 = hashcode(b"SETA");
const HC_SETE: u32 = hashcode(b"SETE");
const HC_SETP: u32 = hashcode(b"SETP");
const HC_SETS: u32 = hashcode(b"SETS");
const HC_SETT: u32 = hashcode(b"SETT");
const HC_SETV: u32 = hashcode(b"SETV");
const HC_SETX: u32 = hashcode(b"SETX");
const HC_UNDE: u32 = hashcode(b"UNDE");
const HC_UNLI: u32 = hashcode(b"UNLI");
const HC_UNLO: u32 = hashcode(b"UNLO");
const HC_WRIT: u32 = hashcode(b"WRIT");

/// Cursor over one journal line with the shared argument readers.
struct LineParser<'a> {
    s: &'a [u8],
    pos: usize,
}

impl<'a> LineParser<'a> {
    fn new(s: &'a [u8]) -> LineParser<'a> {
        LineParser { s, pos: 0 }
    }

    fn peek(&self) -> u8 {
        *self.s.get(self.pos).unwrap_or(&0)
    }

    fn bump(&mut self) -> u8 {
        let c = self.peek();
        self.pos += 1;
        c
    }

    fn eat(&mut self, c: u8) -> Result<()> {
        if self.peek() != c {
            bail!("'{}' expected, got '{}'", c as char, self.peek() as char);
        }
        self.pos += 1;
        Ok(())
    }

    fn starts_with(&self, prefix: &[u8]) -> bool {
        self.s[self.pos..].starts_with(prefix)
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    fn get_u64(&mut self) -> Result<u64> {
        let start = self.pos;
        while self.peek().is_ascii_digit() {
            self.pos += 1;
        }
        if start == self.pos {
            bail!("number expected");
        }
        Ok(std::str::from_utf8(&self.s[start..self.pos])?.parse()?)
    }

    fn get_u32(&mut self) -> Result<u32> {
        let v = self.get_u64()?;
        Ok(v as u32)
    }

    fn get_u16(&mut self) -> Result<u16> {
        let v = self.get_u64()?;
        if v > u16::MAX as u64 {
            bail!("value too big ({} - 0-65535 expected)", v);
        }
        Ok(v as u16)
    }

    fn get_u8(&mut self) -> Result<u8> {
        let v = self.get_u64()?;
        if v > u8::MAX as u64 {
            bail!("value too big ({} - 0-255 expected)", v);
        }
        Ok(v as u8)
    }

    fn get_x32(&mut self) -> Result<u32> {
        let start = self.pos;
        while self.peek().is_ascii_hexdigit() {
            self.pos += 1;
        }
        if start == self.pos {
            bail!("hex number expected");
        }
        Ok(u32::from_str_radix(std::str::from_utf8(&self.s[start..self.pos])?, 16)?)
    }

    fn get_char(&mut self) -> Result<char> {
        let c = self.bump();
        if c == 0 {
            bail!("unexpected end of line");
        }
        Ok(c as char)
    }

    /// `%HH`-unescaped bytes up to (not consuming) the delimiter.
    fn get_name(&mut self, delim: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let c = self.peek();
            if c == delim {
                return Ok(out);
            }
            match c {
                0 | b'\r' | b'\n' => bail!("'{}' expected", delim as char),
                b'%' => {
                    self.pos += 1;
                    let h1 = hex_digit(self.bump())?;
                    let h2 = hex_digit(self.bump())?;
                    out.push(h1 * 16 + h2);
                }
                _ => {
                    self.pos += 1;
                    out.push(c);
                }
            }
        }
    }
}

fn hex_digit(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => bail!("hex expected"),
    }
}

// the `(#csum,rootinode,...,info` tail shared by SESADD and SESCHANGED
fn parse_session_params(p: &mut LineParser) -> Result<NewSessionParams> {
    let mut sp = NewSessionParams::default();
    if p.peek() == b'#' {
        p.eat(b'#')?;
        sp.exportscsum = p.get_u64()?;
        p.eat(b',')?;
    }
    sp.rootinode = p.get_u32()?;
    p.eat(b',')?;
    sp.sesflags = p.get_u8()?;
    p.eat(b',')?;
    if p.peek() == b'0' && !p.starts_with(b"0,") {
        // four-character octal umask
        p.skip(1);
        let mut umask = 0u16;
        for _ in 0..3 {
            let c = p.bump();
            if !(b'0'..=b'7').contains(&c) {
                bail!("octal umask expected");
            }
            umask = umask * 8 + (c - b'0') as u16;
        }
        sp.umaskval = umask;
        p.eat(b',')?;
    } else {
        sp.umaskval = p.get_u16()?;
        p.eat(b',')?;
    }
    sp.rootuid = p.get_u32()?;
    p.eat(b',')?;
    sp.rootgid = p.get_u32()?;
    p.eat(b',')?;
    sp.mapalluid = p.get_u32()?;
    p.eat(b',')?;
    sp.mapallgid = p.get_u32()?;
    p.eat(b',')?;
    sp.sclassgroups = p.get_u16()?;
    p.eat(b',')?;
    sp.mintrashretention = p.get_u32()?;
    p.eat(b',')?;
    sp.maxtrashretention = p.get_u32()?;
    p.eat(b',')?;
    if p.starts_with(b"0x") {
        p.skip(2);
        sp.disables = p.get_x32()?;
        p.eat(b',')?;
    }
    sp.peerip = p.get_u32()?;
    p.eat(b',')?;
    sp.info = p.get_name(b')')?;
    Ok(sp)
}

fn parse_sclass_record(p: &mut LineParser, name: Vec<u8>) -> Result<StorageClass> {
    let admin_only = p.get_u8()? != 0;
    p.eat(b',')?;
    let export_group = p.get_u8()?;
    p.eat(b',')?;
    let arch_mode = p.get_u8()?;
    p.eat(b',')?;
    let arch_delay = p.get_u16()?;
    p.eat(b',')?;
    let arch_min_size = p.get_u64()?;
    p.eat(b',')?;
    let min_trashretention = p.get_u16()?;
    p.eat(b',')?;
    let parse_set = |raw: Vec<u8>| -> Result<SclassSet> {
        SclassSet::parse(&raw).map_err(|s| anyhow::anyhow!("bad label expression ({:?})", s))
    };
    let create = parse_set(p.get_name(b',')?)?;
    p.eat(b',')?;
    let keep = parse_set(p.get_name(b',')?)?;
    p.eat(b',')?;
    let arch = parse_set(p.get_name(b',')?)?;
    p.eat(b',')?;
    let trash = parse_set(p.get_name(b')')?)?;
    Ok(StorageClass {
        name,
        admin_only,
        export_group,
        arch_mode,
        arch_delay,
        arch_min_size,
        min_trashretention,
        create,
        keep,
        arch,
        trash,
    })
}

/// Replay one journal line (the `ts|OP(...)` part, version stripped).
pub fn restore_line(m: &mut Master, line: &[u8]) -> Result<MfsStatus> {
    let mut p = LineParser::new(line);
    let ts = p.get_u32()?;
    p.eat(b'|')?;
    if p.s.len() - p.pos < 4 {
        bail!("opcode expected");
    }
    let opb: [u8; 4] = line[p.pos..p.pos + 4].try_into().unwrap();
    let hc = hashcode(&opb);
    let status = match hc {
        HC_IDLE => {
            p.skip(4);
            p.eat(b'(')?;
            p.eat(b')')?;
            MfsStatus::Ok
        }
        HC_ACCE if p.starts_with(b"ACCESS") => {
            p.skip(6);
            p.eat(b'(')?;
            let inode = p.get_u32()?;
            p.eat(b')')?;
            m.tree.mr_access(ts, inode)
        }
        HC_ACQU if p.starts_with(b"ACQUIRE") => {
            p.skip(7);
            parse_acquire(m, &mut p)?
        }
        HC_AQUI if p.starts_with(b"AQUIRE") => {
            p.skip(6);
            parse_acquire(m, &mut p)?
        }
        HC_AMTI if p.starts_with(b"AMTIME") => {
            p.skip(6);
            p.eat(b'(')?;
            let inode = p.get_u32()?;
            p.eat(b',')?;
            let atime = p.get_u32()?;
            p.eat(b',')?;
            let mtime = p.get_u32()?;
            p.eat(b',')?;
            let ctime = p.get_u32()?;
            p.eat(b')')?;
            m.tree.mr_amtime(inode, atime, mtime, ctime)
        }
        HC_ATTR => {
            p.skip(4);
            p.eat(b'(')?;
            let inode = p.get_u32()?;
            p.eat(b',')?;
            let mode = p.get_u16()?;
            p.eat(b',')?;
            let uid = p.get_u32()?;
            p.eat(b',')?;
            let gid = p.get_u32()?;
            p.eat(b',')?;
            let atime = p.get_u32()?;
            p.eat(b',')?;
            let mtime = p.get_u32()?;
            p.eat(b',')?;
            let winattr = p.get_u8()?;
            p.eat(b',')?;
            let _aclmode = p.get_u16()?;
            p.eat(b')')?;
            m.tree.mr_attr(ts, inode, mode, uid, gid, atime, mtime, winattr)
        }
        HC_CREA if p.starts_with(b"CREATE") => {
            p.skip(6);
            p.eat(b'(')?;
            let parent = p.get_u32()?;
            p.eat(b',')?;
            let name = p.get_name(b',')?;
            p.eat(b',')?;
            let ntype = p.get_u8()?;
            p.eat(b',')?;
            let mode = p.get_u16()?;
            p.eat(b',')?;
            let cumask = p.get_u16()?;
            p.eat(b',')?;
            let uid = p.get_u32()?;
            p.eat(b',')?;
            let gid = p.get_u32()?;
            p.eat(b',')?;
            let rdev = p.get_u32()?;
            p.eat(b')')?;
            p.eat(b':')?;
            let inode = p.get_u32()?;
            m.tree.mr_create(ts, &mut m.sclass, parent, &name, ntype, mode, cumask, uid, gid, rdev, inode)
        }
        HC_CHUN if p.starts_with(b"CHUNKADD") => {
            p.skip(8);
            p.eat(b'(')?;
            let chunkid = p.get_u64()?;
            p.eat(b',')?;
            let version = p.get_u32()?;
            p.eat(b',')?;
            let lockedto = p.get_u32()?;
            p.eat(b')')?;
            m.chunks.mr_chunkadd(chunkid, version, lockedto)
        }
        HC_CHUN if p.starts_with(b"CHUNKDEL") => {
            p.skip(8);
            p.eat(b'(')?;
            let chunkid = p.get_u64()?;
            p.eat(b',')?;
            let version = p.get_u32()?;
            p.eat(b')')?;
            m.chunks.mr_chunkdel(chunkid, version)
        }
        HC_EMPT if p.starts_with(b"EMPTYTRASH") => {
            p.skip(10);
            p.eat(b'(')?;
            p.eat(b')')?;
            p.eat(b':')?;
            let freed = p.get_u32()?;
            p.eat(b',')?;
            let sustained = p.get_u32()?;
            let openfiles = std::mem::take(&mut m.openfiles);
            let st = m.tree.mr_emptytrash(ts, &mut m.sclass, &mut m.chunks,
                                          |ino| openfiles.is_file_open(ino), freed, sustained);
            m.openfiles = openfiles;
            st
        }
        HC_EMPT if p.starts_with(b"EMPTYSUSTAINED") || p.starts_with(b"EMPTYRESERVED") => {
            p.skip(if p.starts_with(b"EMPTYSUSTAINED") { 14 } else { 13 });
            p.eat(b'(')?;
            p.eat(b')')?;
            p.eat(b':')?;
            let freed = p.get_u32()?;
            let openfiles = std::mem::take(&mut m.openfiles);
            let st = m.tree.mr_emptysustained(ts, &mut m.sclass, &mut m.chunks,
                                              |ino| openfiles.is_file_open(ino), freed);
            m.openfiles = openfiles;
            st
        }
        HC_FLOC if p.starts_with(b"FLOCK") => {
            p.skip(5);
            p.eat(b'(')?;
            let inode = p.get_u32()?;
            p.eat(b',')?;
            let sessionid = p.get_u32()?;
            p.eat(b',')?;
            let owner = p.get_u64()?;
            p.eat(b',')?;
            let cmd = p.get_char()?;
            p.eat(b')')?;
            m.flocks.mr_change(inode, sessionid, owner, cmd)
        }
        HC_FREE if p.starts_with(b"FREEINODES") => {
            p.skip(10);
            p.eat(b'(')?;
            p.eat(b')')?;
            p.eat(b':')?;
            let freed = p.get_u32()?;
            m.tree.mr_freeinodes(ts, freed)
        }
        HC_INCV if p.starts_with(b"INCVERSION") => {
            p.skip(10);
            p.eat(b'(')?;
            let chunkid = p.get_u64()?;
            p.eat(b')')?;
            m.chunks.mr_increase_version(chunkid)
        }
        HC_LENG if p.starts_with(b"LENGTH") => {
            p.skip(6);
            p.eat(b'(')?;
            let inode = p.get_u32()?;
            p.eat(b',')?;
            let length = p.get_u64()?;
            let canmodmtime = if p.peek() == b',' {
                p.skip(1);
                p.get_u8()? != 0
            } else {
                true
            };
            p.eat(b')')?;
            m.tree.mr_length(ts, &mut m.chunks, inode, length, canmodmtime)
        }
        HC_LINK => {
            p.skip(4);
            p.eat(b'(')?;
            let inode = p.get_u32()?;
            p.eat(b',')?;
            let parent = p.get_u32()?;
            p.eat(b',')?;
            let name = p.get_name(b')')?;
            p.eat(b')')?;
            m.tree.mr_link(ts, inode, parent, &name)
        }
        HC_MOVE => {
            p.skip(4);
            p.eat(b'(')?;
            let parent_src = p.get_u32()?;
            p.eat(b',')?;
            let name_src = p.get_name(b',')?;
            p.eat(b',')?;
            let parent_dst = p.get_u32()?;
            p.eat(b',')?;
            let name_dst = p.get_name(b')')?;
            p.eat(b')')?;
            p.eat(b':')?;
            let inode = p.get_u32()?;
            m.tree.mr_move(ts, &mut m.sclass, &mut m.chunks, parent_src, &name_src, parent_dst, &name_dst, inode)
        }
        HC_NEXT if p.starts_with(b"NEXTCHUNKID") => {
            p.skip(11);
            p.eat(b'(')?;
            let chunkid = p.get_u64()?;
            p.eat(b')')?;
            m.chunks.mr_nextchunkid(chunkid)
        }
        HC_PATA if p.starts_with(b"PATADD") => {
            p.skip(6);
            p.eat(b'(')?;
            let gname = p.get_name(b',')?;
            p.eat(b',')?;
            let euid = p.get_u32()?;
            p.eat(b',')?;
            let egid = p.get_u32()?;
            p.eat(b',')?;
            let priority = p.get_u8()?;
            p.eat(b',')?;
            let omask = p.get_u8()?;
            p.eat(b',')?;
            let scid = p.get_u8()?;
            p.eat(b',')?;
            let trashretention = p.get_u16()?;
            p.eat(b',')?;
            let seteattr = p.get_u8()?;
            p.eat(b',')?;
            let clreattr = p.get_u8()?;
            p.eat(b')')?;
            m.patterns.mr_add(Pattern {
                gname,
                euid,
                egid,
                priority,
                omask,
                scid,
                trashretention,
                seteattr,
                clreattr,
            })
        }
        HC_PATD if p.starts_with(b"PATDEL") => {
            p.skip(6);
            p.eat(b'(')?;
            let gname = p.get_name(b',')?;
            p.eat(b',')?;
            let euid = p.get_u32()?;
            p.eat(b',')?;
            let egid = p.get_u32()?;
            p.eat(b')')?;
            m.patterns.mr_delete(&gname, euid, egid)
        }
        HC_POSI if p.starts_with(b"POSIXLOCK") => {
            p.skip(9);
            p.eat(b'(')?;
            let inode = p.get_u32()?;
            p.eat(b',')?;
            let sessionid = p.get_u32()?;
            p.eat(b',')?;
            let owner = p.get_u64()?;
            p.eat(b',')?;
            let cmd = p.get_char()?;
            p.eat(b',')?;
            let start = p.get_u64()?;
            p.eat(b',')?;
            let end = p.get_u64()?;
            p.eat(b',')?;
            let pid = p.get_u32()?;
            p.eat(b')')?;
            m.plocks.mr_change(inode, sessionid, owner, cmd, start, end, pid)
        }
        HC_PURG if p.starts_with(b"PURGE") => {
            p.skip(5);
            p.eat(b'(')?;
            let inode = p.get_u32()?;
            p.eat(b')')?;
            m.tree.mr_purge(ts, &mut m.sclass, &mut m.chunks, inode)
        }
        HC_QUOT if p.starts_with(b"QUOTA") => {
            p.skip(5);
            p.eat(b'(')?;
            let inode = p.get_u32()?;
            p.eat(b',')?;
            let exceeded = p.get_u8()? != 0;
            p.eat(b',')?;
            let flags = p.get_u8()?;
            p.eat(b',')?;
            let stimestamp = p.get_u32()?;
            p.eat(b',')?;
            let sinodes = p.get_u32()?;
            p.eat(b',')?;
            let hinodes = p.get_u32()?;
            p.eat(b',')?;
            let slength = p.get_u64()?;
            p.eat(b',')?;
            let hlength = p.get_u64()?;
            p.eat(b',')?;
            let ssize = p.get_u64()?;
            p.eat(b',')?;
            let hsize = p.get_u64()?;
            p.eat(b',')?;
            let srealsize = p.get_u64()?;
            p.eat(b',')?;
            let hrealsize = p.get_u64()?;
            let timelimit = if p.peek() == b',' {
                p.skip(1);
                p.get_u32()?
            } else {
                0
            };
            p.eat(b')')?;
            m.tree.mr_quota(inode, exceeded, flags, stimestamp, sinodes, hinodes,
                            slength, hlength, ssize, hsize, srealsize, hrealsize, timelimit)
        }
        HC_RELE if p.starts_with(b"RELEASE") => {
            p.skip(7);
            p.eat(b'(')?;
            let inode = p.get_u32()?;
            p.eat(b',')?;
            let sessionid = p.get_u32()?;
            p.eat(b')')?;
            let (st, removed) = m.openfiles.mr_release(inode, sessionid);
            if removed {
                let mut scratch = Changelog::memory();
                m.flocks.file_closed(&mut scratch, ts, sessionid, inode);
                m.plocks.file_closed(&mut scratch, ts, sessionid, inode);
            }
            st
        }
        HC_SCDE if p.starts_with(b"SCDEL") => {
            p.skip(5);
            p.eat(b'(')?;
            let name = p.get_name(b')')?;
            p.eat(b')')?;
            p.eat(b':')?;
            let spid = p.get_u8()?;
            m.sclass.mr_delete_entry(&name, spid)
        }
        HC_SCDU if p.starts_with(b"SCDUP") => {
            p.skip(5);
            p.eat(b'(')?;
            let sname = p.get_name(b',')?;
            p.eat(b',')?;
            let dname = p.get_name(b')')?;
            p.eat(b')')?;
            p.eat(b':')?;
            let sspid = p.get_u8()?;
            p.eat(b',')?;
            let dspid = p.get_u8()?;
            m.sclass.mr_duplicate_entry(&sname, &dname, sspid, dspid)
        }
        HC_SCRE if p.starts_with(b"SCREN") => {
            p.skip(5);
            p.eat(b'(')?;
            let sname = p.get_name(b',')?;
            p.eat(b',')?;
            let dname = p.get_name(b')')?;
            p.eat(b')')?;
            p.eat(b':')?;
            let spid = p.get_u8()?;
            m.sclass.mr_rename_entry(&sname, &dname, spid)
        }
        HC_SCSE if p.starts_with(b"SCSET") => {
            p.skip(5);
            p.eat(b'(')?;
            let name = p.get_name(b',')?;
            p.eat(b',')?;
            let newflag = p.get_u8()?;
            p.eat(b',')?;
            let sc = parse_sclass_record(&mut p, name.clone())?;
            p.eat(b')')?;
            p.eat(b':')?;
            let spid = p.get_u8()?;
            m.sclass.mr_set_entry(&name, spid, newflag, sc)
        }
        HC_SESA if p.starts_with(b"SESADD") => {
            p.skip(6);
            p.eat(b'(')?;
            let sp = parse_session_params(&mut p)?;
            p.eat(b')')?;
            p.eat(b':')?;
            let sessionid = p.get_u32()?;
            m.sessions.mr_sesadd(sp, sessionid)
        }
        HC_SESC if p.starts_with(b"SESCHANGED") => {
            p.skip(10);
            p.eat(b'(')?;
            let sessionid = p.get_u32()?;
            p.eat(b',')?;
            let sp = parse_session_params(&mut p)?;
            p.eat(b')')?;
            m.sessions.mr_seschanged(sessionid, sp)
        }
        HC_SESC if p.starts_with(b"SESCONNECTED") => {
            p.skip(12);
            p.eat(b'(')?;
            let sessionid = p.get_u32()?;
            p.eat(b')')?;
            m.sessions.mr_connected(sessionid)
        }
        HC_SESD if p.starts_with(b"SESDISCONNECTED") => {
            p.skip(15);
            p.eat(b'(')?;
            let sessionid = p.get_u32()?;
            p.eat(b')')?;
            m.sessions.mr_disconnected(sessionid, ts)
        }
        HC_SESD if p.starts_with(b"SESDEL") => {
            p.skip(6);
            p.eat(b'(')?;
            let sessionid = p.get_u32()?;
            p.eat(b')')?;
            let st = m.sessions.mr_sesdel(sessionid);
            if st == MfsStatus::Ok {
                let mut scratch = Changelog::memory();
                for (sid, inode) in m.openfiles.session_removed(sessionid) {
                    m.flocks.file_closed(&mut scratch, ts, sid, inode);
                    m.plocks.file_closed(&mut scratch, ts, sid, inode);
                }
            }
            st
        }
        HC_SETA if p.starts_with(b"SETACL") => {
            p.skip(6);
            p.eat(b'(')?;
            let inode = p.get_u32()?;
            p.eat(b',')?;
            let acltype = p.get_u8()?;
            p.eat(b',')?;
            let data = p.get_name(b')')?;
            p.eat(b')')?;
            let mut scratch = Changelog::memory();
            match m.tree.setacl(&mut scratch, ts, inode, acltype, &data) {
                Ok(()) => MfsStatus::Ok,
                Err(_) => MfsStatus::Mismatch,
            }
        }
        HC_SETE if p.starts_with(b"SETEATTR") => {
            p.skip(8);
            p.eat(b'(')?;
            let inode = p.get_u32()?;
            p.eat(b',')?;
            let uid = p.get_u32()?;
            p.eat(b',')?;
            let eattr = p.get_u8()?;
            p.eat(b',')?;
            let smode = p.get_u8()?;
            p.eat(b')')?;
            p.eat(b':')?;
            let ci = p.get_u32()?;
            p.eat(b',')?;
            let nci = p.get_u32()?;
            p.eat(b',')?;
            let npi = p.get_u32()?;
            let mut scratch = Changelog::memory();
            match m.tree.seteattr(&mut scratch, ts, inode, uid, eattr, smode) {
                Ok(res) if res == (ci, nci, npi) => MfsStatus::Ok,
                _ => MfsStatus::Mismatch,
            }
        }
        HC_SETP if p.starts_with(b"SETPATH") => {
            p.skip(7);
            p.eat(b'(')?;
            let inode = p.get_u32()?;
            p.eat(b',')?;
            let path = p.get_name(b')')?;
            p.eat(b')')?;
            m.tree.mr_setpath(inode, &path)
        }
        HC_SETS if p.starts_with(b"SETSCLASS") => {
            p.skip(9);
            p.eat(b'(')?;
            let inode = p.get_u32()?;
            p.eat(b',')?;
            let uid = p.get_u32()?;
            p.eat(b',')?;
            let src = p.get_u8()?;
            p.eat(b',')?;
            let dst = p.get_u8()?;
            p.eat(b',')?;
            let smode = p.get_u8()?;
            p.eat(b')')?;
            p.eat(b':')?;
            let ci = p.get_u32()?;
            p.eat(b',')?;
            let nci = p.get_u32()?;
            p.eat(b',')?;
            let npi = p.get_u32()?;
            let mut scratch = Changelog::memory();
            match m.tree.setsclass(&mut scratch, ts, &mut m.sclass, &mut m.chunks, inode, uid, src, dst, smode)
            {
                Ok(res) if res == (ci, nci, npi) => MfsStatus::Ok,
                _ => MfsStatus::Mismatch,
            }
        }
        HC_SETT if p.starts_with(b"SETTRASHTIME") => {
            p.skip(12);
            p.eat(b'(')?;
            let inode = p.get_u32()?;
            p.eat(b',')?;
            let uid = p.get_u32()?;
            p.eat(b',')?;
            let trashretention = p.get_u16()?;
            p.eat(b',')?;
            let smode = p.get_u8()?;
            p.eat(b')')?;
            p.eat(b':')?;
            let ci = p.get_u32()?;
            p.eat(b',')?;
            let nci = p.get_u32()?;
            p.eat(b',')?;
            let npi = p.get_u32()?;
            let mut scratch = Changelog::memory();
            match m.tree.settrashretention(&mut scratch, ts, inode, uid, trashretention, smode) {
                Ok(res) if res == (ci, nci, npi) => MfsStatus::Ok,
                _ => MfsStatus::Mismatch,
            }
        }
        HC_SETV if p.starts_with(b"SETVERSION") => {
            p.skip(10);
            p.eat(b'(')?;
            let chunkid = p.get_u64()?;
            p.eat(b',')?;
            let version = p.get_u32()?;
            p.eat(b')')?;
            m.chunks.mr_set_version(chunkid, version)
        }
        HC_SETX if p.starts_with(b"SETXATTR") => {
            p.skip(8);
            p.eat(b'(')?;
            let inode = p.get_u32()?;
            p.eat(b',')?;
            let name = p.get_name(b',')?;
            p.eat(b',')?;
            let value = p.get_name(b',')?;
            p.eat(b',')?;
            let mode = p.get_u8()?;
            p.eat(b')')?;
            let mut scratch = Changelog::memory();
            match m.tree.setxattr(&mut scratch, ts, inode, &name, &value, mode) {
                Ok(()) => MfsStatus::Ok,
                Err(_) => MfsStatus::Mismatch,
            }
        }
        HC_UNDE if p.starts_with(b"UNDEL") => {
            p.skip(5);
            p.eat(b'(')?;
            let inode = p.get_u32()?;
            p.eat(b')')?;
            m.tree.mr_undel(ts, &mut m.sclass, inode)
        }
        HC_UNLI if p.starts_with(b"UNLINK") => {
            p.skip(6);
            p.eat(b'(')?;
            let parent = p.get_u32()?;
            p.eat(b',')?;
            let name = p.get_name(b')')?;
            p.eat(b')')?;
            p.eat(b':')?;
            let inode = p.get_u32()?;
            let openfiles = std::mem::take(&mut m.openfiles);
            let st = m.tree.mr_unlink(ts, &mut m.sclass, &mut m.chunks,
                                      |ino| openfiles.is_file_open(ino), parent, &name, inode);
            m.openfiles = openfiles;
            st
        }
        HC_UNLO if p.starts_with(b"UNLOCK") => {
            p.skip(6);
            p.eat(b'(')?;
            let chunkid = p.get_u64()?;
            p.eat(b')')?;
            m.chunks.mr_unlock(chunkid)
        }
        HC_WRIT if p.starts_with(b"WRITE") => {
            p.skip(5);
            p.eat(b'(')?;
            let inode = p.get_u32()?;
            p.eat(b',')?;
            let indx = p.get_u32()?;
            let opflag = if p.peek() == b',' {
                p.skip(1);
                p.get_u32()?
            } else {
                1
            };
            let canmodmtime = if p.peek() == b',' {
                p.skip(1);
                p.get_u8()? != 0
            } else {
                true
            };
            p.eat(b')')?;
            p.eat(b':')?;
            let chunkid = p.get_u64()?;
            m.tree.mr_write(ts, &mut m.chunks, inode, indx, opflag, canmodmtime, chunkid)
        }
        _ => {
            bail!("unknown operation: {}", String::from_utf8_lossy(&line[p.pos..]));
        }
    };
    Ok(status)
}

fn parse_acquire(m: &mut Master, p: &mut LineParser) -> Result<MfsStatus> {
    p.eat(b'(')?;
    let inode = p.get_u32()?;
    p.eat(b',')?;
    let sessionid = p.get_u32()?;
    p.eat(b')')?;
    Ok(m.openfiles.mr_acquire(inode, sessionid))
}

/// Replay one changelog file. Lines older than the current meta version
/// are skipped, the next expected version is applied, anything beyond it
/// is a hole and fails the restore.
pub fn restore_file(m: &mut Master, path: &Path) -> Result<u64> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let fname = path.display().to_string();
    let mut applied = 0u64;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let (vstr, rest) = line
            .split_once(": ")
            .with_context(|| format!("{}:{}: malformed line", fname, lineno + 1))?;
        let lv: u64 = vstr
            .trim()
            .parse()
            .with_context(|| format!("{}:{}: bad version", fname, lineno + 1))?;
        let expected = m.chlog.version();
        if lv < expected {
            continue;
        }
        if lv > expected {
            bail!("{}:{}: version gap (expected {}, got {})", fname, lineno + 1, expected, lv);
        }
        let status = restore_line(m, rest.as_bytes())
            .with_context(|| format!("{}:{}: {}", fname, lineno + 1, rest))?;
        if status != MfsStatus::Ok {
            bail!("{}:{}: replay returned {:?} for: {}", fname, lineno + 1, status, rest);
        }
        m.chlog.version_inc();
        applied += 1;
    }
    if applied > 0 {
        debug!("{}: {} operations replayed", fname, applied);
    } else {
        warn!("{}: nothing to replay", fname);
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rmfs_lib::sessions::NewSessionParams;
    use crate::rmfs_lib::types::*;
    use crate::rmfs_lib::MasterOptions;

    fn fresh() -> Master {
        Master::new(1000, 7, &MasterOptions::default()).unwrap()
    }

    /// Drive a scripted workload on one master, then replay its journal
    /// into a second and compare what matters.
    #[test]
    fn replay_reproduces_meta_version_and_tree() {
        let mut m = fresh();
        let sid = m.sessions.new_session(&mut m.chlog, 1000, NewSessionParams {
            info: b"/mnt".to_vec(),
            ..Default::default()
        });
        let d = m
            .tree
            .create(&mut m.chlog, 1000, &mut m.sclass, &m.patterns, ROOT_INODE, b"docs",
                    NodeType::Directory, 0o755, 0o022, 1000, &[100], 0)
            .unwrap();
        let f = m
            .tree
            .create(&mut m.chlog, 1001, &mut m.sclass, &m.patterns, d, b"a note.txt",
                    NodeType::File, 0o644, 0o022, 1000, &[100], 0)
            .unwrap();
        m.openfiles.open_file(&mut m.chlog, 1001, sid, f);
        let (chunkid, _) =
            m.tree.write_chunk(&mut m.chlog, 1002, &m.sclass, &mut m.chunks, f, 0).unwrap();
        m.tree.write_chunk_end(&mut m.chlog, 1003, &mut m.chunks, chunkid, f, 42).unwrap();
        m.flocks.cmd(&mut m.chlog, 1003, sid, 5, 5, f, 9, FLOCK_LOCK_SHARED, true);
        m.tree.settrashretention(&mut m.chlog, 1004, f, 0, 24, SMODE_SET).unwrap();
        m.tree
            .unlink(&mut m.chlog, 1005, &mut m.sclass, &mut m.chunks, d, b"a note.txt", |_| true)
            .unwrap();

        let lines: Vec<String> = m.chlog.recorded().to_vec();
        let final_version = m.chlog.version();

        let mut r = fresh();
        for line in &lines {
            let (v, rest) = line.split_once(": ").unwrap();
            let v: u64 = v.parse().unwrap();
            assert_eq!(v, r.chlog.version(), "line: {}", line);
            let st = restore_line(&mut r, rest.as_bytes()).unwrap();
            assert_eq!(st, MfsStatus::Ok, "line: {}", line);
            r.chlog.version_inc();
        }
        assert_eq!(r.chlog.version(), final_version);
        assert_eq!(r.tree.lookup(ROOT_INODE, b"docs").unwrap(), d);
        // the unlinked file kept its retention and sits in trash
        assert_eq!(r.tree.node(f).unwrap().ntype, NodeType::Trash);
        assert_eq!(r.tree.node(f).unwrap().length(), 42);
        assert_eq!(r.chunks.get(chunkid).unwrap().version, 1);
        assert!(r.openfiles.checknode(sid, f));
        assert_eq!(r.flocks.list(f).len(), 1);
        assert!(r.sessions.find(sid).is_some());
    }

    #[test]
    fn name_escaping_roundtrips_through_replay() {
        let mut m = fresh();
        let weird = b"we,ird(name)|100%";
        let f = m
            .tree
            .create(&mut m.chlog, 1000, &mut m.sclass, &m.patterns, ROOT_INODE, weird,
                    NodeType::File, 0o644, 0, 0, &[0], 0)
            .unwrap();
        let line = m.chlog.recorded()[0].clone();
        let mut r = fresh();
        let (_, rest) = line.split_once(": ").unwrap();
        assert_eq!(restore_line(&mut r, rest.as_bytes()).unwrap(), MfsStatus::Ok);
        assert_eq!(r.tree.lookup(ROOT_INODE, weird).unwrap(), f);
    }

    #[test]
    fn unknown_opcode_fails() {
        let mut m = fresh();
        assert!(restore_line(&mut m, b"1000|BOGUS(1)").is_err());
    }

    #[test]
    fn sclass_lines_roundtrip() {
        let mut m = fresh();
        let mut sc = StorageClass::simple_goal(2, b"fast");
        sc.keep = SclassSet::parse(b"2A+B,[C]/[IP]:STRICT").unwrap();
        sc.min_trashretention = 12;
        let id = m.sclass.create(&mut m.chlog, 1000, sc.clone()).unwrap();
        m.sclass.rename(&mut m.chlog, 1001, b"fast", b"quick").unwrap();

        let mut r = fresh();
        for line in m.chlog.recorded().to_vec() {
            let (_, rest) = line.split_once(": ").unwrap();
            assert_eq!(restore_line(&mut r, rest.as_bytes()).unwrap(), MfsStatus::Ok, "{}", line);
        }
        assert_eq!(r.sclass.find_by_name(b"quick"), Some(id));
        assert_eq!(r.sclass.get(id).unwrap().keep, sc.keep);
    }

    #[test]
    fn session_lines_roundtrip() {
        let mut m = fresh();
        let sid = m.sessions.new_session(&mut m.chlog, 1000, NewSessionParams {
            sesflags: SESFLAG_ATTRBIT,
            umaskval: 0o027,
            disables: 0xA5,
            peerip: 0x7F000001,
            info: b"/mnt/weird name".to_vec(),
            ..Default::default()
        });
        m.sessions.disconnect(&mut m.chlog, 1010, sid);
        let mut r = fresh();
        for line in m.chlog.recorded().to_vec() {
            let (_, rest) = line.split_once(": ").unwrap();
            assert_eq!(restore_line(&mut r, rest.as_bytes()).unwrap(), MfsStatus::Ok, "{}", line);
        }
        let s = r.sessions.find(sid).unwrap();
        assert_eq!(s.umaskval, 0o027);
        assert_eq!(s.disables, 0xA5);
        assert_eq!(s.info, b"/mnt/weird name");
        assert_eq!(s.disconnected, 1010);
    }

    #[test]
    fn restore_file_detects_version_gap() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("rmfs_restore_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir)?;
        let log = dir.join("changelog.0.mfs");
        std::fs::write(&log, "1: 1000|IDLE()\n3: 1000|IDLE()\n")?;
        let mut m = fresh();
        assert!(restore_file(&mut m, &log).is_err());
        std::fs::write(&log, "1: 1000|IDLE()\n2: 1000|IDLE()\n")?;
        let mut m = fresh();
        assert_eq!(restore_file(&mut m, &log)?, 2);
        assert_eq!(m.chlog.version(), 3);
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
