//! Create-time name patterns.
//!
//! A small table (up to 1024 entries) of glob patterns with optional
//! (euid, egid) filters. On every create the first matching pattern, in
//! priority order, overrides the newborn inode's storage class, trash
//! retention and/or extended-attribute bits according to its override
//! mask. Mutations journal PATADD/PATDEL lines.

use std::io::Write;

use anyhow::Result;

use crate::rmfs_lib::changelog::{escape_name, Changelog};
use crate::rmfs_lib::codec::Cursor;
use crate::rmfs_lib::types::*;

pub const PATTERNS_MAX: usize = 1024;

/// Byte-wise glob: `*`, `?` and `[a-z]` classes (leading `!` negates).
pub fn glob_match(pattern: &[u8], name: &[u8]) -> bool {
    fn class_match(class: &[u8], c: u8) -> bool {
        let (neg, body) = match class.first() {
            Some(b'!') => (true, &class[1..]),
            _ => (false, class),
        };
        let mut hit = false;
        let mut i = 0;
        while i < body.len() {
            if i + 2 < body.len() && body[i + 1] == b'-' {
                if body[i] <= c && c <= body[i + 2] {
                    hit = true;
                }
                i += 3;
            } else {
                if body[i] == c {
                    hit = true;
                }
                i += 1;
            }
        }
        hit != neg
    }
    fn rec(p: &[u8], n: &[u8]) -> bool {
        match p.first() {
            None => n.is_empty(),
            Some(b'*') => {
                for skip in 0..=n.len() {
                    if rec(&p[1..], &n[skip..]) {
                        return true;
                    }
                }
                false
            }
            Some(b'?') => !n.is_empty() && rec(&p[1..], &n[1..]),
            Some(b'[') => {
                if let Some(close) = p.iter().position(|&c| c == b']') {
                    !n.is_empty() && class_match(&p[1..close], n[0]) && rec(&p[close + 1..], &n[1..])
                } else {
                    !n.is_empty() && n[0] == b'[' && rec(&p[1..], &n[1..])
                }
            }
            Some(&c) => !n.is_empty() && n[0] == c && rec(&p[1..], &n[1..]),
        }
    }
    rec(pattern, name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub gname: Vec<u8>,
    pub euid: u32,
    pub egid: u32,
    pub priority: u8,
    pub omask: u8,
    pub scid: u8,
    pub trashretention: u16,
    pub seteattr: u8,
    pub clreattr: u8,
}

/// Overrides applied to a newborn inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PatternOverride {
    pub omask: u8,
    pub scid: u8,
    pub trashretention: u16,
    pub seteattr: u8,
    pub clreattr: u8,
}

pub struct PatternTable {
    patterns: Vec<Pattern>,
}

impl PatternTable {
    pub fn new() -> PatternTable {
        PatternTable { patterns: Vec::new() }
    }

    // priority order: higher priority first, then lower scid, then name
    fn resort(&mut self) {
        self.patterns.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scid.cmp(&b.scid))
                .then(a.gname.cmp(&b.gname))
        });
    }

    fn check_ugids(p: &Pattern, uid: u32, gids: &[u32]) -> bool {
        if p.euid != PATTERN_EUGID_ANY && p.euid != uid {
            return false;
        }
        if p.egid == PATTERN_EUGID_ANY {
            return true;
        }
        gids.contains(&p.egid)
    }

    /// First matching pattern's overrides for a create of `name`.
    pub fn find_matching(&self, uid: u32, gids: &[u32], name: &[u8]) -> Option<PatternOverride> {
        for p in &self.patterns {
            if Self::check_ugids(p, uid, gids) && glob_match(&p.gname, name) {
                return Some(PatternOverride {
                    omask: p.omask,
                    scid: p.scid,
                    trashretention: p.trashretention,
                    seteattr: p.seteattr,
                    clreattr: p.clreattr,
                });
            }
        }
        None
    }

    fn univ_add(&mut self, p: Pattern) -> MfsStatus {
        if p.gname.is_empty() || p.gname.len() > MAX_NAME_LENG {
            return MfsStatus::EInval;
        }
        if p.omask & PATTERN_OMASK_EATTR != 0
            && ((p.seteattr == 0 && p.clreattr == 0) || (p.seteattr & p.clreattr) != 0)
        {
            return MfsStatus::EInval;
        }
        if self
            .patterns
            .iter()
            .any(|q| q.gname == p.gname && q.euid == p.euid && q.egid == p.egid)
        {
            return MfsStatus::PatternExists;
        }
        if self.patterns.len() >= PATTERNS_MAX {
            return MfsStatus::PatLimitReached;
        }
        self.patterns.push(p);
        self.resort();
        MfsStatus::Ok
    }

    pub fn add(&mut self, chlog: &mut Changelog, ts: u32, p: Pattern) -> MfsStatus {
        let line = format!(
            "{}|PATADD({},{},{},{},{},{},{},{},{})",
            ts,
            escape_name(&p.gname),
            p.euid,
            p.egid,
            p.priority,
            p.omask,
            p.scid,
            p.trashretention,
            p.seteattr,
            p.clreattr
        );
        let status = self.univ_add(p);
        if status == MfsStatus::Ok {
            chlog.append(&line);
        }
        status
    }

    fn univ_delete(&mut self, gname: &[u8], euid: u32, egid: u32) -> MfsStatus {
        let before = self.patterns.len();
        self.patterns.retain(|p| !(p.gname == gname && p.euid == euid && p.egid == egid));
        if self.patterns.len() == before {
            MfsStatus::NoSuchPattern
        } else {
            MfsStatus::Ok
        }
    }

    pub fn delete(&mut self, chlog: &mut Changelog, ts: u32, gname: &[u8], euid: u32, egid: u32) -> MfsStatus {
        let status = self.univ_delete(gname, euid, egid);
        if status == MfsStatus::Ok {
            chlog.append(&format!("{}|PATDEL({},{},{})", ts, escape_name(gname), euid, egid));
        }
        status
    }

    /// Invalidate every pattern pointing at a deleted storage class.
    pub fn sclass_deleted(&mut self, scid: u8) {
        self.patterns.retain(|p| !(p.omask & PATTERN_OMASK_SCLASS != 0 && p.scid == scid));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pattern> {
        self.patterns.iter()
    }

    pub fn count(&self) -> usize {
        self.patterns.len()
    }

    /* replay entry points */

    pub fn mr_add(&mut self, p: Pattern) -> MfsStatus {
        self.univ_add(p)
    }

    pub fn mr_delete(&mut self, gname: &[u8], euid: u32, egid: u32) -> MfsStatus {
        self.univ_delete(gname, euid, egid)
    }

    /* image section serialization, minor version 0x10 */

    pub fn store(&self, w: &mut impl Write) -> Result<()> {
        for p in &self.patterns {
            w.write_all(&[p.gname.len() as u8])?;
            w.write_all(&p.euid.to_be_bytes())?;
            w.write_all(&p.egid.to_be_bytes())?;
            w.write_all(&[p.priority, p.omask, p.scid])?;
            w.write_all(&p.trashretention.to_be_bytes())?;
            w.write_all(&[p.seteattr, p.clreattr])?;
            w.write_all(&p.gname)?;
        }
        w.write_all(&[0u8])?;
        w.write_all(&PATTERN_EUGID_ANY.to_be_bytes())?;
        w.write_all(&PATTERN_EUGID_ANY.to_be_bytes())?;
        Ok(())
    }

    pub fn load(data: &[u8]) -> Result<PatternTable> {
        let mut tab = PatternTable::new();
        let mut c = Cursor::new(data);
        loop {
            let gnleng = c.get_u8()?;
            let euid = c.get_u32()?;
            let egid = c.get_u32()?;
            if gnleng == 0 && euid == PATTERN_EUGID_ANY && egid == PATTERN_EUGID_ANY {
                break;
            }
            let priority = c.get_u8()?;
            let omask = c.get_u8()?;
            let scid = c.get_u8()?;
            let trashretention = c.get_u16()?;
            let seteattr = c.get_u8()?;
            let clreattr = c.get_u8()?;
            let gname = c.get_bytes(gnleng as usize)?.to_vec();
            tab.patterns.push(Pattern {
                gname,
                euid,
                egid,
                priority,
                omask,
                scid,
                trashretention,
                seteattr,
                clreattr,
            });
        }
        tab.resort();
        Ok(tab)
    }
}

impl Default for PatternTable {
    fn default() -> Self {
        PatternTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn pat(gname: &[u8], priority: u8, omask: u8, scid: u8) -> Pattern {
        Pattern {
            gname: gname.to_vec(),
            euid: PATTERN_EUGID_ANY,
            egid: PATTERN_EUGID_ANY,
            priority,
            omask,
            scid,
            trashretention: 0,
            seteattr: 0,
            clreattr: 0,
        }
    }

    #[test]
    fn glob_basics() {
        assert!(glob_match(b"*.mp4", b"movie.mp4"));
        assert!(!glob_match(b"*.mp4", b"movie.mp3"));
        assert!(glob_match(b"data.?", b"data.1"));
        assert!(!glob_match(b"data.?", b"data.12"));
        assert!(glob_match(b"[a-c]*", b"beta"));
        assert!(!glob_match(b"[a-c]*", b"delta"));
        assert!(glob_match(b"[!a-c]*", b"delta"));
        assert!(glob_match(b"*", b""));
        assert!(glob_match(b"a*b*c", b"a-x-b-y-c"));
    }

    #[test]
    fn priority_order_wins() {
        let mut tab = PatternTable::new();
        let mut cl = Changelog::memory();
        assert_eq!(tab.add(&mut cl, 0, pat(b"*.mp4", 1, PATTERN_OMASK_SCLASS, 11)), MfsStatus::Ok);
        assert_eq!(tab.add(&mut cl, 0, pat(b"*", 0, PATTERN_OMASK_SCLASS, 12)), MfsStatus::Ok);
        let ov = tab.find_matching(1000, &[1000], b"x.mp4").unwrap();
        assert_eq!(ov.scid, 11);
        let ov = tab.find_matching(1000, &[1000], b"x.txt").unwrap();
        assert_eq!(ov.scid, 12);
    }

    #[test]
    fn ugid_filters() {
        let mut tab = PatternTable::new();
        let mut cl = Changelog::memory();
        let mut p = pat(b"*", 0, PATTERN_OMASK_TRASHRETENTION, 0);
        p.euid = 1000;
        p.trashretention = 72;
        assert_eq!(tab.add(&mut cl, 0, p), MfsStatus::Ok);
        assert!(tab.find_matching(1000, &[5], b"f").is_some());
        assert!(tab.find_matching(1001, &[5], b"f").is_none());
    }

    #[test]
    fn duplicates_and_validation() {
        let mut tab = PatternTable::new();
        let mut cl = Changelog::memory();
        assert_eq!(tab.add(&mut cl, 0, pat(b"*.a", 0, 0, 0)), MfsStatus::Ok);
        assert_eq!(tab.add(&mut cl, 0, pat(b"*.a", 0, 0, 0)), MfsStatus::PatternExists);
        // eattr override must set or clear something, and not both the same bit
        let mut p = pat(b"*.b", 0, PATTERN_OMASK_EATTR, 0);
        assert_eq!(tab.add(&mut cl, 0, p.clone()), MfsStatus::EInval);
        p.seteattr = EATTR_NOOWNER;
        p.clreattr = EATTR_NOOWNER;
        assert_eq!(tab.add(&mut cl, 0, p.clone()), MfsStatus::EInval);
        p.clreattr = 0;
        assert_eq!(tab.add(&mut cl, 0, p), MfsStatus::Ok);
    }

    #[test]
    fn delete_and_journal() {
        let mut tab = PatternTable::new();
        let mut cl = Changelog::memory();
        tab.add(&mut cl, 0, pat(b"*.a", 0, 0, 0));
        assert_eq!(
            tab.delete(&mut cl, 0, b"*.a", PATTERN_EUGID_ANY, PATTERN_EUGID_ANY),
            MfsStatus::Ok
        );
        assert_eq!(
            tab.delete(&mut cl, 0, b"*.a", PATTERN_EUGID_ANY, PATTERN_EUGID_ANY),
            MfsStatus::NoSuchPattern
        );
        assert!(cl.recorded().iter().any(|l| l.contains("PATADD(*.a,")));
        assert!(cl.recorded().iter().any(|l| l.contains("PATDEL(*.a,")));
    }

    #[test]
    fn store_load_roundtrip() -> Result<()> {
        let mut tab = PatternTable::new();
        let mut cl = Changelog::memory();
        tab.add(&mut cl, 0, pat(b"*.mp4", 3, PATTERN_OMASK_SCLASS, 11));
        tab.add(&mut cl, 0, pat(b"tmp.*", 1, PATTERN_OMASK_TRASHRETENTION, 0));
        let mut buf = Vec::new();
        tab.store(&mut buf)?;
        let tab2 = PatternTable::load(&buf)?;
        assert_eq!(tab2.count(), 2);
        assert_eq!(
            tab2.find_matching(0, &[0], b"a.mp4"),
            tab.find_matching(0, &[0], b"a.mp4")
        );
        Ok(())
    }
}
