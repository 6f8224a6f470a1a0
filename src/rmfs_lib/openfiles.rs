//! Open-file tracking: the (session, inode) relation.
//!
//! Indexed both ways so that "which inodes does this session hold" and
//! "is this inode held by anyone" are cheap. Every acquire/release is
//! journaled; on reconnect the client's full inode set is diffed against
//! the recorded relation. Closing a relation must also tear down the
//! advisory locks of that (session, inode) pair - the caller drives that
//! with the pairs returned from the mutating operations.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::Write;

use anyhow::Result;

use crate::rmfs_lib::changelog::Changelog;
use crate::rmfs_lib::codec::Cursor;
use crate::rmfs_lib::types::MfsStatus;

#[derive(Default)]
pub struct OpenFiles {
    by_session: HashMap<u32, BTreeSet<u32>>,
    by_inode: HashMap<u32, HashSet<u32>>,
}

impl OpenFiles {
    pub fn new() -> OpenFiles {
        OpenFiles::default()
    }

    fn add(&mut self, sessionid: u32, inode: u32) {
        self.by_session.entry(sessionid).or_default().insert(inode);
        self.by_inode.entry(inode).or_default().insert(sessionid);
    }

    fn del(&mut self, sessionid: u32, inode: u32) -> bool {
        let mut removed = false;
        if let Some(set) = self.by_session.get_mut(&sessionid) {
            removed = set.remove(&inode);
            if set.is_empty() {
                self.by_session.remove(&sessionid);
            }
        }
        if let Some(set) = self.by_inode.get_mut(&inode) {
            set.remove(&sessionid);
            if set.is_empty() {
                self.by_inode.remove(&inode);
            }
        }
        removed
    }

    pub fn checknode(&self, sessionid: u32, inode: u32) -> bool {
        self.by_inode.get(&inode).map_or(false, |s| s.contains(&sessionid))
    }

    pub fn is_file_open(&self, inode: u32) -> bool {
        self.by_inode.contains_key(&inode)
    }

    pub fn is_file_opened_by_session(&self, inode: u32, sessionid: u32) -> bool {
        self.checknode(sessionid, inode)
    }

    pub fn opened_files_count(&self, sessionid: u32) -> u32 {
        self.by_session.get(&sessionid).map_or(0, |s| s.len() as u32)
    }

    /// Record an open; journals ACQUIRE when the pair is new.
    pub fn open_file(&mut self, chlog: &mut Changelog, ts: u32, sessionid: u32, inode: u32) {
        if !self.checknode(sessionid, inode) {
            chlog.append(&format!("{}|ACQUIRE({},{})", ts, inode, sessionid));
            self.add(sessionid, inode);
        }
    }

    /// Reconcile the full inode set a reconnecting client reports.
    /// Journals RELEASE for pairs the client no longer holds and ACQUIRE
    /// for pairs it holds that the master did not record. Returns the
    /// released pairs so the caller can drop their advisory locks.
    pub fn sync(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        sessionid: u32,
        inodes: &[u32],
    ) -> Vec<(u32, u32)> {
        let reported: BTreeSet<u32> = inodes.iter().copied().collect();
        let recorded: Vec<u32> =
            self.by_session.get(&sessionid).map(|s| s.iter().copied().collect()).unwrap_or_default();
        let mut released = Vec::new();
        for inode in recorded {
            if !reported.contains(&inode) {
                chlog.append(&format!("{}|RELEASE({},{})", ts, inode, sessionid));
                self.del(sessionid, inode);
                released.push((sessionid, inode));
            }
        }
        for &inode in &reported {
            if !self.checknode(sessionid, inode) {
                chlog.append(&format!("{}|ACQUIRE({},{})", ts, inode, sessionid));
                self.add(sessionid, inode);
            }
        }
        released
    }

    /// Close one file; journals RELEASE. Returns whether the pair existed.
    pub fn release_file(&mut self, chlog: &mut Changelog, ts: u32, sessionid: u32, inode: u32) -> bool {
        if self.del(sessionid, inode) {
            chlog.append(&format!("{}|RELEASE({},{})", ts, inode, sessionid));
            true
        } else {
            false
        }
    }

    /// Drop every relation of a removed session. Returns the closed pairs.
    pub fn session_removed(&mut self, sessionid: u32) -> Vec<(u32, u32)> {
        let inodes: Vec<u32> =
            self.by_session.get(&sessionid).map(|s| s.iter().copied().collect()).unwrap_or_default();
        let mut closed = Vec::with_capacity(inodes.len());
        for inode in inodes {
            self.del(sessionid, inode);
            closed.push((sessionid, inode));
        }
        closed
    }

    /// Open-file listing: all pairs, or the inodes of one session.
    pub fn lsof(&self, sessionid: u32) -> Vec<(u32, u32)> {
        if sessionid == 0 {
            let mut v: Vec<(u32, u32)> = self
                .by_session
                .iter()
                .flat_map(|(&s, inodes)| inodes.iter().map(move |&i| (s, i)))
                .collect();
            v.sort_unstable();
            v
        } else {
            self.by_session
                .get(&sessionid)
                .map(|s| s.iter().map(|&i| (sessionid, i)).collect())
                .unwrap_or_default()
        }
    }

    /* replay entry points */

    pub fn mr_acquire(&mut self, inode: u32, sessionid: u32) -> MfsStatus {
        if self.checknode(sessionid, inode) {
            return MfsStatus::Mismatch;
        }
        self.add(sessionid, inode);
        MfsStatus::Ok
    }

    pub fn mr_release(&mut self, inode: u32, sessionid: u32) -> (MfsStatus, bool) {
        if self.del(sessionid, inode) {
            (MfsStatus::Ok, true)
        } else {
            (MfsStatus::Mismatch, false)
        }
    }

    /* image section serialization, minor version 0x10 */

    pub fn store(&self, w: &mut impl Write) -> Result<()> {
        for (sessionid, inode) in self.lsof(0) {
            w.write_all(&sessionid.to_be_bytes())?;
            w.write_all(&inode.to_be_bytes())?;
        }
        w.write_all(&[0u8; 8])?;
        Ok(())
    }

    /// Relations referencing unknown sessions are skipped; the sessions
    /// table is loaded first.
    pub fn load(data: &[u8], session_exists: impl Fn(u32) -> bool) -> Result<OpenFiles> {
        let mut of = OpenFiles::new();
        let mut c = Cursor::new(data);
        loop {
            let sessionid = c.get_u32()?;
            let inode = c.get_u32()?;
            if sessionid == 0 && inode == 0 {
                break;
            }
            if sessionid == 0 || inode == 0 {
                anyhow::bail!("bad open-file record ({},{})", sessionid, inode);
            }
            if session_exists(sessionid) {
                of.add(sessionid, inode);
            }
        }
        Ok(of)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn open_and_check() {
        let mut of = OpenFiles::new();
        let mut cl = Changelog::memory();
        of.open_file(&mut cl, 0, 7, 100);
        assert!(of.checknode(7, 100));
        assert!(!of.checknode(8, 100));
        assert!(of.is_file_open(100));
        assert_eq!(of.opened_files_count(7), 1);
        // opening again is idempotent, no second journal line
        of.open_file(&mut cl, 0, 7, 100);
        assert_eq!(cl.version(), 2);
    }

    #[test]
    fn sync_diffs_reported_set() {
        let mut of = OpenFiles::new();
        let mut cl = Changelog::memory();
        of.open_file(&mut cl, 0, 7, 100);
        of.open_file(&mut cl, 0, 7, 101);
        of.open_file(&mut cl, 0, 7, 102);
        let released = of.sync(&mut cl, 1, 7, &[101, 103]);
        assert_eq!(released, vec![(7, 100), (7, 102)]);
        assert!(!of.checknode(7, 100));
        assert!(of.checknode(7, 101));
        assert!(!of.checknode(7, 102));
        assert!(of.checknode(7, 103));
        let lines: Vec<&String> =
            cl.recorded().iter().filter(|l| l.contains("RELEASE") || l.contains("ACQUIRE")).collect();
        assert_eq!(lines.len(), 3 + 2 + 1); // 3 opens, 2 releases, 1 acquire
    }

    #[test]
    fn session_removal_closes_everything() {
        let mut of = OpenFiles::new();
        let mut cl = Changelog::memory();
        of.open_file(&mut cl, 0, 7, 100);
        of.open_file(&mut cl, 0, 7, 101);
        of.open_file(&mut cl, 0, 8, 100);
        let closed = of.session_removed(7);
        assert_eq!(closed.len(), 2);
        assert!(!of.checknode(7, 100));
        assert!(of.checknode(8, 100));
        assert!(of.is_file_open(100));
        assert!(!of.is_file_open(101));
    }

    #[test]
    fn replay_mismatch_detection() {
        let mut of = OpenFiles::new();
        assert_eq!(of.mr_acquire(100, 7), MfsStatus::Ok);
        assert_eq!(of.mr_acquire(100, 7), MfsStatus::Mismatch);
        assert_eq!(of.mr_release(100, 7).0, MfsStatus::Ok);
        assert_eq!(of.mr_release(100, 7).0, MfsStatus::Mismatch);
    }

    #[test]
    fn store_load_roundtrip() -> Result<()> {
        let mut of = OpenFiles::new();
        let mut cl = Changelog::memory();
        of.open_file(&mut cl, 0, 7, 100);
        of.open_file(&mut cl, 0, 8, 101);
        of.open_file(&mut cl, 0, 9, 102);
        let mut buf = Vec::new();
        of.store(&mut buf)?;
        // session 9 no longer exists at load time
        let of2 = OpenFiles::load(&buf, |s| s != 9)?;
        assert!(of2.checknode(7, 100));
        assert!(of2.checknode(8, 101));
        assert!(!of2.checknode(9, 102));
        Ok(())
    }
}
