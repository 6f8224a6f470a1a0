//! Master-side chunk index.
//!
//! Maps a 64-bit chunk id to (version, locked-until, archive flag), the
//! back-references from file inodes and the set of chunk servers holding
//! a copy. The version is bumped on every open-for-write; replicas with
//! older versions are stale and scheduled for deletion. Clients hitting a
//! locked chunk are parked on a per-chunk FIFO with a 30 second timeout
//! and woken by the unlock.

use std::collections::HashMap;
use std::io::Write;

use anyhow::Result;
use log::debug;

use crate::rmfs_lib::codec::Cursor;
use crate::rmfs_lib::types::MfsStatus;

/// Write lock lease on a chunk, seconds.
pub const CHUNK_LOCK_TIMEOUT: u32 = 120;
/// How long a client may wait parked on a locked chunk, seconds.
pub const CHUNK_WAIT_TIMEOUT: u32 = 30;

pub const MATRIX_SIZE: usize = 11;

#[derive(Debug, Clone)]
pub struct ChunkEntry {
    pub chunkid: u64,
    pub version: u32,
    pub lockedto: u32,
    pub archflag: bool,
    pub goal: u8,
    refs: Vec<(u32, u32)>,
    servers: Vec<u16>,
}

impl ChunkEntry {
    pub fn locked(&self, ts: u32) -> bool {
        self.lockedto >= ts
    }

    pub fn valid_copies(&self) -> u8 {
        self.servers.len().min(MATRIX_SIZE - 1) as u8
    }

    pub fn servers(&self) -> &[u16] {
        &self.servers
    }

    pub fn refs(&self) -> &[(u32, u32)] {
        &self.refs
    }
}

/// A parked request waiting for a chunk unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkWaiter {
    pub sessionid: u32,
    pub msgid: u32,
    pub inode: u32,
    pub indx: u32,
    pub write: bool,
    pub deadline: u32,
    /// Status the waiter times out with; equals the original blocker.
    pub status: MfsStatus,
}

/// Action the master tells a chunk server after an inventory report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportAction {
    /// Copy accepted.
    Keep,
    /// Unknown chunk or stale version: delete the local copy.
    Delete,
}

pub struct ChunkIndex {
    chunks: HashMap<u64, ChunkEntry>,
    nextchunkid: u64,
    waiting: HashMap<u64, Vec<ChunkWaiter>>,
    matrix: [[u32; MATRIX_SIZE]; MATRIX_SIZE],
}

impl ChunkIndex {
    pub fn new() -> ChunkIndex {
        ChunkIndex {
            chunks: HashMap::new(),
            nextchunkid: 1,
            waiting: HashMap::new(),
            matrix: [[0; MATRIX_SIZE]; MATRIX_SIZE],
        }
    }

    pub fn get(&self, chunkid: u64) -> Option<&ChunkEntry> {
        self.chunks.get(&chunkid)
    }

    pub fn count(&self) -> usize {
        self.chunks.len()
    }

    pub fn next_chunkid(&self) -> u64 {
        self.nextchunkid
    }

    /// Replication-state matrix: cell [goal][valid copies].
    pub fn matrix(&self) -> &[[u32; MATRIX_SIZE]; MATRIX_SIZE] {
        &self.matrix
    }

    fn matrix_cell(e: &ChunkEntry) -> (usize, usize) {
        (e.goal.min(MATRIX_SIZE as u8 - 1) as usize, e.valid_copies() as usize)
    }

    fn matrix_add(&mut self, e: &ChunkEntry) {
        let (g, v) = Self::matrix_cell(e);
        self.matrix[g][v] += 1;
    }

    fn matrix_del(&mut self, e: &ChunkEntry) {
        let (g, v) = Self::matrix_cell(e);
        self.matrix[g][v] = self.matrix[g][v].saturating_sub(1);
    }

    /// Allocate a fresh chunk for (inode, indx), locked for writing.
    pub fn create(&mut self, ts: u32, inode: u32, indx: u32, goal: u8) -> (u64, u32) {
        let chunkid = self.nextchunkid;
        self.nextchunkid += 1;
        let e = ChunkEntry {
            chunkid,
            version: 1,
            lockedto: ts + CHUNK_LOCK_TIMEOUT,
            archflag: false,
            goal,
            refs: vec![(inode, indx)],
            servers: Vec::new(),
        };
        self.matrix_add(&e);
        self.chunks.insert(chunkid, e);
        (chunkid, 1)
    }

    /// Bump the version and take the write lock. `Locked` while another
    /// writer holds the lease.
    pub fn open_for_write(&mut self, ts: u32, chunkid: u64) -> Result<u32, MfsStatus> {
        let e = self.chunks.get_mut(&chunkid).ok_or(MfsStatus::NoChunk)?;
        if e.locked(ts) {
            return Err(MfsStatus::Locked);
        }
        e.version += 1;
        e.lockedto = ts + CHUNK_LOCK_TIMEOUT;
        Ok(e.version)
    }

    /// Release the write lock. Returns the waiters to retry.
    pub fn unlock(&mut self, chunkid: u64) -> Vec<ChunkWaiter> {
        if let Some(e) = self.chunks.get_mut(&chunkid) {
            e.lockedto = 0;
        }
        self.waiting.remove(&chunkid).unwrap_or_default()
    }

    /// Park a request on the chunk's wait FIFO.
    pub fn add_waiter(&mut self, chunkid: u64, mut w: ChunkWaiter, ts: u32) {
        w.deadline = ts + CHUNK_WAIT_TIMEOUT;
        self.waiting.entry(chunkid).or_default().push(w);
    }

    /// Expire parked requests; each timed-out waiter is returned with the
    /// status that originally blocked it.
    pub fn expire_waiters(&mut self, ts: u32) -> Vec<ChunkWaiter> {
        let mut out = Vec::new();
        self.waiting.retain(|_, ws| {
            ws.retain(|w| {
                if w.deadline <= ts {
                    out.push(*w);
                    false
                } else {
                    true
                }
            });
            !ws.is_empty()
        });
        out
    }

    pub fn has_waiters(&self, chunkid: u64) -> bool {
        self.waiting.contains_key(&chunkid)
    }

    /// Add a file back-reference.
    pub fn add_ref(&mut self, chunkid: u64, inode: u32, indx: u32) -> MfsStatus {
        match self.chunks.get_mut(&chunkid) {
            Some(e) => {
                if !e.refs.contains(&(inode, indx)) {
                    e.refs.push((inode, indx));
                }
                MfsStatus::Ok
            }
            None => MfsStatus::NoChunk,
        }
    }

    /// Drop a file back-reference; the chunk disappears with its last
    /// reference once no writer holds it.
    pub fn del_ref(&mut self, ts: u32, chunkid: u64, inode: u32, indx: u32) -> bool {
        let remove = match self.chunks.get_mut(&chunkid) {
            Some(e) => {
                e.refs.retain(|&r| r != (inode, indx));
                e.refs.is_empty() && !e.locked(ts)
            }
            None => false,
        };
        if remove {
            let e = self.chunks.remove(&chunkid).unwrap();
            self.matrix_del(&e);
            self.waiting.remove(&chunkid);
            debug!("chunk {:016X} deleted with last reference", chunkid);
        }
        remove
    }

    /// Update the goal of a chunk when its referencing files change class.
    pub fn set_goal(&mut self, chunkid: u64, goal: u8) {
        if let Some(mut e) = self.chunks.remove(&chunkid) {
            self.matrix_del(&e);
            e.goal = goal;
            self.matrix_add(&e);
            self.chunks.insert(chunkid, e);
        }
    }

    /// A chunk server reports one local chunk.
    pub fn server_report(&mut self, csid: u16, chunkid: u64, version: u32) -> ReportAction {
        match self.chunks.get_mut(&chunkid) {
            None => ReportAction::Delete,
            Some(e) => {
                if version != e.version {
                    // stale replica; the current one will be re-replicated
                    e.servers.retain(|&s| s != csid);
                    ReportAction::Delete
                } else {
                    if !e.servers.contains(&csid) {
                        let (g, v) = Self::matrix_cell(e);
                        e.servers.push(csid);
                        let (g2, v2) = Self::matrix_cell(e);
                        self.matrix[g][v] = self.matrix[g][v].saturating_sub(1);
                        self.matrix[g2][v2] += 1;
                    }
                    ReportAction::Keep
                }
            }
        }
    }

    /// A chunk server went away: forget its copies.
    pub fn server_lost(&mut self, csid: u16) {
        let ids: Vec<u64> = self.chunks.keys().copied().collect();
        for id in ids {
            let e = self.chunks.get_mut(&id).unwrap();
            if e.servers.contains(&csid) {
                let (g, v) = Self::matrix_cell(e);
                e.servers.retain(|&s| s != csid);
                let (g2, v2) = Self::matrix_cell(e);
                self.matrix[g][v] = self.matrix[g][v].saturating_sub(1);
                self.matrix[g2][v2] += 1;
            }
        }
    }

    /// Version and copy holders for a read or write open. Servers are
    /// returned in reported order; the caller applies its topology sort.
    pub fn version_and_servers(&self, chunkid: u64) -> Result<(u32, &[u16]), MfsStatus> {
        let e = self.chunks.get(&chunkid).ok_or(MfsStatus::NoChunk)?;
        Ok((e.version, &e.servers))
    }

    pub fn set_archflag(&mut self, chunkid: u64, archflag: bool) -> MfsStatus {
        match self.chunks.get_mut(&chunkid) {
            Some(e) => {
                e.archflag = archflag;
                MfsStatus::Ok
            }
            None => MfsStatus::NoChunk,
        }
    }

    /* replay entry points */

    pub fn mr_chunkadd(&mut self, chunkid: u64, version: u32, lockedto: u32) -> MfsStatus {
        if self.chunks.contains_key(&chunkid) {
            return MfsStatus::ChunkExist;
        }
        if chunkid >= self.nextchunkid {
            self.nextchunkid = chunkid + 1;
        }
        let e = ChunkEntry {
            chunkid,
            version,
            lockedto,
            archflag: false,
            goal: 0,
            refs: Vec::new(),
            servers: Vec::new(),
        };
        self.matrix_add(&e);
        self.chunks.insert(chunkid, e);
        MfsStatus::Ok
    }

    pub fn mr_chunkdel(&mut self, chunkid: u64, version: u32) -> MfsStatus {
        match self.chunks.get(&chunkid) {
            Some(e) if e.version == version => {
                let e = self.chunks.remove(&chunkid).unwrap();
                self.matrix_del(&e);
                MfsStatus::Ok
            }
            Some(_) => MfsStatus::WrongVersion,
            None => MfsStatus::NoChunk,
        }
    }

    pub fn mr_set_version(&mut self, chunkid: u64, version: u32) -> MfsStatus {
        match self.chunks.get_mut(&chunkid) {
            Some(e) => {
                e.version = version;
                MfsStatus::Ok
            }
            None => MfsStatus::NoChunk,
        }
    }

    pub fn mr_increase_version(&mut self, chunkid: u64) -> MfsStatus {
        match self.chunks.get_mut(&chunkid) {
            Some(e) => {
                e.version += 1;
                MfsStatus::Ok
            }
            None => MfsStatus::NoChunk,
        }
    }

    pub fn mr_unlock(&mut self, chunkid: u64) -> MfsStatus {
        match self.chunks.get_mut(&chunkid) {
            Some(e) => {
                e.lockedto = 0;
                MfsStatus::Ok
            }
            None => MfsStatus::NoChunk,
        }
    }

    pub fn mr_nextchunkid(&mut self, chunkid: u64) -> MfsStatus {
        self.nextchunkid = chunkid;
        MfsStatus::Ok
    }

    /// Re-create a write performed before the crash: allocate (or bump)
    /// exactly the chunk the journal line names.
    pub fn mr_write(&mut self, ts: u32, chunkid: u64, new_chunk: bool) -> MfsStatus {
        if new_chunk {
            if chunkid != self.nextchunkid {
                return MfsStatus::Mismatch;
            }
            self.nextchunkid += 1;
            let e = ChunkEntry {
                chunkid,
                version: 1,
                lockedto: ts + CHUNK_LOCK_TIMEOUT,
                archflag: false,
                goal: 0,
                refs: Vec::new(),
                servers: Vec::new(),
            };
            self.matrix_add(&e);
            self.chunks.insert(chunkid, e);
            MfsStatus::Ok
        } else {
            match self.chunks.get_mut(&chunkid) {
                Some(e) => {
                    e.version += 1;
                    e.lockedto = ts + CHUNK_LOCK_TIMEOUT;
                    MfsStatus::Ok
                }
                None => MfsStatus::NoChunk,
            }
        }
    }

    /// Attach a back-reference during image/changelog reconstruction.
    pub fn attach_ref(&mut self, chunkid: u64, inode: u32, indx: u32, goal: u8) {
        if let Some(mut e) = self.chunks.remove(&chunkid) {
            self.matrix_del(&e);
            if !e.refs.contains(&(inode, indx)) {
                e.refs.push((inode, indx));
            }
            if goal > e.goal {
                e.goal = goal;
            }
            self.matrix_add(&e);
            self.chunks.insert(chunkid, e);
        }
    }

    /* image section serialization, minor version 0x10 */

    pub fn store(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(&self.nextchunkid.to_be_bytes())?;
        let mut ids: Vec<u64> = self.chunks.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let e = &self.chunks[&id];
            w.write_all(&e.chunkid.to_be_bytes())?;
            w.write_all(&e.version.to_be_bytes())?;
            w.write_all(&e.lockedto.to_be_bytes())?;
            w.write_all(&[e.archflag as u8])?;
        }
        w.write_all(&[0u8; 17])?;
        Ok(())
    }

    /// Back-references and goals are rebuilt afterwards from the node
    /// table (`attach_ref`), not stored here.
    pub fn load(data: &[u8]) -> Result<ChunkIndex> {
        let mut idx = ChunkIndex::new();
        let mut c = Cursor::new(data);
        idx.nextchunkid = c.get_u64()?;
        loop {
            let chunkid = c.get_u64()?;
            let version = c.get_u32()?;
            let lockedto = c.get_u32()?;
            let archflag = c.get_u8()?;
            if chunkid == 0 && version == 0 && lockedto == 0 {
                break;
            }
            let e = ChunkEntry {
                chunkid,
                version,
                lockedto,
                archflag: archflag != 0,
                goal: 0,
                refs: Vec::new(),
                servers: Vec::new(),
            };
            idx.matrix_add(&e);
            idx.chunks.insert(chunkid, e);
        }
        Ok(idx)
    }
}

impl Default for ChunkIndex {
    fn default() -> Self {
        ChunkIndex::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn create_allocates_sequential_ids() {
        let mut idx = ChunkIndex::new();
        let (c1, v1) = idx.create(1000, 5, 0, 2);
        let (c2, _) = idx.create(1000, 5, 1, 2);
        assert_eq!(c1, 1);
        assert_eq!(c2, 2);
        assert_eq!(v1, 1);
        assert!(idx.get(c1).unwrap().locked(1000));
    }

    #[test]
    fn open_for_write_bumps_version_and_locks() {
        let mut idx = ChunkIndex::new();
        let (c, _) = idx.create(1000, 5, 0, 2);
        idx.unlock(c);
        let v = idx.open_for_write(2000, c).unwrap();
        assert_eq!(v, 2);
        // a second writer is refused while the lease holds
        assert_eq!(idx.open_for_write(2001, c), Err(MfsStatus::Locked));
        // the lease expires by itself
        let v = idx.open_for_write(2000 + CHUNK_LOCK_TIMEOUT + 1, c).unwrap();
        assert_eq!(v, 3);
    }

    #[test]
    fn waiters_wake_on_unlock() {
        let mut idx = ChunkIndex::new();
        let (c, _) = idx.create(1000, 5, 0, 2);
        let w = ChunkWaiter {
            sessionid: 7,
            msgid: 55,
            inode: 5,
            indx: 0,
            write: false,
            deadline: 0,
            status: MfsStatus::Locked,
        };
        idx.add_waiter(c, w, 1000);
        assert!(idx.has_waiters(c));
        let woken = idx.unlock(c);
        assert_eq!(woken.len(), 1);
        assert_eq!(woken[0].sessionid, 7);
        assert!(!idx.has_waiters(c));
    }

    #[test]
    fn waiters_expire_with_original_status() {
        let mut idx = ChunkIndex::new();
        let (c, _) = idx.create(1000, 5, 0, 2);
        let w = ChunkWaiter {
            sessionid: 7,
            msgid: 55,
            inode: 5,
            indx: 0,
            write: true,
            deadline: 0,
            status: MfsStatus::Locked,
        };
        idx.add_waiter(c, w, 1000);
        assert!(idx.expire_waiters(1000 + CHUNK_WAIT_TIMEOUT - 1).is_empty());
        let out = idx.expire_waiters(1000 + CHUNK_WAIT_TIMEOUT);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].status, MfsStatus::Locked);
    }

    #[test]
    fn stale_replicas_are_deleted() {
        let mut idx = ChunkIndex::new();
        let (c, _) = idx.create(1000, 5, 0, 2);
        idx.unlock(c);
        assert_eq!(idx.server_report(1, c, 1), ReportAction::Keep);
        assert_eq!(idx.server_report(2, c, 1), ReportAction::Keep);
        assert_eq!(idx.get(c).unwrap().valid_copies(), 2);
        idx.open_for_write(5000, c).unwrap();
        // server 1 still reports the old version
        assert_eq!(idx.server_report(1, c, 1), ReportAction::Delete);
        assert_eq!(idx.get(c).unwrap().valid_copies(), 1);
        assert_eq!(idx.server_report(1, c, 2), ReportAction::Keep);
        // unknown chunk
        assert_eq!(idx.server_report(1, 0xDEAD, 1), ReportAction::Delete);
    }

    #[test]
    fn refs_hold_the_chunk_alive() {
        let mut idx = ChunkIndex::new();
        let (c, _) = idx.create(1000, 5, 0, 2);
        idx.add_ref(c, 6, 3);
        idx.unlock(c);
        assert!(!idx.del_ref(2000, c, 5, 0));
        assert!(idx.get(c).is_some());
        assert!(idx.del_ref(2000, c, 6, 3));
        assert!(idx.get(c).is_none());
    }

    #[test]
    fn locked_chunk_survives_last_unref() {
        let mut idx = ChunkIndex::new();
        let (c, _) = idx.create(1000, 5, 0, 2);
        // still write-locked
        assert!(!idx.del_ref(1001, c, 5, 0));
        assert!(idx.get(c).is_some());
    }

    #[test]
    fn matrix_tracks_goal_and_copies() {
        let mut idx = ChunkIndex::new();
        let (c, _) = idx.create(1000, 5, 0, 2);
        assert_eq!(idx.matrix()[2][0], 1);
        idx.unlock(c);
        idx.server_report(1, c, 1);
        assert_eq!(idx.matrix()[2][0], 0);
        assert_eq!(idx.matrix()[2][1], 1);
        idx.server_lost(1);
        assert_eq!(idx.matrix()[2][0], 1);
        idx.set_goal(c, 3);
        assert_eq!(idx.matrix()[2][0], 0);
        assert_eq!(idx.matrix()[3][0], 1);
    }

    #[test]
    fn store_load_roundtrip() -> Result<()> {
        let mut idx = ChunkIndex::new();
        let (c1, _) = idx.create(1000, 5, 0, 2);
        let (c2, _) = idx.create(1000, 5, 1, 2);
        idx.unlock(c2);
        idx.set_archflag(c1, true);
        let mut buf = Vec::new();
        idx.store(&mut buf)?;
        let idx2 = ChunkIndex::load(&buf)?;
        assert_eq!(idx2.next_chunkid(), idx.next_chunkid());
        assert!(idx2.get(c1).unwrap().archflag);
        assert_eq!(idx2.get(c2).unwrap().version, 1);
        Ok(())
    }

    #[test]
    fn replay_checks_expected_chunkid() {
        let mut idx = ChunkIndex::new();
        assert_eq!(idx.mr_write(0, 1, true), MfsStatus::Ok);
        assert_eq!(idx.mr_write(0, 5, true), MfsStatus::Mismatch);
        assert_eq!(idx.mr_write(0, 1, false), MfsStatus::Ok);
        assert_eq!(idx.get(1).unwrap().version, 2);
        assert_eq!(idx.mr_unlock(1), MfsStatus::Ok);
        assert_eq!(idx.mr_chunkdel(1, 2), MfsStatus::Ok);
        assert_eq!(idx.mr_chunkdel(1, 2), MfsStatus::NoChunk);
    }
}
