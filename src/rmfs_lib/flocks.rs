//! BSD (flock) whole-file advisory locks.
//!
//! Per inode: a set of active locks (one writer, or any number of
//! readers) and a FIFO queue of waiters. Three scheduling modes mirror
//! the kernels the clients run on: `Correct` is the classic
//! readers-writers algorithm where a queued writer blocks later readers,
//! `Linux` wakes every compatible waiter on release, `Bsd` wakes only the
//! head-contiguous readers or the single next writer. Lock acquisition
//! and release of active locks is journaled; waiters are volatile.

use std::collections::HashMap;
use std::io::Write;

use anyhow::Result;
use log::warn;

use crate::rmfs_lib::changelog::Changelog;
use crate::rmfs_lib::codec::Cursor;
use crate::rmfs_lib::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlockSchedMode {
    Correct,
    Bsd,
    Linux,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LType {
    Reader,
    Writer,
}

#[derive(Debug, Clone, Copy)]
struct Instance {
    msgid: u32,
    reqid: u32,
}

#[derive(Debug)]
struct Lock {
    owner: u64,
    sessionid: u32,
    ltype: LType,
    instances: Vec<Instance>,
}

#[derive(Default)]
struct InodeLocks {
    active: Vec<Lock>,
    waiting: Vec<Lock>,
}

/// A deferred reply for a waiter that has just been woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockWakeUp {
    pub sessionid: u32,
    pub msgid: u32,
    pub status: MfsStatus,
}

pub struct FlockTable {
    mode: FlockSchedMode,
    inodes: HashMap<u32, InodeLocks>,
    wakeups: Vec<LockWakeUp>,
}

fn ltype_char(ltype: LType) -> char {
    match ltype {
        LType::Reader => 'R',
        LType::Writer => 'W',
    }
}

impl FlockTable {
    pub fn new(mode: FlockSchedMode) -> FlockTable {
        FlockTable { mode, inodes: HashMap::new(), wakeups: Vec::new() }
    }

    /// Wake-ups produced by the last operations; the dispatcher sends the
    /// deferred replies and clears the list.
    pub fn take_wakeups(&mut self) -> Vec<LockWakeUp> {
        std::mem::take(&mut self.wakeups)
    }

    fn wake_all(wakeups: &mut Vec<LockWakeUp>, l: &mut Lock, status: MfsStatus) {
        for i in l.instances.drain(..) {
            wakeups.push(LockWakeUp { sessionid: l.sessionid, msgid: i.msgid, status });
        }
    }

    fn wake_one(wakeups: &mut Vec<LockWakeUp>, l: &mut Lock, reqid: u32, status: MfsStatus) {
        l.instances.retain(|i| {
            if i.reqid == reqid {
                wakeups.push(LockWakeUp { sessionid: l.sessionid, msgid: i.msgid, status });
                false
            } else {
                true
            }
        });
    }

    fn journal_lock(chlog: &mut Changelog, ts: u32, inode: u32, l: &Lock) {
        chlog.append(&format!(
            "{}|FLOCK({},{},{},{})",
            ts,
            inode,
            l.sessionid,
            l.owner,
            ltype_char(l.ltype)
        ));
    }

    fn journal_unlock(chlog: &mut Changelog, ts: u32, inode: u32, l: &Lock) {
        chlog.append(&format!("{}|FLOCK({},{},{},U)", ts, inode, l.sessionid, l.owner));
    }

    // would a new lock of `ltype` have to wait?
    fn blocked(mode: FlockSchedMode, il: &InodeLocks, ltype: LType) -> bool {
        match ltype {
            LType::Reader => {
                if il.active.first().map(|l| l.ltype) == Some(LType::Writer) {
                    return true;
                }
                // classic readers/writers: a queued lock blocks further
                // readers even while readers hold the file, so writers
                // cannot starve
                mode == FlockSchedMode::Correct && !il.waiting.is_empty()
            }
            LType::Writer => !il.active.is_empty(),
        }
    }

    fn append_req(l: &mut Lock, msgid: u32, reqid: u32) {
        for i in &mut l.instances {
            if i.reqid == reqid {
                i.msgid = msgid;
                return;
            }
        }
        l.instances.push(Instance { msgid, reqid });
    }

    fn lock_new(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        inode: u32,
        ltype: LType,
        sessionid: u32,
        msgid: u32,
        reqid: u32,
        owner: u64,
    ) -> MfsStatus {
        let il = self.inodes.entry(inode).or_default();
        let mut l = Lock { owner, sessionid, ltype, instances: Vec::new() };
        if Self::blocked(self.mode, il, ltype) {
            Self::append_req(&mut l, msgid, reqid);
            il.waiting.push(l);
            return MfsStatus::Waiting;
        }
        Self::journal_lock(chlog, ts, inode, &l);
        il.active.push(l);
        MfsStatus::Ok
    }

    fn check_waiting(&mut self, chlog: &mut Changelog, ts: u32, inode: u32) {
        let il = match self.inodes.get_mut(&inode) {
            Some(il) => il,
            None => return,
        };
        if il.active.is_empty() && il.waiting.first().map(|l| l.ltype) == Some(LType::Writer) {
            let mut l = il.waiting.remove(0);
            Self::wake_all(&mut self.wakeups, &mut l, MfsStatus::Ok);
            Self::journal_lock(chlog, ts, inode, &l);
            il.active.push(l);
        }
        if il.active.is_empty() || il.active.first().map(|l| l.ltype) == Some(LType::Reader) {
            if self.mode == FlockSchedMode::Linux {
                // wake every compatible waiter, wherever it queues
                let mut i = 0;
                while i < il.waiting.len() {
                    if il.waiting[i].ltype == LType::Reader {
                        let mut l = il.waiting.remove(i);
                        Self::wake_all(&mut self.wakeups, &mut l, MfsStatus::Ok);
                        Self::journal_lock(chlog, ts, inode, &l);
                        il.active.push(l);
                    } else {
                        i += 1;
                    }
                }
            } else {
                // FreeBSD/OSX and the classic algorithm: head-contiguous
                // readers only
                while il.waiting.first().map(|l| l.ltype) == Some(LType::Reader) {
                    let mut l = il.waiting.remove(0);
                    Self::wake_all(&mut self.wakeups, &mut l, MfsStatus::Ok);
                    Self::journal_lock(chlog, ts, inode, &l);
                    il.active.push(l);
                }
            }
        }
    }

    fn unlock_active(&mut self, chlog: &mut Changelog, ts: u32, inode: u32, idx: usize) {
        let il = self.inodes.get_mut(&inode).unwrap();
        let l = il.active.remove(idx);
        Self::journal_unlock(chlog, ts, inode, &l);
        let recheck = il.active.is_empty() && !il.waiting.is_empty();
        if recheck {
            self.check_waiting(chlog, ts, inode);
        }
        self.gc(inode);
    }

    fn gc(&mut self, inode: u32) {
        if let Some(il) = self.inodes.get(&inode) {
            if il.active.is_empty() && il.waiting.is_empty() {
                self.inodes.remove(&inode);
            }
        }
    }

    /// One flock protocol command. `opened` tells whether the open-file
    /// table holds (sessionid, inode); lock/try operations on a file the
    /// session has not opened are refused.
    #[allow(clippy::too_many_arguments)]
    pub fn cmd(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        sessionid: u32,
        msgid: u32,
        reqid: u32,
        inode: u32,
        owner: u64,
        op: u8,
        opened: bool,
    ) -> MfsStatus {
        if op != FLOCK_INTERRUPT && op != FLOCK_RELEASE && !opened {
            return MfsStatus::NotOpened;
        }
        if !self.inodes.contains_key(&inode) {
            if op == FLOCK_UNLOCK || op == FLOCK_INTERRUPT || op == FLOCK_RELEASE {
                return MfsStatus::Ok;
            }
        }
        if op == FLOCK_INTERRUPT {
            if let Some(il) = self.inodes.get_mut(&inode) {
                let mut i = 0;
                while i < il.waiting.len() {
                    let l = &mut il.waiting[i];
                    if l.sessionid == sessionid && l.owner == owner {
                        Self::wake_one(&mut self.wakeups, l, reqid, MfsStatus::EIntr);
                        if l.instances.is_empty() {
                            il.waiting.remove(i);
                            continue;
                        }
                    }
                    i += 1;
                }
            }
            self.gc(inode);
            return MfsStatus::Ok;
        }

        // active lock held by this (session, owner)?
        let active_idx = self
            .inodes
            .get(&inode)
            .and_then(|il| il.active.iter().position(|l| l.sessionid == sessionid && l.owner == owner));
        if let Some(idx) = active_idx {
            match op {
                FLOCK_UNLOCK | FLOCK_RELEASE => {
                    self.unlock_active(chlog, ts, inode, idx);
                    return MfsStatus::Ok;
                }
                FLOCK_TRY_SHARED => {
                    let il = self.inodes.get_mut(&inode).unwrap();
                    if il.active[idx].ltype == LType::Writer {
                        il.active[idx].ltype = LType::Reader;
                        self.check_waiting(chlog, ts, inode);
                    }
                    return MfsStatus::Ok;
                }
                FLOCK_LOCK_SHARED => {
                    if self.inodes[&inode].active[idx].ltype == LType::Reader {
                        return MfsStatus::Ok;
                    }
                    self.unlock_active(chlog, ts, inode, idx);
                    return self
                        .lock_new(chlog, ts, inode, LType::Reader, sessionid, msgid, reqid, owner);
                }
                FLOCK_TRY_EXCLUSIVE => {
                    let il = self.inodes.get_mut(&inode).unwrap();
                    if il.active[idx].ltype == LType::Writer {
                        return MfsStatus::Ok;
                    }
                    if il.active.len() == 1 {
                        il.active[idx].ltype = LType::Writer;
                        return MfsStatus::Ok;
                    }
                    return MfsStatus::EAgain;
                }
                FLOCK_LOCK_EXCLUSIVE => {
                    if self.inodes[&inode].active[idx].ltype == LType::Writer {
                        return MfsStatus::Ok;
                    }
                    self.unlock_active(chlog, ts, inode, idx);
                    return self
                        .lock_new(chlog, ts, inode, LType::Writer, sessionid, msgid, reqid, owner);
                }
                _ => return MfsStatus::EInval,
            }
        }
        // waiting lock of this (session, owner)?
        let waiting_idx = self
            .inodes
            .get(&inode)
            .and_then(|il| il.waiting.iter().position(|l| l.sessionid == sessionid && l.owner == owner));
        if let Some(idx) = waiting_idx {
            match op {
                FLOCK_RELEASE => {
                    let il = self.inodes.get_mut(&inode).unwrap();
                    let mut l = il.waiting.remove(idx);
                    Self::wake_all(&mut self.wakeups, &mut l, MfsStatus::ECanceled);
                    self.gc(inode);
                    return MfsStatus::Ok;
                }
                FLOCK_UNLOCK => {
                    if self.mode == FlockSchedMode::Correct {
                        let il = self.inodes.get_mut(&inode).unwrap();
                        let mut l = il.waiting.remove(idx);
                        Self::wake_all(&mut self.wakeups, &mut l, MfsStatus::ECanceled);
                        self.gc(inode);
                    }
                    // other modes: tested kernels just ignore an unlock of
                    // a still-waiting request
                    return MfsStatus::Ok;
                }
                FLOCK_TRY_SHARED | FLOCK_TRY_EXCLUSIVE => return MfsStatus::EAgain,
                FLOCK_LOCK_SHARED => {
                    let il = self.inodes.get_mut(&inode).unwrap();
                    let l = &mut il.waiting[idx];
                    if l.ltype != LType::Reader {
                        Self::wake_all(&mut self.wakeups, l, MfsStatus::ECanceled);
                        l.ltype = LType::Reader;
                    }
                    Self::append_req(l, msgid, reqid);
                    return MfsStatus::Waiting;
                }
                FLOCK_LOCK_EXCLUSIVE => {
                    let il = self.inodes.get_mut(&inode).unwrap();
                    let l = &mut il.waiting[idx];
                    if l.ltype != LType::Writer {
                        Self::wake_all(&mut self.wakeups, l, MfsStatus::ECanceled);
                        l.ltype = LType::Writer;
                    }
                    Self::append_req(l, msgid, reqid);
                    return MfsStatus::Waiting;
                }
                _ => return MfsStatus::EInval,
            }
        }
        if op == FLOCK_UNLOCK || op == FLOCK_RELEASE {
            return MfsStatus::Ok;
        }
        let ltype = if op == FLOCK_TRY_SHARED || op == FLOCK_LOCK_SHARED {
            LType::Reader
        } else {
            LType::Writer
        };
        if op == FLOCK_TRY_SHARED || op == FLOCK_TRY_EXCLUSIVE {
            let il = self.inodes.entry(inode).or_default();
            if Self::blocked(self.mode, il, ltype) {
                self.gc(inode);
                return MfsStatus::EAgain;
            }
        }
        self.lock_new(chlog, ts, inode, ltype, sessionid, msgid, reqid, owner)
    }

    /// Tear down every lock of (sessionid, inode); called when the file is
    /// closed or the session dies. Waiters disappear without a reply.
    pub fn file_closed(&mut self, chlog: &mut Changelog, ts: u32, sessionid: u32, inode: u32) {
        let il = match self.inodes.get_mut(&inode) {
            Some(il) => il,
            None => return,
        };
        il.waiting.retain(|l| l.sessionid != sessionid);
        let mut removed = false;
        let mut i = 0;
        while i < il.active.len() {
            if il.active[i].sessionid == sessionid {
                let l = il.active.remove(i);
                Self::journal_unlock(chlog, ts, inode, &l);
                removed = true;
            } else {
                i += 1;
            }
        }
        if removed {
            let recheck = {
                let il = self.inodes.get(&inode).unwrap();
                il.active.is_empty() && !il.waiting.is_empty()
            };
            if recheck {
                self.check_waiting(chlog, ts, inode);
            }
        }
        self.gc(inode);
    }

    /// Active locks for the admin listing; whole table with `inode == 0`.
    pub fn list(&self, inode: u32) -> Vec<(u32, u32, u64, u8)> {
        let mut out = Vec::new();
        let mut push = |ino: u32, il: &InodeLocks| {
            for l in &il.active {
                let t = match l.ltype {
                    LType::Reader => 1,
                    LType::Writer => 2,
                };
                out.push((ino, l.sessionid, l.owner, t));
            }
        };
        if inode == 0 {
            let mut inodes: Vec<u32> = self.inodes.keys().copied().collect();
            inodes.sort_unstable();
            for ino in inodes {
                push(ino, &self.inodes[&ino]);
            }
        } else if let Some(il) = self.inodes.get(&inode) {
            push(inode, il);
        }
        out
    }

    /// Changelog replay of FLOCK lines.
    pub fn mr_change(&mut self, inode: u32, sessionid: u32, owner: u64, cmd: char) -> MfsStatus {
        match cmd.to_ascii_uppercase() {
            'U' => {
                if !self.inodes.contains_key(&inode) {
                    return MfsStatus::Mismatch;
                }
                let il = self.inodes.get_mut(&inode).unwrap();
                il.active.retain(|l| !(l.sessionid == sessionid && l.owner == owner));
                self.gc(inode);
                MfsStatus::Ok
            }
            c @ ('R' | 'S' | 'W' | 'E') => {
                let ltype = if c == 'R' || c == 'S' { LType::Reader } else { LType::Writer };
                let il = self.inodes.entry(inode).or_default();
                if !il.active.is_empty()
                    && (il.active[0].ltype == LType::Writer || ltype == LType::Writer)
                {
                    return MfsStatus::Mismatch;
                }
                il.active.push(Lock { owner, sessionid, ltype, instances: Vec::new() });
                MfsStatus::Ok
            }
            _ => MfsStatus::EInval,
        }
    }

    /* image section serialization, minor version 0x10; active locks only */

    pub fn store(&self, w: &mut impl Write) -> Result<()> {
        let mut inodes: Vec<u32> = self.inodes.keys().copied().collect();
        inodes.sort_unstable();
        for ino in inodes {
            for l in &self.inodes[&ino].active {
                w.write_all(&ino.to_be_bytes())?;
                w.write_all(&l.owner.to_be_bytes())?;
                w.write_all(&l.sessionid.to_be_bytes())?;
                w.write_all(&[match l.ltype {
                    LType::Reader => 0,
                    LType::Writer => 1,
                }])?;
            }
        }
        w.write_all(&[0u8; 17])?;
        Ok(())
    }

    pub fn load(
        &mut self,
        data: &[u8],
        ignoreflag: bool,
        opened: impl Fn(u32, u32) -> bool,
    ) -> Result<()> {
        let mut c = Cursor::new(data);
        loop {
            let inode = c.get_u32()?;
            let owner = c.get_u64()?;
            let sessionid = c.get_u32()?;
            let ltype = c.get_u8()?;
            if inode == 0 && owner == 0 && sessionid == 0 {
                return Ok(());
            }
            if !opened(sessionid, inode) {
                if ignoreflag {
                    warn!("loading flock locks: lock on closed file (ignored)");
                    continue;
                }
                anyhow::bail!("loading flock locks: lock on closed file");
            }
            let ltype = if ltype == 1 { LType::Writer } else { LType::Reader };
            let il = self.inodes.entry(inode).or_default();
            if !il.active.is_empty()
                && (il.active[0].ltype == LType::Writer || ltype == LType::Writer)
            {
                if ignoreflag {
                    warn!("loading flock locks: incompatible lock (ignored)");
                    continue;
                }
                anyhow::bail!("loading flock locks: incompatible lock");
            }
            il.active.push(Lock { owner, sessionid, ltype, instances: Vec::new() });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(
        t: &mut FlockTable,
        cl: &mut Changelog,
        sid: u32,
        reqid: u32,
        inode: u32,
        owner: u64,
        op: u8,
    ) -> MfsStatus {
        t.cmd(cl, 0, sid, reqid * 10, reqid, inode, owner, op, true)
    }

    #[test]
    fn readers_share_writer_excludes() {
        let mut t = FlockTable::new(FlockSchedMode::Correct);
        let mut cl = Changelog::memory();
        assert_eq!(lock(&mut t, &mut cl, 1, 1, 5, 11, FLOCK_LOCK_SHARED), MfsStatus::Ok);
        assert_eq!(lock(&mut t, &mut cl, 2, 2, 5, 22, FLOCK_LOCK_SHARED), MfsStatus::Ok);
        assert_eq!(lock(&mut t, &mut cl, 3, 3, 5, 33, FLOCK_LOCK_EXCLUSIVE), MfsStatus::Waiting);
        assert_eq!(lock(&mut t, &mut cl, 4, 4, 5, 44, FLOCK_TRY_SHARED), MfsStatus::EAgain);
    }

    #[test]
    fn correct_mode_scenario() {
        // R1, R2 hold; W waits; R3 queues behind W; unlocks wake W then R3
        let mut t = FlockTable::new(FlockSchedMode::Correct);
        let mut cl = Changelog::memory();
        assert_eq!(lock(&mut t, &mut cl, 1, 1, 9, 1, FLOCK_LOCK_SHARED), MfsStatus::Ok);
        assert_eq!(lock(&mut t, &mut cl, 2, 2, 9, 2, FLOCK_LOCK_SHARED), MfsStatus::Ok);
        assert_eq!(lock(&mut t, &mut cl, 3, 3, 9, 3, FLOCK_LOCK_EXCLUSIVE), MfsStatus::Waiting);
        // a new reader waits behind the queued writer
        assert_eq!(lock(&mut t, &mut cl, 4, 4, 9, 4, FLOCK_LOCK_SHARED), MfsStatus::Waiting);
        assert_eq!(lock(&mut t, &mut cl, 1, 5, 9, 1, FLOCK_UNLOCK), MfsStatus::Ok);
        assert!(t.take_wakeups().is_empty());
        assert_eq!(lock(&mut t, &mut cl, 2, 6, 9, 2, FLOCK_UNLOCK), MfsStatus::Ok);
        let w = t.take_wakeups();
        assert_eq!(w, vec![LockWakeUp { sessionid: 3, msgid: 30, status: MfsStatus::Ok }]);
        assert_eq!(lock(&mut t, &mut cl, 3, 7, 9, 3, FLOCK_UNLOCK), MfsStatus::Ok);
        let w = t.take_wakeups();
        assert_eq!(w, vec![LockWakeUp { sessionid: 4, msgid: 40, status: MfsStatus::Ok }]);
    }

    #[test]
    fn linux_mode_wakes_all_readers() {
        let mut t = FlockTable::new(FlockSchedMode::Linux);
        let mut cl = Changelog::memory();
        assert_eq!(lock(&mut t, &mut cl, 1, 1, 9, 1, FLOCK_LOCK_EXCLUSIVE), MfsStatus::Ok);
        assert_eq!(lock(&mut t, &mut cl, 2, 2, 9, 2, FLOCK_LOCK_SHARED), MfsStatus::Waiting);
        assert_eq!(lock(&mut t, &mut cl, 3, 3, 9, 3, FLOCK_LOCK_EXCLUSIVE), MfsStatus::Waiting);
        assert_eq!(lock(&mut t, &mut cl, 4, 4, 9, 4, FLOCK_LOCK_SHARED), MfsStatus::Waiting);
        assert_eq!(lock(&mut t, &mut cl, 1, 5, 9, 1, FLOCK_UNLOCK), MfsStatus::Ok);
        // both readers wake even though a writer queues between them
        let mut sids: Vec<u32> = t.take_wakeups().iter().map(|w| w.sessionid).collect();
        sids.sort_unstable();
        assert_eq!(sids, vec![2, 4]);
    }

    #[test]
    fn bsd_mode_wakes_head_contiguous_only() {
        let mut t = FlockTable::new(FlockSchedMode::Bsd);
        let mut cl = Changelog::memory();
        assert_eq!(lock(&mut t, &mut cl, 1, 1, 9, 1, FLOCK_LOCK_EXCLUSIVE), MfsStatus::Ok);
        assert_eq!(lock(&mut t, &mut cl, 2, 2, 9, 2, FLOCK_LOCK_SHARED), MfsStatus::Waiting);
        assert_eq!(lock(&mut t, &mut cl, 3, 3, 9, 3, FLOCK_LOCK_EXCLUSIVE), MfsStatus::Waiting);
        assert_eq!(lock(&mut t, &mut cl, 4, 4, 9, 4, FLOCK_LOCK_SHARED), MfsStatus::Waiting);
        assert_eq!(lock(&mut t, &mut cl, 1, 5, 9, 1, FLOCK_UNLOCK), MfsStatus::Ok);
        let sids: Vec<u32> = t.take_wakeups().iter().map(|w| w.sessionid).collect();
        assert_eq!(sids, vec![2]);
    }

    #[test]
    fn interrupt_wakes_with_eintr() {
        let mut t = FlockTable::new(FlockSchedMode::Correct);
        let mut cl = Changelog::memory();
        assert_eq!(lock(&mut t, &mut cl, 1, 1, 9, 1, FLOCK_LOCK_EXCLUSIVE), MfsStatus::Ok);
        assert_eq!(lock(&mut t, &mut cl, 2, 2, 9, 2, FLOCK_LOCK_EXCLUSIVE), MfsStatus::Waiting);
        assert_eq!(lock(&mut t, &mut cl, 2, 2, 9, 2, FLOCK_INTERRUPT), MfsStatus::Ok);
        let w = t.take_wakeups();
        assert_eq!(w, vec![LockWakeUp { sessionid: 2, msgid: 20, status: MfsStatus::EIntr }]);
        // nothing left waiting; the writer unlock wakes nobody
        assert_eq!(lock(&mut t, &mut cl, 1, 3, 9, 1, FLOCK_UNLOCK), MfsStatus::Ok);
        assert!(t.take_wakeups().is_empty());
    }

    #[test]
    fn release_cancels_a_waiter() {
        let mut t = FlockTable::new(FlockSchedMode::Correct);
        let mut cl = Changelog::memory();
        assert_eq!(lock(&mut t, &mut cl, 1, 1, 9, 1, FLOCK_LOCK_EXCLUSIVE), MfsStatus::Ok);
        assert_eq!(lock(&mut t, &mut cl, 2, 2, 9, 2, FLOCK_LOCK_SHARED), MfsStatus::Waiting);
        assert_eq!(lock(&mut t, &mut cl, 2, 2, 9, 2, FLOCK_RELEASE), MfsStatus::Ok);
        let w = t.take_wakeups();
        assert_eq!(w[0].status, MfsStatus::ECanceled);
    }

    #[test]
    fn unlock_of_waiter_cancels_only_in_correct_mode() {
        for (mode, cancels) in
            [(FlockSchedMode::Correct, true), (FlockSchedMode::Linux, false), (FlockSchedMode::Bsd, false)]
        {
            let mut t = FlockTable::new(mode);
            let mut cl = Changelog::memory();
            assert_eq!(lock(&mut t, &mut cl, 1, 1, 9, 1, FLOCK_LOCK_EXCLUSIVE), MfsStatus::Ok);
            assert_eq!(lock(&mut t, &mut cl, 2, 2, 9, 2, FLOCK_LOCK_SHARED), MfsStatus::Waiting);
            assert_eq!(lock(&mut t, &mut cl, 2, 3, 9, 2, FLOCK_UNLOCK), MfsStatus::Ok);
            let woken = !t.take_wakeups().is_empty();
            assert_eq!(woken, cancels, "mode {:?}", mode);
        }
    }

    #[test]
    fn file_close_releases_and_wakes_next() {
        let mut t = FlockTable::new(FlockSchedMode::Correct);
        let mut cl = Changelog::memory();
        assert_eq!(lock(&mut t, &mut cl, 1, 1, 9, 1, FLOCK_LOCK_EXCLUSIVE), MfsStatus::Ok);
        assert_eq!(lock(&mut t, &mut cl, 2, 2, 9, 2, FLOCK_LOCK_EXCLUSIVE), MfsStatus::Waiting);
        t.file_closed(&mut cl, 0, 1, 9);
        let w = t.take_wakeups();
        assert_eq!(w, vec![LockWakeUp { sessionid: 2, msgid: 20, status: MfsStatus::Ok }]);
    }

    #[test]
    fn journal_lines_for_lock_and_unlock() {
        let mut t = FlockTable::new(FlockSchedMode::Correct);
        let mut cl = Changelog::memory();
        lock(&mut t, &mut cl, 1, 1, 9, 77, FLOCK_LOCK_EXCLUSIVE);
        lock(&mut t, &mut cl, 1, 2, 9, 77, FLOCK_UNLOCK);
        assert_eq!(cl.recorded()[0], "1: 0|FLOCK(9,1,77,W)");
        assert_eq!(cl.recorded()[1], "2: 0|FLOCK(9,1,77,U)");
    }

    #[test]
    fn store_load_roundtrip() -> Result<()> {
        let mut t = FlockTable::new(FlockSchedMode::Correct);
        let mut cl = Changelog::memory();
        lock(&mut t, &mut cl, 1, 1, 9, 1, FLOCK_LOCK_SHARED);
        lock(&mut t, &mut cl, 2, 2, 9, 2, FLOCK_LOCK_SHARED);
        lock(&mut t, &mut cl, 3, 3, 8, 3, FLOCK_LOCK_EXCLUSIVE);
        let mut buf = Vec::new();
        t.store(&mut buf)?;
        let mut t2 = FlockTable::new(FlockSchedMode::Correct);
        t2.load(&buf, false, |_, _| true)?;
        assert_eq!(t2.list(0), t.list(0));
        Ok(())
    }

    #[test]
    fn load_rejects_lock_on_closed_file() -> Result<()> {
        let mut t = FlockTable::new(FlockSchedMode::Correct);
        let mut cl = Changelog::memory();
        lock(&mut t, &mut cl, 1, 1, 9, 1, FLOCK_LOCK_SHARED);
        let mut buf = Vec::new();
        t.store(&mut buf)?;
        let mut t2 = FlockTable::new(FlockSchedMode::Correct);
        assert!(t2.load(&buf, false, |_, _| false).is_err());
        let mut t3 = FlockTable::new(FlockSchedMode::Correct);
        t3.load(&buf, true, |_, _| false)?;
        assert!(t3.list(0).is_empty());
        Ok(())
    }
}
