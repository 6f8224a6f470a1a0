//! POSIX (fcntl) byte-range advisory locks.
//!
//! Per (owner, session) holder the master keeps an ordered list of
//! non-overlapping half-open ranges `[start, end)` tagged read or write;
//! applying a new range is a general splice that merges neighbours of the
//! same type and never stores an unlock. Waiters queue FIFO per inode and
//! re-evaluate whenever the active set changes. Every apply is journaled.

use std::collections::HashMap;
use std::io::Write;

use anyhow::Result;
use log::warn;

use crate::rmfs_lib::changelog::Changelog;
use crate::rmfs_lib::codec::Cursor;
use crate::rmfs_lib::flocks::LockWakeUp;
use crate::rmfs_lib::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: u64,
    pub end: u64,
    pub rtype: u8,
}

#[derive(Debug)]
struct ALock {
    owner: u64,
    sessionid: u32,
    pid: u32,
    ranges: Vec<Range>,
}

#[derive(Debug, Clone, Copy)]
struct WLock {
    owner: u64,
    sessionid: u32,
    pid: u32,
    msgid: u32,
    reqid: u32,
    start: u64,
    end: u64,
    rtype: u8,
}

#[derive(Default)]
struct InodeLocks {
    active: Vec<ALock>,
    waiting: Vec<WLock>,
}

/// Splice `(rtype, [start, end))` into an ordered non-overlapping range
/// list. Seven geometric cases: disjoint before/after, covered, covering,
/// left/right overlap and the interior split.
pub fn apply_range(ranges: &mut Vec<Range>, rtype: u8, mut start: u64, end: u64) {
    let mut i = 0;
    let mut added = false;
    while !added && i < ranges.len() {
        let r = ranges[i];
        if r.end < start {
            // existing range entirely before the new one
            i += 1;
        } else if r.start > end {
            // entirely after: insert here and stop
            if rtype != POSIX_LOCK_UNLCK {
                ranges.insert(i, Range { start, end, rtype });
            }
            added = true;
        } else if start <= r.start && end >= r.end {
            // new range covers the existing one
            ranges.remove(i);
        } else if r.start < start && r.end <= end {
            // overlap on the left edge of the new range
            if r.rtype == rtype {
                start = r.start;
                ranges.remove(i);
            } else {
                ranges[i].end = start;
                i += 1;
            }
        } else if r.start >= start && r.end > end {
            // overlap on the right edge of the new range
            if r.rtype == rtype {
                ranges[i].start = start;
            } else {
                ranges[i].start = end;
                if rtype != POSIX_LOCK_UNLCK {
                    ranges.insert(i, Range { start, end, rtype });
                }
            }
            added = true;
        } else {
            // existing range strictly covers the new one
            if r.rtype != rtype {
                ranges[i].end = start;
                let tail = Range { start: end, end: r.end, rtype: r.rtype };
                if rtype != POSIX_LOCK_UNLCK {
                    ranges.insert(i + 1, Range { start, end, rtype });
                    ranges.insert(i + 2, tail);
                } else {
                    ranges.insert(i + 1, tail);
                }
            }
            added = true;
        }
    }
    if !added && rtype != POSIX_LOCK_UNLCK {
        ranges.push(Range { start, end, rtype });
    }
}

// first range of `ranges` conflicting with (rtype, [start, end)), if any
fn test_conflict(ranges: &[Range], rtype: u8, start: u64, end: u64) -> Option<Range> {
    for r in ranges {
        if (rtype == POSIX_LOCK_WRLCK || r.rtype == POSIX_LOCK_WRLCK)
            && end > r.start
            && start < r.end
        {
            return Some(*r);
        }
    }
    None
}

pub struct PosixLockTable {
    inodes: HashMap<u32, InodeLocks>,
    wakeups: Vec<LockWakeUp>,
}

impl PosixLockTable {
    pub fn new() -> PosixLockTable {
        PosixLockTable { inodes: HashMap::new(), wakeups: Vec::new() }
    }

    pub fn take_wakeups(&mut self) -> Vec<LockWakeUp> {
        std::mem::take(&mut self.wakeups)
    }

    fn gc(&mut self, inode: u32) {
        if let Some(il) = self.inodes.get(&inode) {
            if il.active.is_empty() && il.waiting.is_empty() {
                self.inodes.remove(&inode);
            }
        }
    }

    fn find_offensive(
        il: &InodeLocks,
        sessionid: u32,
        owner: u64,
        rtype: u8,
        start: u64,
        end: u64,
    ) -> Option<(Range, u32)> {
        for al in &il.active {
            if al.owner != owner || al.sessionid != sessionid {
                if let Some(r) = test_conflict(&al.ranges, rtype, start, end) {
                    return Some((r, if al.sessionid == sessionid { al.pid } else { 0 }));
                }
            }
        }
        None
    }

    fn do_apply(il: &mut InodeLocks, sessionid: u32, owner: u64, rtype: u8, start: u64, end: u64, pid: u32) {
        if let Some(idx) =
            il.active.iter().position(|al| al.owner == owner && al.sessionid == sessionid)
        {
            apply_range(&mut il.active[idx].ranges, rtype, start, end);
            if il.active[idx].ranges.is_empty() {
                il.active.remove(idx);
            }
            return;
        }
        if rtype == POSIX_LOCK_UNLCK {
            return;
        }
        let mut al = ALock { owner, sessionid, pid, ranges: Vec::new() };
        apply_range(&mut al.ranges, rtype, start, end);
        il.active.push(al);
    }

    fn journal_apply(
        chlog: &mut Changelog,
        ts: u32,
        inode: u32,
        sessionid: u32,
        owner: u64,
        rtype: u8,
        start: u64,
        end: u64,
        pid: u32,
    ) {
        let c = match rtype {
            POSIX_LOCK_RDLCK => 'R',
            POSIX_LOCK_WRLCK => 'W',
            _ => 'U',
        };
        chlog.append(&format!(
            "{}|POSIXLOCK({},{},{},{},{},{},{})",
            ts, inode, sessionid, owner, c, start, end, pid
        ));
    }

    fn check_waiting(&mut self, chlog: &mut Changelog, ts: u32, inode: u32) {
        match self.inodes.get(&inode) {
            Some(il) if il.active.is_empty() && il.waiting.is_empty() => {
                self.inodes.remove(&inode);
                return;
            }
            Some(_) => {}
            None => return,
        }
        let il = self.inodes.get_mut(&inode).unwrap();
        let mut i = 0;
        while i < il.waiting.len() {
            let wl = il.waiting[i];
            if Self::find_offensive(il, wl.sessionid, wl.owner, wl.rtype, wl.start, wl.end).is_none()
            {
                Self::journal_apply(
                    chlog, ts, inode, wl.sessionid, wl.owner, wl.rtype, wl.start, wl.end, wl.pid,
                );
                Self::do_apply(il, wl.sessionid, wl.owner, wl.rtype, wl.start, wl.end, wl.pid);
                self.wakeups.push(LockWakeUp {
                    sessionid: wl.sessionid,
                    msgid: wl.msgid,
                    status: MfsStatus::Ok,
                });
                il.waiting.remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// One posix-lock protocol command. For `GET` the returned tuple is
    /// the first conflicting lock (`UNLCK` when none); its pid is only
    /// reported when the blocker belongs to the same session.
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
        rtype: u8,
        start: u64,
        end: u64,
        pid: u32,
        opened: bool,
    ) -> (MfsStatus, Option<(u8, u64, u64, u32)>) {
        if (op == POSIX_LOCK_CMD_SET || op == POSIX_LOCK_CMD_TRY)
            && rtype != POSIX_LOCK_UNLCK
            && !opened
        {
            return (MfsStatus::NotOpened, None);
        }

        if op == POSIX_LOCK_CMD_INT {
            if let Some(il) = self.inodes.get_mut(&inode) {
                if let Some(idx) = il
                    .waiting
                    .iter()
                    .position(|wl| wl.sessionid == sessionid && wl.reqid == reqid)
                {
                    let wl = il.waiting.remove(idx);
                    self.wakeups.push(LockWakeUp {
                        sessionid,
                        msgid: wl.msgid,
                        status: MfsStatus::EIntr,
                    });
                }
            }
            self.gc(inode);
            return (MfsStatus::Ok, None);
        }
        if op == POSIX_LOCK_CMD_GET {
            if rtype != POSIX_LOCK_UNLCK {
                if let Some(il) = self.inodes.get(&inode) {
                    if let Some((r, bpid)) =
                        Self::find_offensive(il, sessionid, owner, rtype, start, end)
                    {
                        return (MfsStatus::Ok, Some((r.rtype, r.start, r.end, bpid)));
                    }
                }
            }
            return (MfsStatus::Ok, Some((POSIX_LOCK_UNLCK, 0, 0, 0)));
        }

        if rtype != POSIX_LOCK_UNLCK {
            if let Some(il) = self.inodes.get(&inode) {
                if Self::find_offensive(il, sessionid, owner, rtype, start, end).is_some() {
                    if op == POSIX_LOCK_CMD_TRY {
                        return (MfsStatus::EAgain, None);
                    }
                    let il = self.inodes.get_mut(&inode).unwrap();
                    il.waiting.push(WLock {
                        owner,
                        sessionid,
                        pid,
                        msgid,
                        reqid,
                        start,
                        end,
                        rtype,
                    });
                    return (MfsStatus::Waiting, None);
                }
            }
        }
        if rtype == POSIX_LOCK_UNLCK {
            if !self.inodes.contains_key(&inode) {
                return (MfsStatus::Ok, None);
            }
            Self::journal_apply(chlog, ts, inode, sessionid, owner, rtype, start, end, pid);
            let il = self.inodes.get_mut(&inode).unwrap();
            Self::do_apply(il, sessionid, owner, rtype, start, end, pid);
            self.check_waiting(chlog, ts, inode);
            self.gc(inode);
            return (MfsStatus::Ok, None);
        }
        Self::journal_apply(chlog, ts, inode, sessionid, owner, rtype, start, end, pid);
        let il = self.inodes.entry(inode).or_default();
        Self::do_apply(il, sessionid, owner, rtype, start, end, pid);
        self.check_waiting(chlog, ts, inode);
        (MfsStatus::Ok, None)
    }

    /// Drop every range and waiter of (sessionid, inode) when the file is
    /// closed; remaining waiters re-evaluate.
    pub fn file_closed(&mut self, chlog: &mut Changelog, ts: u32, sessionid: u32, inode: u32) {
        let il = match self.inodes.get_mut(&inode) {
            Some(il) => il,
            None => return,
        };
        il.waiting.retain(|wl| wl.sessionid != sessionid);
        let mut changed = false;
        let mut i = 0;
        while i < il.active.len() {
            if il.active[i].sessionid == sessionid {
                let al = il.active.remove(i);
                Self::journal_apply(
                    chlog,
                    ts,
                    inode,
                    al.sessionid,
                    al.owner,
                    POSIX_LOCK_UNLCK,
                    0,
                    u64::MAX,
                    al.pid,
                );
                changed = true;
            } else {
                i += 1;
            }
        }
        if changed {
            self.check_waiting(chlog, ts, inode);
        }
        self.gc(inode);
    }

    /// Active ranges for the admin listing; whole table with `inode == 0`.
    pub fn list(&self, inode: u32) -> Vec<(u32, u32, u64, u32, u64, u64, u8)> {
        let mut out = Vec::new();
        let mut push = |ino: u32, il: &InodeLocks| {
            for al in &il.active {
                for r in &al.ranges {
                    out.push((ino, al.sessionid, al.owner, al.pid, r.start, r.end, r.rtype));
                }
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

    /// Ranges held by one (inode, session, owner); test helper and the
    /// shape the image loader validates against.
    pub fn ranges_of(&self, inode: u32, sessionid: u32, owner: u64) -> Vec<Range> {
        self.inodes
            .get(&inode)
            .and_then(|il| {
                il.active
                    .iter()
                    .find(|al| al.sessionid == sessionid && al.owner == owner)
                    .map(|al| al.ranges.clone())
            })
            .unwrap_or_default()
    }

    /// Changelog replay of POSIXLOCK lines.
    pub fn mr_change(
        &mut self,
        inode: u32,
        sessionid: u32,
        owner: u64,
        cmd: char,
        start: u64,
        end: u64,
        pid: u32,
    ) -> MfsStatus {
        let rtype = match cmd.to_ascii_uppercase() {
            'U' => {
                if !self.inodes.contains_key(&inode) {
                    return MfsStatus::Mismatch;
                }
                POSIX_LOCK_UNLCK
            }
            'R' | 'S' => POSIX_LOCK_RDLCK,
            'W' | 'E' => POSIX_LOCK_WRLCK,
            _ => return MfsStatus::EInval,
        };
        let il = self.inodes.entry(inode).or_default();
        if rtype != POSIX_LOCK_UNLCK
            && Self::find_offensive(il, sessionid, owner, rtype, start, end).is_some()
        {
            return MfsStatus::Mismatch;
        }
        Self::do_apply(il, sessionid, owner, rtype, start, end, pid);
        self.gc(inode);
        MfsStatus::Ok
    }

    /* image section serialization, minor version 0x10; active ranges only */

    pub fn store(&self, w: &mut impl Write) -> Result<()> {
        let mut inodes: Vec<u32> = self.inodes.keys().copied().collect();
        inodes.sort_unstable();
        for ino in inodes {
            for al in &self.inodes[&ino].active {
                for r in &al.ranges {
                    w.write_all(&ino.to_be_bytes())?;
                    w.write_all(&al.owner.to_be_bytes())?;
                    w.write_all(&al.sessionid.to_be_bytes())?;
                    w.write_all(&al.pid.to_be_bytes())?;
                    w.write_all(&r.start.to_be_bytes())?;
                    w.write_all(&r.end.to_be_bytes())?;
                    w.write_all(&[r.rtype])?;
                }
            }
        }
        w.write_all(&[0u8; 37])?;
        Ok(())
    }

    pub fn load(
        &mut self,
        data: &[u8],
        ignoreflag: bool,
        opened: impl Fn(u32, u32) -> bool,
    ) -> Result<()> {
        let mut c = Cursor::new(data);
        let mut last: Option<(u32, u32, u64, u64, u8)> = None; // inode, session, owner, end, type
        loop {
            let inode = c.get_u32()?;
            let owner = c.get_u64()?;
            let sessionid = c.get_u32()?;
            let pid = c.get_u32()?;
            let start = c.get_u64()?;
            let end = c.get_u64()?;
            let rtype = c.get_u8()?;
            if inode == 0 && owner == 0 && sessionid == 0 {
                return Ok(());
            }
            if !opened(sessionid, inode) {
                if ignoreflag {
                    warn!("loading posix locks: lock on closed file (ignored)");
                    continue;
                }
                anyhow::bail!("loading posix locks: lock on closed file");
            }
            if let Some((li, ls, lo, lend, ltype)) = last {
                if li == inode && ls == sessionid && lo == owner {
                    if start < lend {
                        if ignoreflag {
                            warn!("loading posix locks: range not in order (ignored)");
                            continue;
                        }
                        anyhow::bail!("loading posix locks: range not in order");
                    }
                    if rtype == ltype && start == lend {
                        if ignoreflag {
                            warn!("loading posix locks: unmerged adjacent ranges (ignored)");
                            continue;
                        }
                        anyhow::bail!("loading posix locks: unmerged adjacent ranges");
                    }
                }
            }
            let il = self.inodes.entry(inode).or_default();
            match il.active.iter_mut().find(|al| al.owner == owner && al.sessionid == sessionid) {
                Some(al) => al.ranges.push(Range { start, end, rtype }),
                None => il.active.push(ALock {
                    owner,
                    sessionid,
                    pid,
                    ranges: vec![Range { start, end, rtype }],
                }),
            }
            last = Some((inode, sessionid, owner, end, rtype));
        }
    }
}

impl Default for PosixLockTable {
    fn default() -> Self {
        PosixLockTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: u64, end: u64, rtype: u8) -> Range {
        Range { start, end, rtype }
    }

    // every stored list must be sorted, non-overlapping, merged, no UNLCK
    fn assert_canonical(ranges: &[Range]) {
        for w in ranges.windows(2) {
            assert!(w[0].end <= w[1].start, "overlap or disorder: {:?}", ranges);
            assert!(
                !(w[0].end == w[1].start && w[0].rtype == w[1].rtype),
                "unmerged neighbours: {:?}",
                ranges
            );
        }
        for x in ranges {
            assert!(x.start < x.end);
            assert_ne!(x.rtype, POSIX_LOCK_UNLCK);
        }
    }

    #[test]
    fn splice_merges_same_type() {
        let mut v = Vec::new();
        apply_range(&mut v, POSIX_LOCK_RDLCK, 20, 25);
        apply_range(&mut v, POSIX_LOCK_RDLCK, 30, 35);
        apply_range(&mut v, POSIX_LOCK_RDLCK, 10, 15);
        assert_eq!(v, vec![r(10, 15, 1), r(20, 25, 1), r(30, 35, 1)]);
        apply_range(&mut v, POSIX_LOCK_RDLCK, 19, 26);
        assert_eq!(v, vec![r(10, 15, 1), r(19, 26, 1), r(30, 35, 1)]);
        apply_range(&mut v, POSIX_LOCK_RDLCK, 11, 34);
        assert_eq!(v, vec![r(10, 35, 1)]);
        assert_canonical(&v);
    }

    #[test]
    fn splice_write_overrides_read() {
        let mut v = Vec::new();
        apply_range(&mut v, POSIX_LOCK_RDLCK, 10, 35);
        apply_range(&mut v, POSIX_LOCK_WRLCK, 20, 25);
        assert_eq!(v, vec![r(10, 20, 1), r(20, 25, 2), r(25, 35, 1)]);
        assert_canonical(&v);
    }

    #[test]
    fn splice_unlock_erases() {
        let mut v = Vec::new();
        apply_range(&mut v, POSIX_LOCK_RDLCK, 10, 35);
        apply_range(&mut v, POSIX_LOCK_UNLCK, 15, 20);
        assert_eq!(v, vec![r(10, 15, 1), r(20, 35, 1)]);
        apply_range(&mut v, POSIX_LOCK_UNLCK, 0, u64::MAX);
        assert!(v.is_empty());
    }

    #[test]
    fn splice_randomized_stays_canonical() {
        // deterministic pseudo-random walk over a small coordinate space
        let mut v = Vec::new();
        let mut seed = 0x1234_5678u64;
        let mut next = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as u64
        };
        for _ in 0..2000 {
            let mut a = next() % 250;
            let mut b = next() % 250;
            if a == b {
                b = a + 1;
            }
            if a > b {
                std::mem::swap(&mut a, &mut b);
            }
            let t = match next() % 3 {
                0 => POSIX_LOCK_RDLCK,
                1 => POSIX_LOCK_WRLCK,
                _ => POSIX_LOCK_UNLCK,
            };
            apply_range(&mut v, t, a, b);
            assert_canonical(&v);
        }
        apply_range(&mut v, POSIX_LOCK_UNLCK, 0, u64::MAX);
        assert!(v.is_empty());
    }

    fn set(
        t: &mut PosixLockTable,
        cl: &mut Changelog,
        sid: u32,
        owner: u64,
        op: u8,
        rtype: u8,
        start: u64,
        end: u64,
    ) -> (MfsStatus, Option<(u8, u64, u64, u32)>) {
        t.cmd(cl, 0, sid, owner as u32 * 100, owner as u32, 9, owner, op, rtype, start, end, sid * 1000, true)
    }

    #[test]
    fn conflicting_set_waits_and_wakes() {
        let mut t = PosixLockTable::new();
        let mut cl = Changelog::memory();
        let (s, _) = set(&mut t, &mut cl, 1, 1, POSIX_LOCK_CMD_SET, POSIX_LOCK_WRLCK, 0, 100);
        assert_eq!(s, MfsStatus::Ok);
        let (s, _) = set(&mut t, &mut cl, 2, 2, POSIX_LOCK_CMD_SET, POSIX_LOCK_WRLCK, 50, 150);
        assert_eq!(s, MfsStatus::Waiting);
        let (s, _) = set(&mut t, &mut cl, 2, 2, POSIX_LOCK_CMD_TRY, POSIX_LOCK_WRLCK, 50, 150);
        assert_eq!(s, MfsStatus::EAgain);
        // unlocking the blocker grants the waiter
        let (s, _) = set(&mut t, &mut cl, 1, 1, POSIX_LOCK_CMD_SET, POSIX_LOCK_UNLCK, 0, u64::MAX);
        assert_eq!(s, MfsStatus::Ok);
        let w = t.take_wakeups();
        assert_eq!(w.len(), 1);
        assert_eq!(w[0].sessionid, 2);
        assert_eq!(w[0].status, MfsStatus::Ok);
        assert_eq!(t.ranges_of(9, 2, 2), vec![r(50, 150, 2)]);
    }

    #[test]
    fn readers_do_not_conflict() {
        let mut t = PosixLockTable::new();
        let mut cl = Changelog::memory();
        let (s, _) = set(&mut t, &mut cl, 1, 1, POSIX_LOCK_CMD_SET, POSIX_LOCK_RDLCK, 0, 100);
        assert_eq!(s, MfsStatus::Ok);
        let (s, _) = set(&mut t, &mut cl, 2, 2, POSIX_LOCK_CMD_SET, POSIX_LOCK_RDLCK, 50, 150);
        assert_eq!(s, MfsStatus::Ok);
    }

    #[test]
    fn get_reports_blocker_pid_only_within_session() {
        let mut t = PosixLockTable::new();
        let mut cl = Changelog::memory();
        set(&mut t, &mut cl, 1, 1, POSIX_LOCK_CMD_SET, POSIX_LOCK_WRLCK, 10, 20);
        // different session: blocker reported with pid 0
        let (s, info) = set(&mut t, &mut cl, 2, 2, POSIX_LOCK_CMD_GET, POSIX_LOCK_WRLCK, 0, 30);
        assert_eq!(s, MfsStatus::Ok);
        assert_eq!(info, Some((POSIX_LOCK_WRLCK, 10, 20, 0)));
        // same session, different owner: pid visible
        let (_, info) = set(&mut t, &mut cl, 1, 3, POSIX_LOCK_CMD_GET, POSIX_LOCK_WRLCK, 0, 30);
        assert_eq!(info, Some((POSIX_LOCK_WRLCK, 10, 20, 1000)));
        // no conflict reports UNLCK
        let (_, info) = set(&mut t, &mut cl, 2, 2, POSIX_LOCK_CMD_GET, POSIX_LOCK_WRLCK, 500, 600);
        assert_eq!(info, Some((POSIX_LOCK_UNLCK, 0, 0, 0)));
    }

    #[test]
    fn interrupt_wakes_with_eintr() {
        let mut t = PosixLockTable::new();
        let mut cl = Changelog::memory();
        set(&mut t, &mut cl, 1, 1, POSIX_LOCK_CMD_SET, POSIX_LOCK_WRLCK, 0, 100);
        let (s, _) = set(&mut t, &mut cl, 2, 2, POSIX_LOCK_CMD_SET, POSIX_LOCK_WRLCK, 0, 100);
        assert_eq!(s, MfsStatus::Waiting);
        let (s, _) = set(&mut t, &mut cl, 2, 2, POSIX_LOCK_CMD_INT, POSIX_LOCK_WRLCK, 0, 100);
        assert_eq!(s, MfsStatus::Ok);
        let w = t.take_wakeups();
        assert_eq!(w[0].status, MfsStatus::EIntr);
    }

    #[test]
    fn file_close_unlocks_everything_and_reevaluates() {
        let mut t = PosixLockTable::new();
        let mut cl = Changelog::memory();
        set(&mut t, &mut cl, 1, 1, POSIX_LOCK_CMD_SET, POSIX_LOCK_WRLCK, 0, 100);
        let (s, _) = set(&mut t, &mut cl, 2, 2, POSIX_LOCK_CMD_SET, POSIX_LOCK_RDLCK, 0, 50);
        assert_eq!(s, MfsStatus::Waiting);
        t.file_closed(&mut cl, 0, 1, 9);
        assert!(t.ranges_of(9, 1, 1).is_empty());
        let w = t.take_wakeups();
        assert_eq!(w.len(), 1);
        assert_eq!(w[0].sessionid, 2);
        assert_eq!(t.ranges_of(9, 2, 2), vec![r(0, 50, 1)]);
    }

    #[test]
    fn journal_line_shape() {
        let mut t = PosixLockTable::new();
        let mut cl = Changelog::memory();
        set(&mut t, &mut cl, 1, 7, POSIX_LOCK_CMD_SET, POSIX_LOCK_RDLCK, 5, 10);
        assert_eq!(cl.recorded()[0], "1: 0|POSIXLOCK(9,1,7,R,5,10,1000)");
    }

    #[test]
    fn store_load_roundtrip() -> Result<()> {
        let mut t = PosixLockTable::new();
        let mut cl = Changelog::memory();
        set(&mut t, &mut cl, 1, 1, POSIX_LOCK_CMD_SET, POSIX_LOCK_RDLCK, 0, 10);
        set(&mut t, &mut cl, 1, 1, POSIX_LOCK_CMD_SET, POSIX_LOCK_WRLCK, 20, 30);
        set(&mut t, &mut cl, 2, 2, POSIX_LOCK_CMD_SET, POSIX_LOCK_RDLCK, 100, 200);
        let mut buf = Vec::new();
        t.store(&mut buf)?;
        let mut t2 = PosixLockTable::new();
        t2.load(&buf, false, |_, _| true)?;
        assert_eq!(t2.list(0), t.list(0));
        Ok(())
    }

    #[test]
    fn replay_of_journal_lines() {
        let mut t = PosixLockTable::new();
        assert_eq!(t.mr_change(9, 1, 7, 'R', 5, 10, 44), MfsStatus::Ok);
        assert_eq!(t.ranges_of(9, 1, 7), vec![r(5, 10, 1)]);
        // conflicting write replays as a mismatch
        assert_eq!(t.mr_change(9, 2, 8, 'W', 5, 10, 45), MfsStatus::Mismatch);
        assert_eq!(t.mr_change(9, 1, 7, 'U', 0, u64::MAX, 44), MfsStatus::Ok);
        assert!(t.ranges_of(9, 1, 7).is_empty());
    }
}
