//! Mount session table.
//!
//! A session is a mount's authenticated presence: root inode, permission
//! flags, uid/gid remapping, storage-class group mask, trash-retention
//! bounds, a disables bitmask and per-operation counters. Sessions are
//! journaled (SESADD/SESCHANGED/SESDISCONNECTED/SESCONNECTED/SESDEL) and
//! survive client disconnects for a configurable sustain window.

use std::collections::HashMap;
use std::io::Write;

use anyhow::Result;
use log::debug;

use crate::rmfs_lib::changelog::{escape_name, Changelog};
use crate::rmfs_lib::codec::Cursor;
use crate::rmfs_lib::types::*;

pub const SESSION_STATS: usize = 16;

/// Operation counter slots.
pub const SES_OP_STATFS: usize = 0;
pub const SES_OP_GETATTR: usize = 1;
pub const SES_OP_SETATTR: usize = 2;
pub const SES_OP_LOOKUP: usize = 3;
pub const SES_OP_MKDIR: usize = 4;
pub const SES_OP_RMDIR: usize = 5;
pub const SES_OP_SYMLINK: usize = 6;
pub const SES_OP_READLINK: usize = 7;
pub const SES_OP_MKNOD: usize = 8;
pub const SES_OP_UNLINK: usize = 9;
pub const SES_OP_RENAME: usize = 10;
pub const SES_OP_LINK: usize = 11;
pub const SES_OP_READDIR: usize = 12;
pub const SES_OP_OPEN: usize = 13;
pub const SES_OP_READCHUNK: usize = 14;
pub const SES_OP_WRITECHUNK: usize = 15;

pub const SESSION_SUSTAIN_MIN: u32 = 60;
pub const SESSION_SUSTAIN_MAX: u32 = 7 * 86400;
pub const SESSION_SUSTAIN_DEFAULT: u32 = 86400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub sessionid: u32,
    pub exportscsum: u64,
    pub rootinode: u32,
    pub sesflags: u8,
    pub umaskval: u16,
    pub rootuid: u32,
    pub rootgid: u32,
    pub mapalluid: u32,
    pub mapallgid: u32,
    pub sclassgroups: u16,
    pub mintrashretention: u32,
    pub maxtrashretention: u32,
    pub disables: u32,
    pub peerip: u32,
    pub info: Vec<u8>,
    /// 0 while connected, otherwise the disconnection timestamp.
    pub disconnected: u32,
    pub nsocks: u32,
    pub currentopstats: [u32; SESSION_STATS],
    pub lasthouropstats: [u32; SESSION_STATS],
}

impl Session {
    /// Attr-record size negotiated for this session.
    pub fn attr_size(&self) -> usize {
        if self.sesflags & SESFLAG_ATTRBIT != 0 {
            36
        } else {
            35
        }
    }

    pub fn is_readonly(&self) -> bool {
        self.sesflags & SESFLAG_READONLY != 0
    }

    /// Gate for set/exchange of a storage class by its export group.
    pub fn check_sclass_group(&self, export_group: u8) -> bool {
        export_group < 16 && self.sclassgroups & (1 << export_group) != 0
    }

    /// Is a trash-retention change in `smode` direction within this
    /// session's [min, max] window?
    pub fn check_trashretention(&self, smode: u8, value: u32) -> bool {
        match smode & 0x0F {
            SMODE_INCREASE => value <= self.maxtrashretention,
            SMODE_DECREASE => value >= self.mintrashretention,
            _ => value >= self.mintrashretention && value <= self.maxtrashretention,
        }
    }

    pub fn stats_bump(&mut self, op: usize) {
        if op < SESSION_STATS {
            self.currentopstats[op] = self.currentopstats[op].wrapping_add(1);
        }
    }

    fn journal_fields(&self) -> String {
        format!(
            "#{},{},{},0{:03o},{},{},{},{},{},{},{},0x{:08X},{},{}",
            self.exportscsum,
            self.rootinode,
            self.sesflags,
            self.umaskval,
            self.rootuid,
            self.rootgid,
            self.mapalluid,
            self.mapallgid,
            self.sclassgroups,
            self.mintrashretention,
            self.maxtrashretention,
            self.disables,
            self.peerip,
            escape_name(&self.info)
        )
    }
}

pub struct SessionTable {
    sessions: HashMap<u32, Session>,
    nextsessionid: u32,
    sustain_time: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSessionParams {
    pub exportscsum: u64,
    pub rootinode: u32,
    pub sesflags: u8,
    pub umaskval: u16,
    pub rootuid: u32,
    pub rootgid: u32,
    pub mapalluid: u32,
    pub mapallgid: u32,
    pub sclassgroups: u16,
    pub mintrashretention: u32,
    pub maxtrashretention: u32,
    pub disables: u32,
    pub peerip: u32,
    pub info: Vec<u8>,
}

impl Default for NewSessionParams {
    fn default() -> Self {
        NewSessionParams {
            exportscsum: 0,
            rootinode: ROOT_INODE,
            sesflags: SESFLAG_ATTRBIT,
            umaskval: 0o022,
            rootuid: 0,
            rootgid: 0,
            mapalluid: 0,
            mapallgid: 0,
            sclassgroups: 0xFFFF,
            mintrashretention: 0,
            maxtrashretention: u32::MAX,
            disables: 0,
            peerip: 0,
            info: Vec::new(),
        }
    }
}

impl SessionTable {
    pub fn new(sustain_time: u32) -> SessionTable {
        SessionTable {
            sessions: HashMap::new(),
            nextsessionid: 1,
            sustain_time: sustain_time.clamp(SESSION_SUSTAIN_MIN, SESSION_SUSTAIN_MAX),
        }
    }

    pub fn find(&self, sessionid: u32) -> Option<&Session> {
        if sessionid == 0 || sessionid >= 0x8000_0000 {
            return None;
        }
        self.sessions.get(&sessionid)
    }

    pub fn find_mut(&mut self, sessionid: u32) -> Option<&mut Session> {
        if sessionid == 0 || sessionid >= 0x8000_0000 {
            return None;
        }
        self.sessions.get_mut(&sessionid)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Register a brand new session (NEWSESSION / NEWMETASESSION).
    pub fn new_session(&mut self, chlog: &mut Changelog, ts: u32, p: NewSessionParams) -> u32 {
        let sessionid = self.nextsessionid;
        self.nextsessionid += 1;
        let ses = Session {
            sessionid,
            exportscsum: p.exportscsum,
            rootinode: p.rootinode,
            sesflags: p.sesflags,
            umaskval: p.umaskval,
            rootuid: p.rootuid,
            rootgid: p.rootgid,
            mapalluid: p.mapalluid,
            mapallgid: p.mapallgid,
            sclassgroups: p.sclassgroups,
            mintrashretention: p.mintrashretention,
            maxtrashretention: p.maxtrashretention,
            disables: p.disables,
            peerip: p.peerip,
            info: p.info,
            disconnected: 0,
            nsocks: 1,
            currentopstats: [0; SESSION_STATS],
            lasthouropstats: [0; SESSION_STATS],
        };
        chlog.append(&format!("{}|SESADD({}):{}", ts, ses.journal_fields(), sessionid));
        self.sessions.insert(sessionid, ses);
        sessionid
    }

    /// RECONNECT: attach to an existing session. When any registration
    /// parameter differs from the recorded one the session is mutated in
    /// place and a SESCHANGED line is journaled.
    pub fn reconnect_session(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        sessionid: u32,
        p: NewSessionParams,
    ) -> Result<&Session, MfsStatus> {
        if self.find(sessionid).is_none() {
            return Err(MfsStatus::BadSessionId);
        }
        let ses = self.sessions.get_mut(&sessionid).unwrap();
        let dynip = ses.sesflags & SESFLAG_DYNAMICIP != 0;
        let changed = ses.exportscsum != p.exportscsum
            || ses.rootinode != p.rootinode
            || ses.sesflags != p.sesflags
            || ses.umaskval != p.umaskval
            || ses.rootuid != p.rootuid
            || ses.rootgid != p.rootgid
            || ses.mapalluid != p.mapalluid
            || ses.mapallgid != p.mapallgid
            || ses.sclassgroups != p.sclassgroups
            || ses.mintrashretention != p.mintrashretention
            || ses.maxtrashretention != p.maxtrashretention
            || ses.disables != p.disables
            || (!dynip && ses.peerip != p.peerip);
        if changed {
            ses.exportscsum = p.exportscsum;
            ses.rootinode = p.rootinode;
            ses.sesflags = p.sesflags;
            ses.umaskval = p.umaskval;
            ses.rootuid = p.rootuid;
            ses.rootgid = p.rootgid;
            ses.mapalluid = p.mapalluid;
            ses.mapallgid = p.mapallgid;
            ses.sclassgroups = p.sclassgroups;
            ses.mintrashretention = p.mintrashretention;
            ses.maxtrashretention = p.maxtrashretention;
            ses.disables = p.disables;
            ses.peerip = p.peerip;
            let fields = ses.journal_fields();
            chlog.append(&format!("{}|SESCHANGED({},{})", ts, sessionid, fields));
        }
        let ses = self.sessions.get_mut(&sessionid).unwrap();
        if ses.disconnected != 0 {
            ses.disconnected = 0;
            chlog.append(&format!("{}|SESCONNECTED({})", ts, sessionid));
        }
        ses.nsocks += 1;
        Ok(self.sessions.get(&sessionid).unwrap())
    }

    /// The serving connection dropped. When the last socket goes the
    /// session enters the disconnected state with a timestamp.
    pub fn disconnect(&mut self, chlog: &mut Changelog, ts: u32, sessionid: u32) {
        if let Some(ses) = self.sessions.get_mut(&sessionid) {
            if ses.nsocks > 0 {
                ses.nsocks -= 1;
            }
            if ses.nsocks == 0 && ses.disconnected == 0 {
                ses.disconnected = ts;
                chlog.append(&format!("{}|SESDISCONNECTED({})", ts, sessionid));
            }
        }
    }

    /// Close a session on explicit CLOSESESSION.
    pub fn close_session(&mut self, chlog: &mut Changelog, ts: u32, sessionid: u32) -> Vec<u32> {
        if self.sessions.remove(&sessionid).is_some() {
            chlog.append(&format!("{}|SESDEL({})", ts, sessionid));
            vec![sessionid]
        } else {
            Vec::new()
        }
    }

    /// Expire sessions disconnected longer than the sustain window.
    /// Returns the removed session ids so the caller cascades open files
    /// and locks.
    pub fn check_expired(&mut self, chlog: &mut Changelog, ts: u32) -> Vec<u32> {
        let expired: Vec<u32> = self
            .sessions
            .values()
            .filter(|s| s.disconnected != 0 && ts.saturating_sub(s.disconnected) >= self.sustain_time)
            .map(|s| s.sessionid)
            .collect();
        for sessionid in &expired {
            debug!("session {} expired after sustain window", sessionid);
            self.sessions.remove(sessionid);
            chlog.append(&format!("{}|SESDEL({})", ts, sessionid));
        }
        expired
    }

    /// Cycle the per-operation counters at the top of the hour.
    pub fn stats_cycle(&mut self) {
        for ses in self.sessions.values_mut() {
            ses.lasthouropstats = ses.currentopstats;
            ses.currentopstats = [0; SESSION_STATS];
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /* replay entry points */

    pub fn mr_sesadd(&mut self, p: NewSessionParams, sessionid: u32) -> MfsStatus {
        if sessionid != self.nextsessionid {
            return MfsStatus::Mismatch;
        }
        self.nextsessionid += 1;
        self.sessions.insert(
            sessionid,
            Session {
                sessionid,
                exportscsum: p.exportscsum,
                rootinode: p.rootinode,
                sesflags: p.sesflags,
                umaskval: p.umaskval,
                rootuid: p.rootuid,
                rootgid: p.rootgid,
                mapalluid: p.mapalluid,
                mapallgid: p.mapallgid,
                sclassgroups: p.sclassgroups,
                mintrashretention: p.mintrashretention,
                maxtrashretention: p.maxtrashretention,
                disables: p.disables,
                peerip: p.peerip,
                info: p.info,
                disconnected: 0,
                nsocks: 0,
                currentopstats: [0; SESSION_STATS],
                lasthouropstats: [0; SESSION_STATS],
            },
        );
        MfsStatus::Ok
    }

    pub fn mr_seschanged(&mut self, sessionid: u32, p: NewSessionParams) -> MfsStatus {
        match self.sessions.get_mut(&sessionid) {
            Some(ses) => {
                ses.exportscsum = p.exportscsum;
                ses.rootinode = p.rootinode;
                ses.sesflags = p.sesflags;
                ses.umaskval = p.umaskval;
                ses.rootuid = p.rootuid;
                ses.rootgid = p.rootgid;
                ses.mapalluid = p.mapalluid;
                ses.mapallgid = p.mapallgid;
                ses.sclassgroups = p.sclassgroups;
                ses.mintrashretention = p.mintrashretention;
                ses.maxtrashretention = p.maxtrashretention;
                ses.disables = p.disables;
                ses.peerip = p.peerip;
                ses.info = p.info;
                MfsStatus::Ok
            }
            None => MfsStatus::Mismatch,
        }
    }

    pub fn mr_sesdel(&mut self, sessionid: u32) -> MfsStatus {
        match self.sessions.remove(&sessionid) {
            Some(_) => MfsStatus::Ok,
            None => MfsStatus::Mismatch,
        }
    }

    pub fn mr_disconnected(&mut self, sessionid: u32, ts: u32) -> MfsStatus {
        match self.sessions.get_mut(&sessionid) {
            Some(ses) => {
                ses.disconnected = ts;
                ses.nsocks = 0;
                MfsStatus::Ok
            }
            None => MfsStatus::Mismatch,
        }
    }

    pub fn mr_connected(&mut self, sessionid: u32) -> MfsStatus {
        match self.sessions.get_mut(&sessionid) {
            Some(ses) => {
                ses.disconnected = 0;
                MfsStatus::Ok
            }
            None => MfsStatus::Mismatch,
        }
    }

    pub fn mr_nextsessionid(&mut self, sessionid: u32) -> MfsStatus {
        self.nextsessionid = sessionid;
        MfsStatus::Ok
    }

    /* image section serialization, minor version 0x10 */

    pub fn store(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(&self.nextsessionid.to_be_bytes())?;
        let mut ids: Vec<u32> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let s = &self.sessions[&id];
            w.write_all(&s.sessionid.to_be_bytes())?;
            w.write_all(&s.exportscsum.to_be_bytes())?;
            w.write_all(&s.rootinode.to_be_bytes())?;
            w.write_all(&[s.sesflags])?;
            w.write_all(&s.umaskval.to_be_bytes())?;
            w.write_all(&s.rootuid.to_be_bytes())?;
            w.write_all(&s.rootgid.to_be_bytes())?;
            w.write_all(&s.mapalluid.to_be_bytes())?;
            w.write_all(&s.mapallgid.to_be_bytes())?;
            w.write_all(&s.sclassgroups.to_be_bytes())?;
            w.write_all(&s.mintrashretention.to_be_bytes())?;
            w.write_all(&s.maxtrashretention.to_be_bytes())?;
            w.write_all(&s.disables.to_be_bytes())?;
            w.write_all(&s.peerip.to_be_bytes())?;
            w.write_all(&s.disconnected.to_be_bytes())?;
            w.write_all(&(s.info.len() as u32).to_be_bytes())?;
            w.write_all(&s.info)?;
            for v in s.currentopstats.iter().chain(s.lasthouropstats.iter()) {
                w.write_all(&v.to_be_bytes())?;
            }
        }
        w.write_all(&0u32.to_be_bytes())?;
        Ok(())
    }

    pub fn load(data: &[u8], sustain_time: u32) -> Result<SessionTable> {
        let mut c = Cursor::new(data);
        let mut tab = SessionTable::new(sustain_time);
        tab.nextsessionid = c.get_u32()?;
        loop {
            let sessionid = c.get_u32()?;
            if sessionid == 0 {
                break;
            }
            let exportscsum = c.get_u64()?;
            let rootinode = c.get_u32()?;
            let sesflags = c.get_u8()?;
            let umaskval = c.get_u16()?;
            let rootuid = c.get_u32()?;
            let rootgid = c.get_u32()?;
            let mapalluid = c.get_u32()?;
            let mapallgid = c.get_u32()?;
            let sclassgroups = c.get_u16()?;
            let mintrashretention = c.get_u32()?;
            let maxtrashretention = c.get_u32()?;
            let disables = c.get_u32()?;
            let peerip = c.get_u32()?;
            let disconnected = c.get_u32()?;
            let ileng = c.get_u32()? as usize;
            let info = c.get_bytes(ileng)?.to_vec();
            let mut currentopstats = [0u32; SESSION_STATS];
            let mut lasthouropstats = [0u32; SESSION_STATS];
            for v in currentopstats.iter_mut() {
                *v = c.get_u32()?;
            }
            for v in lasthouropstats.iter_mut() {
                *v = c.get_u32()?;
            }
            tab.sessions.insert(
                sessionid,
                Session {
                    sessionid,
                    exportscsum,
                    rootinode,
                    sesflags,
                    umaskval,
                    rootuid,
                    rootgid,
                    mapalluid,
                    mapallgid,
                    sclassgroups,
                    mintrashretention,
                    maxtrashretention,
                    disables,
                    peerip,
                    info,
                    disconnected,
                    nsocks: 0,
                    currentopstats,
                    lasthouropstats,
                },
            );
        }
        Ok(tab)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_journals_sesadd() {
        let mut tab = SessionTable::new(3600);
        let mut cl = Changelog::memory();
        let id = tab.new_session(&mut cl, 100, NewSessionParams {
            info: b"/mnt/mfs".to_vec(),
            peerip: 0x0A000001,
            ..Default::default()
        });
        assert_eq!(id, 1);
        assert!(tab.find(id).is_some());
        assert!(cl.recorded()[0].contains("SESADD(#0,1,"));
        assert!(cl.recorded()[0].ends_with("):1"));
    }

    #[test]
    fn reconnect_with_changed_params_journals_seschanged() {
        let mut tab = SessionTable::new(3600);
        let mut cl = Changelog::memory();
        let id = tab.new_session(&mut cl, 100, NewSessionParams::default());
        let before = cl.version();
        // identical parameters: no SESCHANGED
        tab.reconnect_session(&mut cl, 101, id, NewSessionParams::default()).unwrap();
        assert_eq!(cl.version(), before);
        let mut p = NewSessionParams::default();
        p.rootuid = 1000;
        tab.reconnect_session(&mut cl, 102, id, p).unwrap();
        assert!(cl.recorded().last().unwrap().contains("SESCHANGED(1,"));
        assert_eq!(tab.find(id).unwrap().rootuid, 1000);
    }

    #[test]
    fn unknown_session_reconnect_rejected() {
        let mut tab = SessionTable::new(3600);
        let mut cl = Changelog::memory();
        assert_eq!(
            tab.reconnect_session(&mut cl, 0, 42, NewSessionParams::default()).err(),
            Some(MfsStatus::BadSessionId)
        );
    }

    #[test]
    fn sustain_window_expiry() {
        let mut tab = SessionTable::new(60);
        let mut cl = Changelog::memory();
        let id = tab.new_session(&mut cl, 100, NewSessionParams::default());
        tab.disconnect(&mut cl, 200, id);
        assert!(cl.recorded().last().unwrap().contains("SESDISCONNECTED(1)"));
        // still inside the window
        assert!(tab.check_expired(&mut cl, 201).is_empty());
        let removed = tab.check_expired(&mut cl, 260);
        assert_eq!(removed, vec![id]);
        assert!(tab.find(id).is_none());
        assert!(cl.recorded().last().unwrap().contains("SESDEL(1)"));
    }

    #[test]
    fn reconnect_cancels_disconnection() {
        let mut tab = SessionTable::new(60);
        let mut cl = Changelog::memory();
        let id = tab.new_session(&mut cl, 100, NewSessionParams::default());
        tab.disconnect(&mut cl, 200, id);
        tab.reconnect_session(&mut cl, 210, id, NewSessionParams::default()).unwrap();
        assert_eq!(tab.find(id).unwrap().disconnected, 0);
        assert!(tab.check_expired(&mut cl, 1000).is_empty());
    }

    #[test]
    fn trashretention_window_checks() {
        let ses = Session {
            mintrashretention: 24,
            maxtrashretention: 720,
            ..new_test_session()
        };
        assert!(ses.check_trashretention(SMODE_SET, 100));
        assert!(!ses.check_trashretention(SMODE_SET, 10));
        assert!(!ses.check_trashretention(SMODE_SET, 1000));
        assert!(ses.check_trashretention(SMODE_INCREASE, 700));
        assert!(!ses.check_trashretention(SMODE_INCREASE, 721));
        assert!(ses.check_trashretention(SMODE_DECREASE, 24));
        assert!(!ses.check_trashretention(SMODE_DECREASE, 23));
    }

    #[test]
    fn sclass_group_gate() {
        let mut ses = new_test_session();
        ses.sclassgroups = 0b0000_0000_0000_0101;
        assert!(ses.check_sclass_group(0));
        assert!(!ses.check_sclass_group(1));
        assert!(ses.check_sclass_group(2));
        assert!(!ses.check_sclass_group(16));
    }

    #[test]
    fn store_load_roundtrip() -> Result<()> {
        let mut tab = SessionTable::new(3600);
        let mut cl = Changelog::memory();
        let id = tab.new_session(&mut cl, 100, NewSessionParams {
            info: b"/mnt/a".to_vec(),
            sesflags: SESFLAG_ATTRBIT | SESFLAG_ADMIN,
            ..Default::default()
        });
        tab.find_mut(id).unwrap().stats_bump(SES_OP_LOOKUP);
        let mut buf = Vec::new();
        tab.store(&mut buf)?;
        let tab2 = SessionTable::load(&buf, 3600)?;
        assert_eq!(tab2.find(id), tab.find(id));
        assert_eq!(tab2.nextsessionid, tab.nextsessionid);
        Ok(())
    }

    fn new_test_session() -> Session {
        Session {
            sessionid: 1,
            exportscsum: 0,
            rootinode: ROOT_INODE,
            sesflags: 0,
            umaskval: 0o022,
            rootuid: 0,
            rootgid: 0,
            mapalluid: 0,
            mapallgid: 0,
            sclassgroups: 0xFFFF,
            mintrashretention: 0,
            maxtrashretention: u32::MAX,
            disables: 0,
            peerip: 0,
            info: Vec::new(),
            disconnected: 0,
            nsocks: 1,
            currentopstats: [0; SESSION_STATS],
            lasthouropstats: [0; SESSION_STATS],
        }
    }
}
