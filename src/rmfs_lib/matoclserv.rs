//! Client protocol dispatch.
//!
//! One entry point per connection: takes a framed packet, validates its
//! shape, calls into the metadata subsystems and produces the replies.
//! Dispatch is gated by the connection's registration state (unregistered,
//! mount, tool). Replies carrying attributes use the session's negotiated
//! record size. A request hitting a write-locked chunk produces no
//! immediate reply; it parks on the chunk's wait list and a deferred
//! reply follows on unlock or timeout.

use std::collections::HashMap;

use anyhow::{bail, Result};
use lazy_static::lazy_static;
use log::debug;
use md5::{Digest, Md5};
use rand::RngCore;

use crate::rmfs_lib::chunks::ChunkWaiter;
use crate::rmfs_lib::codec::{Cursor, Packet};
use crate::rmfs_lib::flocks::LockWakeUp;
use crate::rmfs_lib::fsnodes::QuotaEntry;
use crate::rmfs_lib::sclass::{SclassSet, StorageClass};
use crate::rmfs_lib::sessions::*;
use crate::rmfs_lib::types::*;
use crate::rmfs_lib::Master;

lazy_static! {
    // message names for trace logging
    static ref OP_NAMES: HashMap<u32, &'static str> = HashMap::from([
        (CLTOMA_FUSE_REGISTER, "FUSE_REGISTER"),
        (CLTOMA_FUSE_STATFS, "FUSE_STATFS"),
        (CLTOMA_FUSE_ACCESS, "FUSE_ACCESS"),
        (CLTOMA_FUSE_LOOKUP, "FUSE_LOOKUP"),
        (CLTOMA_FUSE_GETATTR, "FUSE_GETATTR"),
        (CLTOMA_FUSE_SETATTR, "FUSE_SETATTR"),
        (CLTOMA_FUSE_READLINK, "FUSE_READLINK"),
        (CLTOMA_FUSE_SYMLINK, "FUSE_SYMLINK"),
        (CLTOMA_FUSE_MKNOD, "FUSE_MKNOD"),
        (CLTOMA_FUSE_MKDIR, "FUSE_MKDIR"),
        (CLTOMA_FUSE_UNLINK, "FUSE_UNLINK"),
        (CLTOMA_FUSE_RMDIR, "FUSE_RMDIR"),
        (CLTOMA_FUSE_RENAME, "FUSE_RENAME"),
        (CLTOMA_FUSE_LINK, "FUSE_LINK"),
        (CLTOMA_FUSE_READDIR, "FUSE_READDIR"),
        (CLTOMA_FUSE_OPEN, "FUSE_OPEN"),
        (CLTOMA_FUSE_READ_CHUNK, "FUSE_READ_CHUNK"),
        (CLTOMA_FUSE_WRITE_CHUNK, "FUSE_WRITE_CHUNK"),
        (CLTOMA_FUSE_WRITE_CHUNK_END, "FUSE_WRITE_CHUNK_END"),
        (CLTOMA_FUSE_CHECK, "FUSE_CHECK"),
        (CLTOMA_FUSE_GETTRASHRETENTION, "FUSE_GETTRASHRETENTION"),
        (CLTOMA_FUSE_SETTRASHRETENTION, "FUSE_SETTRASHRETENTION"),
        (CLTOMA_FUSE_GETSCLASS, "FUSE_GETSCLASS"),
        (CLTOMA_FUSE_SETSCLASS, "FUSE_SETSCLASS"),
        (CLTOMA_FUSE_GETTRASH, "FUSE_GETTRASH"),
        (CLTOMA_FUSE_GETDETACHEDATTR, "FUSE_GETDETACHEDATTR"),
        (CLTOMA_FUSE_GETTRASHPATH, "FUSE_GETTRASHPATH"),
        (CLTOMA_FUSE_SETTRASHPATH, "FUSE_SETTRASHPATH"),
        (CLTOMA_FUSE_UNDEL, "FUSE_UNDEL"),
        (CLTOMA_FUSE_PURGE, "FUSE_PURGE"),
        (CLTOMA_FUSE_GETSUSTAINED, "FUSE_GETSUSTAINED"),
        (CLTOMA_FUSE_GETEATTR, "FUSE_GETEATTR"),
        (CLTOMA_FUSE_SETEATTR, "FUSE_SETEATTR"),
        (CLTOMA_FUSE_GETXATTR, "FUSE_GETXATTR"),
        (CLTOMA_FUSE_SETXATTR, "FUSE_SETXATTR"),
        (CLTOMA_FUSE_GETQUOTA, "FUSE_GETQUOTA"),
        (CLTOMA_FUSE_SETQUOTA, "FUSE_SETQUOTA"),
        (CLTOMA_FUSE_FLOCK, "FUSE_FLOCK"),
        (CLTOMA_FUSE_POSIX_LOCK, "FUSE_POSIX_LOCK"),
        (CLTOMA_SCLASS_CREATE, "SCLASS_CREATE"),
        (CLTOMA_SCLASS_CHANGE, "SCLASS_CHANGE"),
        (CLTOMA_SCLASS_DELETE, "SCLASS_DELETE"),
        (CLTOMA_SCLASS_DUPLICATE, "SCLASS_DUPLICATE"),
        (CLTOMA_SCLASS_RENAME, "SCLASS_RENAME"),
        (CLTOMA_SCLASS_LIST, "SCLASS_LIST"),
        (CLTOMA_FUSE_SUSTAINED_INODES, "FUSE_SUSTAINED_INODES"),
        (CLTOMA_PATTERN_ADD, "PATTERN_ADD"),
        (CLTOMA_PATTERN_DELETE, "PATTERN_DELETE"),
        (CLTOMA_PATTERN_LIST, "PATTERN_LIST"),
    ]);
}

fn op_name(ptype: u32) -> &'static str {
    OP_NAMES.get(&ptype).copied().unwrap_or("?")
}

/// Per-connection state the dispatcher needs.
#[derive(Debug, Clone)]
pub struct ClientConn {
    pub registered: u8,
    pub sessionid: u32,
    pub peerip: u32,
    pub version: u32,
    pub nonce: Option<[u8; 32]>,
}

impl ClientConn {
    pub fn new(peerip: u32) -> ClientConn {
        ClientConn {
            registered: REGSTATE_UNREGISTERED,
            sessionid: 0,
            peerip,
            version: 0,
            nonce: None,
        }
    }
}

/// What one dispatched packet produced.
#[derive(Debug, Default)]
pub struct DispatchOutput {
    /// Replies to this connection, in request order.
    pub replies: Vec<Packet>,
    /// Replies owed to other sessions (lock and chunk wake-ups); the
    /// event loop routes them by session id.
    pub deferred: Vec<(u32, Packet)>,
    /// Parse failure or protocol violation: drop the connection.
    pub close: bool,
}

fn status_reply(ptype: u32, msgid: u32, status: MfsStatus) -> Packet {
    let mut p = Packet::with_capacity(ptype, 5);
    p.put_u32(msgid).put_u8(status.into());
    p
}

fn registration_digest(nonce: &[u8; 32], secret: &[u8]) -> [u8; 16] {
    let mut h = Md5::new();
    h.update(&nonce[0..16]);
    h.update(secret);
    h.update(&nonce[16..32]);
    h.finalize().into()
}

// attr-record size negotiated for the session behind this connection
fn attr36(m: &Master, conn: &ClientConn) -> bool {
    m.sessions.find(conn.sessionid).map_or(true, |s| s.attr_size() == 36)
}

fn readonly_status(m: &Master, conn: &ClientConn) -> MfsStatus {
    // older clients do not know EROFS and expect a plain access error
    if attr36(m, conn) {
        MfsStatus::ERofs
    } else {
        MfsStatus::EAcces
    }
}

fn session<'a>(m: &'a Master, conn: &ClientConn) -> Result<&'a Session, MfsStatus> {
    m.sessions.find(conn.sessionid).ok_or(MfsStatus::BadSessionId)
}

fn node_attr_reply(m: &Master, conn: &ClientConn, ptype: u32, msgid: u32, inode: u32) -> Packet {
    match m.tree.node(inode) {
        Some(n) => {
            let mut p = Packet::new(ptype);
            p.put_u32(msgid).put_u32(inode);
            p.put_bytes(&n.fill_attr(m.tree.nlink(inode), attr36(m, conn)));
            p
        }
        None => status_reply(ptype, msgid, MfsStatus::ENoEnt),
    }
}

/// Main entry: one inbound packet to zero or more replies.
pub fn dispatch(m: &mut Master, conn: &mut ClientConn, ts: u32, packet: &Packet) -> DispatchOutput {
    let mut out = DispatchOutput::default();
    match dispatch_inner(m, conn, ts, packet, &mut out) {
        Ok(()) => {}
        Err(e) => {
            debug!("dropping connection: {}", e);
            out.close = true;
        }
    }
    // deferred lock replies may belong to any session
    for w in m.flocks.take_wakeups() {
        out.deferred.push((w.sessionid, lock_wakeup_packet(MATOCL_FUSE_FLOCK, &w)));
    }
    for w in m.plocks.take_wakeups() {
        out.deferred.push((w.sessionid, lock_wakeup_packet(MATOCL_FUSE_POSIX_LOCK, &w)));
    }
    out
}

fn lock_wakeup_packet(ptype: u32, w: &LockWakeUp) -> Packet {
    let mut p = Packet::with_capacity(ptype, 5);
    p.put_u32(w.msgid).put_u8(w.status.into());
    p
}

/// Build the deferred reply for a chunk waiter woken by unlock or timed
/// out; on wake the operation is retried against the current state.
pub fn answer_chunk_waiter(m: &mut Master, ts: u32, w: &ChunkWaiter, timed_out: bool) -> (u32, Packet) {
    let ptype = if w.write { MATOCL_FUSE_WRITE_CHUNK } else { MATOCL_FUSE_READ_CHUNK };
    if timed_out {
        return (w.sessionid, status_reply(ptype, w.msgid, w.status));
    }
    let reply = if w.write {
        match write_chunk_payload(m, ts, w.inode, w.indx, w.msgid) {
            Ok(p) => p,
            Err(status) => status_reply(ptype, w.msgid, status),
        }
    } else {
        match read_chunk_payload(m, w.inode, w.indx, w.msgid) {
            Ok(p) => p,
            Err(status) => status_reply(ptype, w.msgid, status),
        }
    };
    (w.sessionid, reply)
}

fn read_chunk_payload(m: &Master, inode: u32, indx: u32, msgid: u32) -> Result<Packet, MfsStatus> {
    let (chunkid, length) = m.tree.read_chunk(inode, indx)?;
    let mut p = Packet::new(MATOCL_FUSE_READ_CHUNK);
    p.put_u32(msgid).put_u64(length).put_u64(chunkid);
    if chunkid != 0 {
        let (version, servers) = m.chunks.version_and_servers(chunkid)?;
        p.put_u32(version);
        p.put_u8(servers.len() as u8);
        for &csid in servers {
            p.put_u16(csid);
        }
    } else {
        p.put_u32(0).put_u8(0);
    }
    Ok(p)
}

fn write_chunk_payload(m: &mut Master, ts: u32, inode: u32, indx: u32, msgid: u32) -> Result<Packet, MfsStatus> {
    let sclass = &m.sclass;
    let (chunkid, version) =
        m.tree.write_chunk(&mut m.chlog, ts, sclass, &mut m.chunks, inode, indx)?;
    let length = m.tree.node(inode).map(|n| n.length()).unwrap_or(0);
    let mut p = Packet::new(MATOCL_FUSE_WRITE_CHUNK);
    p.put_u32(msgid).put_u64(length).put_u64(chunkid).put_u32(version);
    Ok(p)
}

fn dispatch_inner(
    m: &mut Master,
    conn: &mut ClientConn,
    ts: u32,
    packet: &Packet,
    out: &mut DispatchOutput,
) -> Result<()> {
    if packet.ptype == ANTOAN_NOP {
        return Ok(());
    }
    debug!("dispatch {} (0x{:X}), {} bytes", op_name(packet.ptype), packet.ptype, packet.data.len());
    if conn.registered == REGSTATE_UNREGISTERED && packet.ptype != CLTOMA_FUSE_REGISTER {
        bail!("message 0x{:X} before registration", packet.ptype);
    }
    let mut c = Cursor::new(&packet.data);
    match packet.ptype {
        CLTOMA_FUSE_REGISTER => handle_register(m, conn, ts, &mut c, out)?,
        CLTOMA_FUSE_STATFS => {
            let msgid = c.get_u32()?;
            c.expect_end()?;
            bump(m, conn, SES_OP_STATFS);
            let mut p = Packet::new(MATOCL_FUSE_STATFS);
            p.put_u32(msgid)
                .put_u64(0) // total space: chunk servers report it
                .put_u64(0)
                .put_u64(0)
                .put_u64(0)
                .put_u32(m.tree.node_count() as u32);
            out.replies.push(p);
        }
        CLTOMA_FUSE_ACCESS => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            let _uid = c.get_u32()?;
            let _gid = c.get_u32()?;
            let _modemask = c.get_u8()?;
            c.expect_end()?;
            let status = match m.tree.access(&mut m.chlog, ts, inode) {
                Ok(()) => MfsStatus::Ok,
                Err(s) => s,
            };
            out.replies.push(status_reply(MATOCL_FUSE_ACCESS, msgid, status));
        }
        CLTOMA_FUSE_LOOKUP => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            let name = c.get_name()?;
            let _uid = c.get_u32()?;
            let _gids = read_gids(&mut c)?;
            c.expect_end()?;
            bump(m, conn, SES_OP_LOOKUP);
            match m.tree.lookup(inode, name) {
                Ok(found) => {
                    out.replies.push(node_attr_reply(m, conn, MATOCL_FUSE_LOOKUP, msgid, found))
                }
                Err(s) => out.replies.push(status_reply(MATOCL_FUSE_LOOKUP, msgid, s)),
            }
        }
        CLTOMA_FUSE_GETATTR => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            let _uid = c.get_u32()?;
            let _gid = c.get_u32()?;
            c.expect_end()?;
            bump(m, conn, SES_OP_GETATTR);
            out.replies.push(node_attr_reply(m, conn, MATOCL_FUSE_GETATTR, msgid, inode));
        }
        CLTOMA_FUSE_SETATTR => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            let _uid = c.get_u32()?;
            let _gids = read_gids(&mut c)?;
            let setmask = c.get_u8()?;
            let mode = c.get_u16()?;
            let auid = c.get_u32()?;
            let agid = c.get_u32()?;
            let atime = c.get_u32()?;
            let mtime = c.get_u32()?;
            let winattr = c.get_u8()?;
            c.expect_end()?;
            bump(m, conn, SES_OP_SETATTR);
            if readonly_guard(m, conn, msgid, MATOCL_FUSE_SETATTR, out) {
                return Ok(());
            }
            if disables_guard(m, conn, DISABLE_CHOWN | DISABLE_CHMOD, msgid, MATOCL_FUSE_SETATTR, out)
            {
                return Ok(());
            }
            let status = match m.tree.node(inode) {
                None => MfsStatus::ENoEnt,
                Some(n) => {
                    let mode = if setmask & 0x01 != 0 { mode } else { n.mode };
                    let auid = if setmask & 0x02 != 0 { auid } else { n.uid };
                    let agid = if setmask & 0x04 != 0 { agid } else { n.gid };
                    let atime = if setmask & 0x08 != 0 { atime } else { n.atime };
                    let mtime = if setmask & 0x10 != 0 { mtime } else { n.mtime };
                    let winattr = if setmask & 0x20 != 0 { winattr } else { n.winattr };
                    match m.tree.setattr(&mut m.chlog, ts, inode, mode, auid, agid, atime, mtime, winattr)
                    {
                        Ok(()) => MfsStatus::Ok,
                        Err(s) => s,
                    }
                }
            };
            if status == MfsStatus::Ok {
                out.replies.push(node_attr_reply(m, conn, MATOCL_FUSE_SETATTR, msgid, inode));
            } else {
                out.replies.push(status_reply(MATOCL_FUSE_SETATTR, msgid, status));
            }
        }
        CLTOMA_FUSE_READLINK => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            c.expect_end()?;
            bump(m, conn, SES_OP_READLINK);
            match m.tree.readlink(inode) {
                Ok(target) => {
                    let mut p = Packet::new(MATOCL_FUSE_READLINK);
                    p.put_u32(msgid).put_data(target);
                    out.replies.push(p);
                }
                Err(s) => out.replies.push(status_reply(MATOCL_FUSE_READLINK, msgid, s)),
            }
        }
        CLTOMA_FUSE_SYMLINK => {
            let msgid = c.get_u32()?;
            let parent = c.get_u32()?;
            let name = c.get_name()?.to_vec();
            let target = c.get_data()?.to_vec();
            let uid = c.get_u32()?;
            let gids = read_gids(&mut c)?;
            c.expect_end()?;
            bump(m, conn, SES_OP_SYMLINK);
            if readonly_guard(m, conn, msgid, MATOCL_FUSE_SYMLINK, out)
                || disables_guard(m, conn, DISABLE_SYMLINK, msgid, MATOCL_FUSE_SYMLINK, out)
            {
                return Ok(());
            }
            let res = {
                let patterns = std::mem::take(&mut m.patterns);
                let r = m.tree.symlink(&mut m.chlog, ts, &mut m.sclass, &patterns, parent, &name, &target, uid, &gids);
                m.patterns = patterns;
                r
            };
            match res {
                Ok(inode) => {
                    out.replies.push(node_attr_reply(m, conn, MATOCL_FUSE_SYMLINK, msgid, inode))
                }
                Err(s) => out.replies.push(status_reply(MATOCL_FUSE_SYMLINK, msgid, s)),
            }
        }
        CLTOMA_FUSE_MKNOD | CLTOMA_FUSE_MKDIR => {
            let is_mkdir = packet.ptype == CLTOMA_FUSE_MKDIR;
            let rtype = if is_mkdir { MATOCL_FUSE_MKDIR } else { MATOCL_FUSE_MKNOD };
            let msgid = c.get_u32()?;
            let parent = c.get_u32()?;
            let name = c.get_name()?.to_vec();
            let ntype = if is_mkdir { u8::from(NodeType::Directory) } else { c.get_u8()? };
            let mode = c.get_u16()?;
            let cumask = c.get_u16()?;
            let uid = c.get_u32()?;
            let gids = read_gids(&mut c)?;
            let rdev = if is_mkdir { 0 } else { c.get_u32()? };
            c.expect_end()?;
            bump(m, conn, if is_mkdir { SES_OP_MKDIR } else { SES_OP_MKNOD });
            if readonly_guard(m, conn, msgid, rtype, out) {
                return Ok(());
            }
            let ntype = match NodeType::try_from(ntype) {
                Ok(t) => t,
                Err(_) => {
                    out.replies.push(status_reply(rtype, msgid, MfsStatus::EInval));
                    return Ok(());
                }
            };
            let disable_bit = match ntype {
                NodeType::Directory => DISABLE_MKDIR,
                NodeType::Fifo => DISABLE_MKFIFO,
                NodeType::BlockDev | NodeType::CharDev => DISABLE_MKDEV,
                NodeType::Socket => DISABLE_MKSOCK,
                _ => DISABLE_CREATE,
            };
            if disables_guard(m, conn, disable_bit, msgid, rtype, out) {
                return Ok(());
            }
            let res = {
                let patterns = std::mem::take(&mut m.patterns);
                let r = m.tree.create(&mut m.chlog, ts, &mut m.sclass, &patterns, parent, &name,
                                      ntype, mode, cumask, uid, &gids, rdev);
                m.patterns = patterns;
                r
            };
            match res {
                Ok(inode) => out.replies.push(node_attr_reply(m, conn, rtype, msgid, inode)),
                Err(s) => out.replies.push(status_reply(rtype, msgid, s)),
            }
        }
        CLTOMA_FUSE_UNLINK | CLTOMA_FUSE_RMDIR => {
            let is_rmdir = packet.ptype == CLTOMA_FUSE_RMDIR;
            let rtype = if is_rmdir { MATOCL_FUSE_RMDIR } else { MATOCL_FUSE_UNLINK };
            let msgid = c.get_u32()?;
            let parent = c.get_u32()?;
            let name = c.get_name()?.to_vec();
            let _uid = c.get_u32()?;
            let _gids = read_gids(&mut c)?;
            c.expect_end()?;
            bump(m, conn, if is_rmdir { SES_OP_RMDIR } else { SES_OP_UNLINK });
            if readonly_guard(m, conn, msgid, rtype, out)
                || disables_guard(m, conn, if is_rmdir { DISABLE_RMDIR } else { DISABLE_UNLINK },
                                  msgid, rtype, out)
            {
                return Ok(());
            }
            let status = if is_rmdir {
                match m.tree.rmdir(&mut m.chlog, ts, &mut m.sclass, &mut m.chunks, parent, &name) {
                    Ok(_) => MfsStatus::Ok,
                    Err(s) => s,
                }
            } else {
                let openfiles = std::mem::take(&mut m.openfiles);
                let r = m.tree.unlink(&mut m.chlog, ts, &mut m.sclass, &mut m.chunks, parent, &name,
                                      |ino| openfiles.is_file_open(ino));
                m.openfiles = openfiles;
                match r {
                    Ok(_) => MfsStatus::Ok,
                    Err(s) => s,
                }
            };
            out.replies.push(status_reply(rtype, msgid, status));
        }
        CLTOMA_FUSE_RENAME => {
            let msgid = c.get_u32()?;
            let parent_src = c.get_u32()?;
            let name_src = c.get_name()?.to_vec();
            let parent_dst = c.get_u32()?;
            let name_dst = c.get_name()?.to_vec();
            let _uid = c.get_u32()?;
            let _gids = read_gids(&mut c)?;
            c.expect_end()?;
            bump(m, conn, SES_OP_RENAME);
            if readonly_guard(m, conn, msgid, MATOCL_FUSE_RENAME, out)
                || disables_guard(m, conn, DISABLE_RENAME | DISABLE_MOVE, msgid, MATOCL_FUSE_RENAME, out)
            {
                return Ok(());
            }
            let openfiles = std::mem::take(&mut m.openfiles);
            let r = m.tree.rename(&mut m.chlog, ts, &mut m.sclass, &mut m.chunks, parent_src,
                                  &name_src, parent_dst, &name_dst, |ino| openfiles.is_file_open(ino));
            m.openfiles = openfiles;
            match r {
                Ok(inode) => {
                    out.replies.push(node_attr_reply(m, conn, MATOCL_FUSE_RENAME, msgid, inode))
                }
                Err(s) => out.replies.push(status_reply(MATOCL_FUSE_RENAME, msgid, s)),
            }
        }
        CLTOMA_FUSE_LINK => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            let parent = c.get_u32()?;
            let name = c.get_name()?.to_vec();
            let _uid = c.get_u32()?;
            let _gids = read_gids(&mut c)?;
            c.expect_end()?;
            bump(m, conn, SES_OP_LINK);
            if readonly_guard(m, conn, msgid, MATOCL_FUSE_LINK, out)
                || disables_guard(m, conn, DISABLE_LINK, msgid, MATOCL_FUSE_LINK, out)
            {
                return Ok(());
            }
            match m.tree.link(&mut m.chlog, ts, inode, parent, &name) {
                Ok(()) => out.replies.push(node_attr_reply(m, conn, MATOCL_FUSE_LINK, msgid, inode)),
                Err(s) => out.replies.push(status_reply(MATOCL_FUSE_LINK, msgid, s)),
            }
        }
        CLTOMA_FUSE_READDIR => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            let _uid = c.get_u32()?;
            let _gids = read_gids(&mut c)?;
            let maxentries = c.get_u32()? as usize;
            let nedgeid = c.get_u64()?;
            c.expect_end()?;
            bump(m, conn, SES_OP_READDIR);
            if disables_guard(m, conn, DISABLE_READDIR, msgid, MATOCL_FUSE_READDIR, out) {
                return Ok(());
            }
            match m.tree.readdir(inode, nedgeid, maxentries.clamp(1, 65536)) {
                Ok(entries) => {
                    let mut p = Packet::new(MATOCL_FUSE_READDIR);
                    p.put_u32(msgid);
                    let next = entries.last().map(|e| e.0).unwrap_or(0);
                    p.put_u64(next);
                    for (_, name, ino, ntype) in entries {
                        p.put_name(&name);
                        p.put_u32(ino);
                        p.put_u8(ntype.into());
                    }
                    out.replies.push(p);
                }
                Err(s) => out.replies.push(status_reply(MATOCL_FUSE_READDIR, msgid, s)),
            }
        }
        CLTOMA_FUSE_OPEN => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            let _uid = c.get_u32()?;
            let _gids = read_gids(&mut c)?;
            let flags = c.get_u8()?;
            c.expect_end()?;
            bump(m, conn, SES_OP_OPEN);
            let want_write = flags & 0x02 != 0;
            if want_write && readonly_guard(m, conn, msgid, MATOCL_FUSE_OPEN, out) {
                return Ok(());
            }
            let status = match m.tree.node(inode) {
                None => MfsStatus::ENoEnt,
                Some(n) if !n.ntype.is_file_like() => MfsStatus::EPerm,
                Some(_) => {
                    m.openfiles.open_file(&mut m.chlog, ts, conn.sessionid, inode);
                    MfsStatus::Ok
                }
            };
            if status == MfsStatus::Ok {
                out.replies.push(node_attr_reply(m, conn, MATOCL_FUSE_OPEN, msgid, inode));
            } else {
                out.replies.push(status_reply(MATOCL_FUSE_OPEN, msgid, status));
            }
        }
        CLTOMA_FUSE_READ_CHUNK => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            let indx = c.get_u32()?;
            c.expect_end()?;
            bump(m, conn, SES_OP_READCHUNK);
            if disables_guard(m, conn, DISABLE_READ, msgid, MATOCL_FUSE_READ_CHUNK, out) {
                return Ok(());
            }
            // reading a chunk mid-write parks until the writer finishes
            match m.tree.read_chunk(inode, indx) {
                Ok((chunkid, _)) if chunkid != 0 && m.chunks.get(chunkid).map_or(false, |e| e.locked(ts)) => {
                    m.chunks.add_waiter(
                        chunkid,
                        ChunkWaiter {
                            sessionid: conn.sessionid,
                            msgid,
                            inode,
                            indx,
                            write: false,
                            deadline: 0,
                            status: MfsStatus::Locked,
                        },
                        ts,
                    );
                }
                Ok(_) => match read_chunk_payload(m, inode, indx, msgid) {
                    Ok(p) => out.replies.push(p),
                    Err(s) => out.replies.push(status_reply(MATOCL_FUSE_READ_CHUNK, msgid, s)),
                },
                Err(s) => out.replies.push(status_reply(MATOCL_FUSE_READ_CHUNK, msgid, s)),
            }
        }
        CLTOMA_FUSE_WRITE_CHUNK => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            let indx = c.get_u32()?;
            c.expect_end()?;
            bump(m, conn, SES_OP_WRITECHUNK);
            if readonly_guard(m, conn, msgid, MATOCL_FUSE_WRITE_CHUNK, out)
                || disables_guard(m, conn, DISABLE_WRITE, msgid, MATOCL_FUSE_WRITE_CHUNK, out)
            {
                return Ok(());
            }
            if !m.openfiles.checknode(conn.sessionid, inode) {
                out.replies.push(status_reply(MATOCL_FUSE_WRITE_CHUNK, msgid, MfsStatus::NotOpened));
                return Ok(());
            }
            match write_chunk_payload(m, ts, inode, indx, msgid) {
                Ok(p) => out.replies.push(p),
                Err(MfsStatus::Locked) => {
                    let chunkid = m.tree.read_chunk(inode, indx).map(|(cid, _)| cid).unwrap_or(0);
                    m.chunks.add_waiter(
                        chunkid,
                        ChunkWaiter {
                            sessionid: conn.sessionid,
                            msgid,
                            inode,
                            indx,
                            write: true,
                            deadline: 0,
                            status: MfsStatus::Locked,
                        },
                        ts,
                    );
                }
                Err(s) => out.replies.push(status_reply(MATOCL_FUSE_WRITE_CHUNK, msgid, s)),
            }
        }
        CLTOMA_FUSE_WRITE_CHUNK_END => {
            let msgid = c.get_u32()?;
            let chunkid = c.get_u64()?;
            let inode = c.get_u32()?;
            let length = c.get_u64()?;
            c.expect_end()?;
            let status = match m.tree.write_chunk_end(&mut m.chlog, ts, &mut m.chunks, chunkid, inode, length)
            {
                Ok(waiters) => {
                    for w in waiters {
                        let (sid, p) = answer_chunk_waiter(m, ts, &w, false);
                        out.deferred.push((sid, p));
                    }
                    MfsStatus::Ok
                }
                Err(s) => s,
            };
            out.replies.push(status_reply(MATOCL_FUSE_WRITE_CHUNK_END, msgid, status));
        }
        CLTOMA_FUSE_CHECK => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            c.expect_end()?;
            // histogram of chunks by valid copy count
            match m.tree.node(inode) {
                None => out.replies.push(status_reply(MATOCL_FUSE_CHECK, msgid, MfsStatus::ENoEnt)),
                Some(n) => {
                    let mut counters = [0u32; 12];
                    if let crate::rmfs_lib::fsnodes::NodeData::File { chunks, .. } = &n.data {
                        for &cid in chunks.iter().filter(|&&c| c != 0) {
                            let vc = m
                                .chunks
                                .get(cid)
                                .map(|e| e.valid_copies().min(11) as usize)
                                .unwrap_or(0);
                            counters[vc] += 1;
                        }
                    }
                    let mut p = Packet::new(MATOCL_FUSE_CHECK);
                    p.put_u32(msgid);
                    for v in counters {
                        p.put_u32(v);
                    }
                    out.replies.push(p);
                }
            }
        }
        CLTOMA_FUSE_GETTRASHRETENTION => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            c.expect_end()?;
            match m.tree.node(inode) {
                Some(n) => {
                    let mut p = Packet::new(MATOCL_FUSE_GETTRASHRETENTION);
                    p.put_u32(msgid).put_u32(n.trashretention as u32);
                    out.replies.push(p);
                }
                None => out
                    .replies
                    .push(status_reply(MATOCL_FUSE_GETTRASHRETENTION, msgid, MfsStatus::ENoEnt)),
            }
        }
        CLTOMA_FUSE_SETTRASHRETENTION => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            let uid = c.get_u32()?;
            let trashretention = c.get_u32()?;
            let smode = c.get_u8()?;
            c.expect_end()?;
            if readonly_guard(m, conn, msgid, MATOCL_FUSE_SETTRASHRETENTION, out)
                || disables_guard(m, conn, DISABLE_SETTRASH, msgid, MATOCL_FUSE_SETTRASHRETENTION, out)
            {
                return Ok(());
            }
            match session(m, conn) {
                Ok(ses) if !ses.check_trashretention(smode, trashretention) => {
                    out.replies
                        .push(status_reply(MATOCL_FUSE_SETTRASHRETENTION, msgid, MfsStatus::EPerm));
                }
                Err(s) => out.replies.push(status_reply(MATOCL_FUSE_SETTRASHRETENTION, msgid, s)),
                Ok(_) => {
                    match m.tree.settrashretention(&mut m.chlog, ts, inode, uid,
                                                   trashretention.min(u16::MAX as u32) as u16, smode)
                    {
                        Ok((ci, nci, npi)) => {
                            let mut p = Packet::new(MATOCL_FUSE_SETTRASHRETENTION);
                            p.put_u32(msgid).put_u32(ci).put_u32(nci).put_u32(npi);
                            out.replies.push(p);
                        }
                        Err(s) => {
                            out.replies.push(status_reply(MATOCL_FUSE_SETTRASHRETENTION, msgid, s))
                        }
                    }
                }
            }
        }
        CLTOMA_FUSE_GETSCLASS => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            c.expect_end()?;
            match m.tree.node(inode) {
                Some(n) => {
                    let name = m.sclass.get_name(n.sclassid).to_vec();
                    let mut p = Packet::new(MATOCL_FUSE_GETSCLASS);
                    p.put_u32(msgid).put_u8(n.sclassid).put_name(&name);
                    out.replies.push(p);
                }
                None => {
                    out.replies.push(status_reply(MATOCL_FUSE_GETSCLASS, msgid, MfsStatus::ENoEnt))
                }
            }
        }
        CLTOMA_FUSE_SETSCLASS => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            let uid = c.get_u32()?;
            let smode = c.get_u8()?;
            let src_name = c.get_name()?.to_vec();
            let dst_name = c.get_name()?.to_vec();
            c.expect_end()?;
            if readonly_guard(m, conn, msgid, MATOCL_FUSE_SETSCLASS, out)
                || disables_guard(m, conn, DISABLE_SETSCLASS, msgid, MATOCL_FUSE_SETSCLASS, out)
            {
                return Ok(());
            }
            let status = set_sclass(m, conn, ts, inode, uid, smode, &src_name, &dst_name, out, msgid);
            if let Err(s) = status {
                out.replies.push(status_reply(MATOCL_FUSE_SETSCLASS, msgid, s));
            }
        }
        CLTOMA_FUSE_GETTRASH => {
            let msgid = c.get_u32()?;
            c.expect_end()?;
            let mut p = Packet::new(MATOCL_FUSE_GETTRASH);
            p.put_u32(msgid);
            let mut entries: Vec<(u32, Vec<u8>)> =
                m.tree.trash_nodes().map(|(&i, p)| (i, p.clone())).collect();
            entries.sort_unstable();
            for (inode, path) in entries {
                p.put_u32(inode).put_data(&path);
            }
            out.replies.push(p);
        }
        CLTOMA_FUSE_GETSUSTAINED => {
            let msgid = c.get_u32()?;
            c.expect_end()?;
            let mut p = Packet::new(MATOCL_FUSE_GETSUSTAINED);
            p.put_u32(msgid);
            let mut entries: Vec<(u32, Vec<u8>)> =
                m.tree.sustained_nodes().map(|(&i, p)| (i, p.clone())).collect();
            entries.sort_unstable();
            for (inode, path) in entries {
                p.put_u32(inode).put_data(&path);
            }
            out.replies.push(p);
        }
        CLTOMA_FUSE_GETDETACHEDATTR => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            c.expect_end()?;
            out.replies.push(node_attr_reply(m, conn, MATOCL_FUSE_GETDETACHEDATTR, msgid, inode));
        }
        CLTOMA_FUSE_GETTRASHPATH => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            c.expect_end()?;
            match m.tree.trash_path(inode) {
                Ok(path) => {
                    let mut p = Packet::new(MATOCL_FUSE_GETTRASHPATH);
                    p.put_u32(msgid).put_data(path);
                    out.replies.push(p);
                }
                Err(s) => out.replies.push(status_reply(MATOCL_FUSE_GETTRASHPATH, msgid, s)),
            }
        }
        CLTOMA_FUSE_SETTRASHPATH => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            let path = c.get_data()?.to_vec();
            c.expect_end()?;
            let status = match m.tree.set_trash_path(&mut m.chlog, ts, inode, &path) {
                Ok(()) => MfsStatus::Ok,
                Err(s) => s,
            };
            out.replies.push(status_reply(MATOCL_FUSE_SETTRASHPATH, msgid, status));
        }
        CLTOMA_FUSE_UNDEL => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            c.expect_end()?;
            let status = match m.tree.undel(&mut m.chlog, ts, &mut m.sclass, inode) {
                Ok(()) => MfsStatus::Ok,
                Err(s) => s,
            };
            out.replies.push(status_reply(MATOCL_FUSE_UNDEL, msgid, status));
        }
        CLTOMA_FUSE_PURGE => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            c.expect_end()?;
            let status = match m.tree.purge(&mut m.chlog, ts, &mut m.sclass, &mut m.chunks, inode) {
                Ok(()) => MfsStatus::Ok,
                Err(s) => s,
            };
            out.replies.push(status_reply(MATOCL_FUSE_PURGE, msgid, status));
        }
        CLTOMA_FUSE_GETEATTR => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            c.expect_end()?;
            match m.tree.node(inode) {
                Some(n) => {
                    let mut p = Packet::new(MATOCL_FUSE_GETEATTR);
                    p.put_u32(msgid).put_u8(n.eattr);
                    out.replies.push(p);
                }
                None => {
                    out.replies.push(status_reply(MATOCL_FUSE_GETEATTR, msgid, MfsStatus::ENoEnt))
                }
            }
        }
        CLTOMA_FUSE_SETEATTR => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            let uid = c.get_u32()?;
            let eattr = c.get_u8()?;
            let smode = c.get_u8()?;
            c.expect_end()?;
            if readonly_guard(m, conn, msgid, MATOCL_FUSE_SETEATTR, out)
                || disables_guard(m, conn, DISABLE_SETEATTR, msgid, MATOCL_FUSE_SETEATTR, out)
            {
                return Ok(());
            }
            match m.tree.seteattr(&mut m.chlog, ts, inode, uid, eattr, smode) {
                Ok((ci, nci, npi)) => {
                    let mut p = Packet::new(MATOCL_FUSE_SETEATTR);
                    p.put_u32(msgid).put_u32(ci).put_u32(nci).put_u32(npi);
                    out.replies.push(p);
                }
                Err(s) => out.replies.push(status_reply(MATOCL_FUSE_SETEATTR, msgid, s)),
            }
        }
        CLTOMA_FUSE_GETXATTR => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            let opmode = c.get_u8()?; // 0 = get value, 1 = list names
            let name = c.get_name()?.to_vec();
            c.expect_end()?;
            if opmode == 1 {
                let mut p = Packet::new(MATOCL_FUSE_GETXATTR);
                p.put_u32(msgid);
                let names = m.tree.listxattr(inode);
                let total: usize = names.iter().map(|n| n.len() + 1).sum();
                p.put_u32(total as u32);
                for n in names {
                    p.put_bytes(n);
                    p.put_u8(0);
                }
                out.replies.push(p);
            } else {
                match m.tree.getxattr(inode, &name) {
                    Ok(value) => {
                        let mut p = Packet::new(MATOCL_FUSE_GETXATTR);
                        p.put_u32(msgid).put_data(value);
                        out.replies.push(p);
                    }
                    Err(s) => out.replies.push(status_reply(MATOCL_FUSE_GETXATTR, msgid, s)),
                }
            }
        }
        CLTOMA_FUSE_SETXATTR => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            let name = c.get_name()?.to_vec();
            let value = c.get_data()?.to_vec();
            let mode = c.get_u8()?;
            c.expect_end()?;
            if readonly_guard(m, conn, msgid, MATOCL_FUSE_SETXATTR, out)
                || disables_guard(m, conn, DISABLE_SETXATTR, msgid, MATOCL_FUSE_SETXATTR, out)
            {
                return Ok(());
            }
            let status = match m.tree.setxattr(&mut m.chlog, ts, inode, &name, &value, mode) {
                Ok(()) => MfsStatus::Ok,
                Err(s) => s,
            };
            out.replies.push(status_reply(MATOCL_FUSE_SETXATTR, msgid, status));
        }
        CLTOMA_FUSE_GETQUOTA => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            c.expect_end()?;
            match m.tree.quota_get(inode) {
                Some(q) => {
                    let st = m.tree.subtree_stats(inode);
                    let mut p = Packet::new(MATOCL_FUSE_GETQUOTA);
                    p.put_u32(msgid)
                        .put_u8(q.flags)
                        .put_u8(q.exceeded as u8)
                        .put_u32(q.stimestamp)
                        .put_u32(q.sinodes)
                        .put_u32(q.hinodes)
                        .put_u64(q.slength)
                        .put_u64(q.hlength)
                        .put_u64(q.ssize)
                        .put_u64(q.hsize)
                        .put_u64(q.srealsize)
                        .put_u64(q.hrealsize)
                        .put_u32(st.inodes)
                        .put_u64(st.length)
                        .put_u64(st.size)
                        .put_u64(st.realsize);
                    out.replies.push(p);
                }
                None => {
                    out.replies.push(status_reply(MATOCL_FUSE_GETQUOTA, msgid, MfsStatus::ENoAttr))
                }
            }
        }
        CLTOMA_FUSE_SETQUOTA => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            let flags = c.get_u8()?;
            let sinodes = c.get_u32()?;
            let hinodes = c.get_u32()?;
            let slength = c.get_u64()?;
            let hlength = c.get_u64()?;
            let ssize = c.get_u64()?;
            let hsize = c.get_u64()?;
            let srealsize = c.get_u64()?;
            let hrealsize = c.get_u64()?;
            let timelimit = c.get_u32()?;
            c.expect_end()?;
            let status = match session(m, conn) {
                Err(s) => s,
                Ok(ses) if ses.sesflags & SESFLAG_ADMIN == 0 => MfsStatus::EPermNotAdmin,
                Ok(_) => {
                    let q = QuotaEntry {
                        flags,
                        exceeded: false,
                        stimestamp: 0,
                        sinodes,
                        hinodes,
                        slength,
                        hlength,
                        ssize,
                        hsize,
                        srealsize,
                        hrealsize,
                        timelimit,
                    };
                    match m.tree.quota_set(&mut m.chlog, ts, inode, q) {
                        Ok(()) => MfsStatus::Ok,
                        Err(s) => s,
                    }
                }
            };
            out.replies.push(status_reply(MATOCL_FUSE_SETQUOTA, msgid, status));
        }
        CLTOMA_FUSE_FLOCK => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            let reqid = c.get_u32()?;
            let owner = c.get_u64()?;
            let op = c.get_u8()?;
            c.expect_end()?;
            let opened = m.openfiles.checknode(conn.sessionid, inode);
            let status =
                m.flocks.cmd(&mut m.chlog, ts, conn.sessionid, msgid, reqid, inode, owner, op, opened);
            if status != MfsStatus::Waiting {
                out.replies.push(status_reply(MATOCL_FUSE_FLOCK, msgid, status));
            }
        }
        CLTOMA_FUSE_POSIX_LOCK => {
            let msgid = c.get_u32()?;
            let inode = c.get_u32()?;
            let reqid = c.get_u32()?;
            let owner = c.get_u64()?;
            let pid = c.get_u32()?;
            let cmd = c.get_u8()?;
            let rtype = c.get_u8()?;
            let start = c.get_u64()?;
            let end = c.get_u64()?;
            c.expect_end()?;
            let opened = m.openfiles.checknode(conn.sessionid, inode);
            let (status, getinfo) = m.plocks.cmd(&mut m.chlog, ts, conn.sessionid, msgid, reqid,
                                                 inode, owner, cmd, rtype, start, end, pid, opened);
            if cmd == POSIX_LOCK_CMD_GET && status == MfsStatus::Ok {
                let (rtype, start, end, pid) = getinfo.unwrap_or((POSIX_LOCK_UNLCK, 0, 0, 0));
                let mut p = Packet::new(MATOCL_FUSE_POSIX_LOCK);
                p.put_u32(msgid).put_u32(pid).put_u8(rtype).put_u64(start).put_u64(end);
                out.replies.push(p);
            } else if status != MfsStatus::Waiting {
                out.replies.push(status_reply(MATOCL_FUSE_POSIX_LOCK, msgid, status));
            }
        }
        CLTOMA_SCLASS_CREATE | CLTOMA_SCLASS_CHANGE => {
            let is_change = packet.ptype == CLTOMA_SCLASS_CHANGE;
            let rtype = if is_change { MATOCL_SCLASS_CHANGE } else { MATOCL_SCLASS_CREATE };
            let msgid = c.get_u32()?;
            let name = c.get_name()?.to_vec();
            let chgmask = if is_change { c.get_u16()? } else { 0xFFFF };
            let admin_only = c.get_u8()? != 0;
            let export_group = c.get_u8()?;
            let arch_mode = c.get_u8()?;
            let arch_delay = c.get_u16()?;
            let arch_min_size = c.get_u64()?;
            let min_trashretention = c.get_u16()?;
            let mut sets = Vec::with_capacity(4);
            for _ in 0..4 {
                let expr = c.get_data()?.to_vec();
                match SclassSet::parse(&expr) {
                    Ok(s) => sets.push(s),
                    Err(s) => {
                        out.replies.push(status_reply(rtype, msgid, s));
                        return Ok(());
                    }
                }
            }
            c.expect_end()?;
            let trash = sets.pop().unwrap();
            let arch = sets.pop().unwrap();
            let keep = sets.pop().unwrap();
            let create = sets.pop().unwrap();
            let sc = StorageClass {
                name: name.clone(),
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
            };
            let res = if is_change {
                m.sclass.change(&mut m.chlog, ts, &name, chgmask, &sc)
            } else {
                m.sclass.create(&mut m.chlog, ts, sc)
            };
            match res {
                Ok(id) => {
                    let mut p = Packet::new(rtype);
                    p.put_u32(msgid).put_u8(id);
                    out.replies.push(p);
                }
                Err(s) => out.replies.push(status_reply(rtype, msgid, s)),
            }
        }
        CLTOMA_SCLASS_DELETE => {
            let msgid = c.get_u32()?;
            let name = c.get_name()?.to_vec();
            c.expect_end()?;
            let status = match m.sclass.delete(&mut m.chlog, ts, &name) {
                Ok(id) => {
                    m.patterns.sclass_deleted(id);
                    MfsStatus::Ok
                }
                Err(s) => s,
            };
            out.replies.push(status_reply(MATOCL_SCLASS_DELETE, msgid, status));
        }
        CLTOMA_SCLASS_DUPLICATE => {
            let msgid = c.get_u32()?;
            let sname = c.get_name()?.to_vec();
            let dname = c.get_name()?.to_vec();
            c.expect_end()?;
            let status = match m.sclass.duplicate(&mut m.chlog, ts, &sname, &dname) {
                Ok(_) => MfsStatus::Ok,
                Err(s) => s,
            };
            out.replies.push(status_reply(MATOCL_SCLASS_DUPLICATE, msgid, status));
        }
        CLTOMA_SCLASS_RENAME => {
            let msgid = c.get_u32()?;
            let sname = c.get_name()?.to_vec();
            let dname = c.get_name()?.to_vec();
            c.expect_end()?;
            let status = match m.sclass.rename(&mut m.chlog, ts, &sname, &dname) {
                Ok(_) => MfsStatus::Ok,
                Err(s) => s,
            };
            out.replies.push(status_reply(MATOCL_SCLASS_RENAME, msgid, status));
        }
        CLTOMA_SCLASS_LIST => {
            let msgid = c.get_u32()?;
            let longmode = c.get_u8()?;
            c.expect_end()?;
            let mut p = Packet::new(MATOCL_SCLASS_LIST);
            p.put_u32(msgid);
            for id in m.sclass.list_ids() {
                let sc = m.sclass.get(id).unwrap();
                p.put_u8(id).put_name(&sc.name);
                if longmode != 0 {
                    p.put_u8(sc.admin_only as u8)
                        .put_u8(sc.export_group)
                        .put_u8(sc.arch_mode)
                        .put_u16(sc.arch_delay)
                        .put_u64(sc.arch_min_size)
                        .put_u16(sc.min_trashretention);
                    for set in [&sc.create, &sc.keep, &sc.arch, &sc.trash] {
                        p.put_data(set.render().as_bytes());
                    }
                }
            }
            out.replies.push(p);
        }
        CLTOMA_FUSE_SUSTAINED_INODES => {
            // the reconnecting client reports its full open-inode set;
            // the recorded relation is diffed against it and every pair
            // dropped on the way also loses its advisory locks
            let mut inodes = Vec::with_capacity(c.remaining() / 4);
            while c.remaining() >= 4 {
                inodes.push(c.get_u32()?);
            }
            c.expect_end()?;
            let released = m.openfiles.sync(&mut m.chlog, ts, conn.sessionid, &inodes);
            for (sid, inode) in released {
                m.flocks.file_closed(&mut m.chlog, ts, sid, inode);
                m.plocks.file_closed(&mut m.chlog, ts, sid, inode);
            }
            // no reply; the message is a one-way report
        }
        CLTOMA_PATTERN_ADD => {
            let msgid = c.get_u32()?;
            let gname = c.get_name()?.to_vec();
            let euid = c.get_u32()?;
            let egid = c.get_u32()?;
            let priority = c.get_u8()?;
            let omask = c.get_u8()?;
            let scname = c.get_name()?.to_vec();
            let trashretention = c.get_u16()?;
            let seteattr = c.get_u8()?;
            let clreattr = c.get_u8()?;
            c.expect_end()?;
            let scid = if omask & PATTERN_OMASK_SCLASS != 0 {
                match m.sclass.find_by_name(&scname) {
                    Some(id) => id,
                    None => {
                        out.replies
                            .push(status_reply(MATOCL_PATTERN_ADD, msgid, MfsStatus::NoSuchClass));
                        return Ok(());
                    }
                }
            } else {
                0
            };
            let status = m.patterns.add(
                &mut m.chlog,
                ts,
                crate::rmfs_lib::patterns::Pattern {
                    gname,
                    euid,
                    egid,
                    priority,
                    omask,
                    scid,
                    trashretention,
                    seteattr,
                    clreattr,
                },
            );
            out.replies.push(status_reply(MATOCL_PATTERN_ADD, msgid, status));
        }
        CLTOMA_PATTERN_DELETE => {
            let msgid = c.get_u32()?;
            let gname = c.get_name()?.to_vec();
            let euid = c.get_u32()?;
            let egid = c.get_u32()?;
            c.expect_end()?;
            let status = m.patterns.delete(&mut m.chlog, ts, &gname, euid, egid);
            out.replies.push(status_reply(MATOCL_PATTERN_DELETE, msgid, status));
        }
        CLTOMA_PATTERN_LIST => {
            let msgid = c.get_u32()?;
            c.expect_end()?;
            let mut p = Packet::new(MATOCL_PATTERN_LIST);
            p.put_u32(msgid);
            for pat in m.patterns.iter() {
                p.put_name(&pat.gname);
                p.put_u32(pat.euid);
                p.put_u32(pat.egid);
                p.put_u8(pat.priority);
                p.put_u8(pat.omask);
                let scname = m.sclass.get_name(pat.scid).to_vec();
                p.put_name(&scname);
                p.put_u16(pat.trashretention);
                p.put_u8(pat.seteattr);
                p.put_u8(pat.clreattr);
            }
            out.replies.push(p);
        }
        unknown => {
            debug!("unknown message type 0x{:X}", unknown);
            let mut p = Packet::new(ANTOAN_UNKNOWN_COMMAND);
            p.put_u32(unknown);
            out.replies.push(p);
        }
    }
    Ok(())
}

fn bump(m: &mut Master, conn: &ClientConn, op: usize) {
    if let Some(ses) = m.sessions.find_mut(conn.sessionid) {
        ses.stats_bump(op);
    }
}

// true (and a reply pushed) when the session is read-only
fn readonly_guard(m: &Master, conn: &ClientConn, msgid: u32, rtype: u32, out: &mut DispatchOutput) -> bool {
    if m.sessions.find(conn.sessionid).map_or(false, |s| s.is_readonly()) {
        let status = readonly_status(m, conn);
        out.replies.push(status_reply(rtype, msgid, status));
        true
    } else {
        false
    }
}

// true (and a reply pushed) when the session is denied the operation
fn disables_guard(m: &Master, conn: &ClientConn, bits: u32, msgid: u32, rtype: u32, out: &mut DispatchOutput) -> bool {
    if m.sessions.find(conn.sessionid).map_or(false, |s| s.disables & bits != 0) {
        out.replies.push(status_reply(rtype, msgid, MfsStatus::EPerm));
        true
    } else {
        false
    }
}

#[allow(clippy::too_many_arguments)]
fn set_sclass(
    m: &mut Master,
    conn: &ClientConn,
    ts: u32,
    inode: u32,
    uid: u32,
    smode: u8,
    src_name: &[u8],
    dst_name: &[u8],
    out: &mut DispatchOutput,
    msgid: u32,
) -> Result<(), MfsStatus> {
    let dst = m.sclass.find_by_name(dst_name).ok_or(MfsStatus::NoSuchClass)?;
    let src = if src_name.is_empty() {
        0
    } else {
        m.sclass.find_by_name(src_name).ok_or(MfsStatus::NoSuchClass)?
    };
    let ses = session(m, conn)?;
    let sc = m.sclass.get(dst).unwrap();
    if sc.admin_only && ses.sesflags & SESFLAG_ADMIN == 0 {
        return Err(MfsStatus::EPermNotAdmin);
    }
    if !ses.check_sclass_group(sc.export_group) {
        return Err(MfsStatus::EPerm);
    }
    let (ci, nci, npi) =
        m.tree.setsclass(&mut m.chlog, ts, &mut m.sclass, &mut m.chunks, inode, uid, src, dst, smode)?;
    let mut p = Packet::new(MATOCL_FUSE_SETSCLASS);
    p.put_u32(msgid).put_u32(ci).put_u32(nci).put_u32(npi);
    out.replies.push(p);
    Ok(())
}

fn handle_register(
    m: &mut Master,
    conn: &mut ClientConn,
    ts: u32,
    c: &mut Cursor,
    out: &mut DispatchOutput,
) -> Result<()> {
    let blob = c.get_bytes(64)?;
    let tools = blob == &FUSE_REGISTER_BLOB_TOOLS_NOACL[..];
    if !tools && blob != &FUSE_REGISTER_BLOB_ACL[..] {
        let mut p = Packet::new(MATOCL_FUSE_REGISTER);
        p.put_u8(MfsStatus::Register.into());
        out.replies.push(p);
        out.close = true;
        return Ok(());
    }
    let rcode = c.get_u8()?;
    match rcode {
        REGISTER_GETRANDOM => {
            let mut nonce = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut nonce);
            conn.nonce = Some(nonce);
            let mut p = Packet::new(MATOCL_FUSE_REGISTER);
            p.put_bytes(&nonce);
            out.replies.push(p);
        }
        REGISTER_NEWSESSION | REGISTER_NEWMETASESSION => {
            let version = c.get_u32()?;
            let info = c.get_data()?.to_vec();
            let digest = if c.remaining() >= 16 { Some(c.get_bytes(16)?.to_vec()) } else { None };
            c.expect_end()?;
            if let Some(secret) = m.auth_secret.clone() {
                let ok = match (conn.nonce, digest) {
                    (Some(nonce), Some(d)) => registration_digest(&nonce, &secret)[..] == d[..],
                    (None, Some(_)) => false,
                    _ => {
                        let mut p = Packet::new(MATOCL_FUSE_REGISTER);
                        p.put_u8(MfsStatus::NoPassword.into());
                        out.replies.push(p);
                        return Ok(());
                    }
                };
                if !ok {
                    let mut p = Packet::new(MATOCL_FUSE_REGISTER);
                    p.put_u8(MfsStatus::BadPassword.into());
                    out.replies.push(p);
                    return Ok(());
                }
            }
            let mut params = NewSessionParams {
                peerip: conn.peerip,
                info,
                ..Default::default()
            };
            if rcode == REGISTER_NEWMETASESSION {
                params.sesflags |= SESFLAG_METARESTORE;
            }
            let sessionid = m.sessions.new_session(&mut m.chlog, ts, params);
            conn.registered = REGSTATE_MOUNT;
            conn.sessionid = sessionid;
            conn.version = version;
            let ses = m.sessions.find(sessionid).unwrap();
            let mut p = Packet::new(MATOCL_FUSE_REGISTER);
            p.put_u32(version)
                .put_u32(sessionid)
                .put_u64(m.metaid)
                .put_u8(ses.sesflags)
                .put_u16(ses.umaskval)
                .put_u32(ses.rootuid)
                .put_u32(ses.rootgid)
                .put_u32(ses.mapalluid)
                .put_u32(ses.mapallgid)
                .put_u16(ses.sclassgroups)
                .put_u32(ses.mintrashretention)
                .put_u32(ses.maxtrashretention)
                .put_u32(ses.disables);
            out.replies.push(p);
        }
        REGISTER_RECONNECT => {
            let sessionid = c.get_u32()?;
            let version = c.get_u32()?;
            let metaid = if c.remaining() >= 8 { c.get_u64()? } else { 0 };
            c.expect_end()?;
            if metaid != 0 && metaid != m.metaid {
                let mut p = Packet::new(MATOCL_FUSE_REGISTER);
                p.put_u8(MfsStatus::BadSessionId.into());
                out.replies.push(p);
                out.close = true;
                return Ok(());
            }
            let status = match m.sessions.find(sessionid) {
                Some(ses) => {
                    let params = NewSessionParams {
                        exportscsum: ses.exportscsum,
                        rootinode: ses.rootinode,
                        sesflags: ses.sesflags,
                        umaskval: ses.umaskval,
                        rootuid: ses.rootuid,
                        rootgid: ses.rootgid,
                        mapalluid: ses.mapalluid,
                        mapallgid: ses.mapallgid,
                        sclassgroups: ses.sclassgroups,
                        mintrashretention: ses.mintrashretention,
                        maxtrashretention: ses.maxtrashretention,
                        disables: ses.disables,
                        peerip: conn.peerip,
                        info: ses.info.clone(),
                    };
                    match m.sessions.reconnect_session(&mut m.chlog, ts, sessionid, params) {
                        Ok(_) => {
                            conn.registered = REGSTATE_MOUNT;
                            conn.sessionid = sessionid;
                            conn.version = version;
                            MfsStatus::Ok
                        }
                        Err(s) => s,
                    }
                }
                None => MfsStatus::BadSessionId,
            };
            let mut p = Packet::new(MATOCL_FUSE_REGISTER);
            p.put_u8(status.into());
            out.replies.push(p);
            if status != MfsStatus::Ok {
                out.close = true;
            }
        }
        REGISTER_TOOLS => {
            let sessionid = c.get_u32()?;
            let _version = c.get_u32()?;
            c.expect_end()?;
            if !tools {
                bail!("tools registration with a mount blob");
            }
            conn.registered = REGSTATE_TOOL;
            conn.sessionid = sessionid;
            let mut p = Packet::new(MATOCL_FUSE_REGISTER);
            p.put_u8(MfsStatus::Ok.into());
            out.replies.push(p);
        }
        REGISTER_CLOSESESSION => {
            let sessionid = c.get_u32()?;
            c.expect_end()?;
            for sid in m.sessions.close_session(&mut m.chlog, ts, sessionid) {
                m.session_cleanup(ts, sid);
            }
            let mut p = Packet::new(MATOCL_FUSE_REGISTER);
            p.put_u8(MfsStatus::Ok.into());
            out.replies.push(p);
            out.close = true;
        }
        _ => bail!("unknown register code {}", rcode),
    }
    Ok(())
}

fn read_gids(c: &mut Cursor) -> Result<Vec<u32>> {
    let gcnt = c.get_u32()?;
    if gcnt > 256 {
        bail!("too many groups: {}", gcnt);
    }
    let mut gids = Vec::with_capacity(gcnt as usize);
    for _ in 0..gcnt {
        gids.push(c.get_u32()?);
    }
    Ok(gids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rmfs_lib::MasterOptions;

    fn master() -> Master {
        Master::new(1000, 0x1122, &MasterOptions::default()).unwrap()
    }

    fn registered_conn(m: &mut Master) -> ClientConn {
        let mut conn = ClientConn::new(0x7F000001);
        let mut p = Packet::new(CLTOMA_FUSE_REGISTER);
        p.put_bytes(FUSE_REGISTER_BLOB_ACL);
        p.put_u8(REGISTER_NEWSESSION);
        p.put_u32(0x00030000);
        p.put_data(b"/mnt/test");
        let out = dispatch(m, &mut conn, 1000, &p);
        assert!(!out.close);
        assert_eq!(conn.registered, REGSTATE_MOUNT);
        conn
    }

    fn mkdir(m: &mut Master, conn: &mut ClientConn, parent: u32, name: &[u8]) -> u32 {
        let mut p = Packet::new(CLTOMA_FUSE_MKDIR);
        p.put_u32(1).put_u32(parent).put_name(name);
        p.put_u16(0o755).put_u16(0o022).put_u32(0).put_u32(1).put_u32(0);
        let out = dispatch(m, conn, 1000, &p);
        let r = &out.replies[0];
        assert_eq!(r.ptype, MATOCL_FUSE_MKDIR);
        assert!(r.data.len() > 5, "mkdir failed: {:?}", r.data);
        u32::from_be_bytes(r.data[4..8].try_into().unwrap())
    }

    fn mkfile(m: &mut Master, conn: &mut ClientConn, parent: u32, name: &[u8]) -> u32 {
        let mut p = Packet::new(CLTOMA_FUSE_MKNOD);
        p.put_u32(1).put_u32(parent).put_name(name);
        p.put_u8(NodeType::File.into());
        p.put_u16(0o644).put_u16(0o022).put_u32(0).put_u32(1).put_u32(0).put_u32(0);
        let out = dispatch(m, conn, 1000, &p);
        let r = &out.replies[0];
        assert!(r.data.len() > 5, "mknod failed: {:?}", r.data);
        u32::from_be_bytes(r.data[4..8].try_into().unwrap())
    }

    #[test]
    fn registration_handshake() {
        let mut m = master();
        let conn = registered_conn(&mut m);
        assert!(m.sessions.find(conn.sessionid).is_some());
        // the journal carries the SESADD line
        assert!(m.chlog.recorded().iter().any(|l| l.contains("SESADD")));
    }

    #[test]
    fn bad_blob_is_refused() {
        let mut m = master();
        let mut conn = ClientConn::new(1);
        let mut p = Packet::new(CLTOMA_FUSE_REGISTER);
        p.put_bytes(&[b'X'; 64]);
        p.put_u8(REGISTER_NEWSESSION);
        let out = dispatch(&mut m, &mut conn, 1000, &p);
        assert!(out.close);
        assert_eq!(out.replies[0].data, vec![u8::from(MfsStatus::Register)]);
    }

    #[test]
    fn password_handshake() {
        let mut m = master();
        m.auth_secret = Some(b"s3cret".to_vec());
        let mut conn = ClientConn::new(1);
        // without GETRANDOM first, registration demands a password
        let mut p = Packet::new(CLTOMA_FUSE_REGISTER);
        p.put_bytes(FUSE_REGISTER_BLOB_ACL);
        p.put_u8(REGISTER_NEWSESSION);
        p.put_u32(0x00030000);
        p.put_data(b"/mnt");
        let out = dispatch(&mut m, &mut conn, 1000, &p);
        assert_eq!(out.replies[0].data, vec![u8::from(MfsStatus::NoPassword)]);
        // nonce round then a correct digest
        let mut p = Packet::new(CLTOMA_FUSE_REGISTER);
        p.put_bytes(FUSE_REGISTER_BLOB_ACL);
        p.put_u8(REGISTER_GETRANDOM);
        let out = dispatch(&mut m, &mut conn, 1000, &p);
        let nonce: [u8; 32] = out.replies[0].data.clone().try_into().unwrap();
        let digest = registration_digest(&nonce, b"s3cret");
        let mut p = Packet::new(CLTOMA_FUSE_REGISTER);
        p.put_bytes(FUSE_REGISTER_BLOB_ACL);
        p.put_u8(REGISTER_NEWSESSION);
        p.put_u32(0x00030000);
        p.put_data(b"/mnt");
        p.put_bytes(&digest);
        let out = dispatch(&mut m, &mut conn, 1000, &p);
        assert!(out.replies[0].data.len() > 1, "registration failed");
        assert_eq!(conn.registered, REGSTATE_MOUNT);
        // wrong digest is refused
        let mut conn2 = ClientConn::new(1);
        conn2.nonce = Some(nonce);
        let mut p = Packet::new(CLTOMA_FUSE_REGISTER);
        p.put_bytes(FUSE_REGISTER_BLOB_ACL);
        p.put_u8(REGISTER_NEWSESSION);
        p.put_u32(0x00030000);
        p.put_data(b"/mnt");
        p.put_bytes(&[0u8; 16]);
        let out = dispatch(&mut m, &mut conn2, 1000, &p);
        assert_eq!(out.replies[0].data, vec![u8::from(MfsStatus::BadPassword)]);
    }

    #[test]
    fn message_before_registration_closes() {
        let mut m = master();
        let mut conn = ClientConn::new(1);
        let mut p = Packet::new(CLTOMA_FUSE_STATFS);
        p.put_u32(1);
        let out = dispatch(&mut m, &mut conn, 1000, &p);
        assert!(out.close);
    }

    #[test]
    fn unknown_type_gets_unknown_command() {
        let mut m = master();
        let mut conn = registered_conn(&mut m);
        let p = Packet::new(PROTO_BASE + 999);
        let out = dispatch(&mut m, &mut conn, 1000, &p);
        assert!(!out.close);
        assert_eq!(out.replies[0].ptype, ANTOAN_UNKNOWN_COMMAND);
    }

    #[test]
    fn short_packet_closes_connection() {
        let mut m = master();
        let mut conn = registered_conn(&mut m);
        let mut p = Packet::new(CLTOMA_FUSE_LOOKUP);
        p.put_u32(1).put_u32(ROOT_INODE); // name missing
        let out = dispatch(&mut m, &mut conn, 1000, &p);
        assert!(out.close);
    }

    #[test]
    fn lookup_and_attr_shapes() {
        let mut m = master();
        let mut conn = registered_conn(&mut m);
        let d = mkdir(&mut m, &mut conn, ROOT_INODE, b"home");
        let mut p = Packet::new(CLTOMA_FUSE_LOOKUP);
        p.put_u32(9).put_u32(ROOT_INODE).put_name(b"home").put_u32(0).put_u32(1).put_u32(0);
        let out = dispatch(&mut m, &mut conn, 1000, &p);
        let r = &out.replies[0];
        assert_eq!(r.ptype, MATOCL_FUSE_LOOKUP);
        // msgid + inode + 36-byte attr for a new-protocol session
        assert_eq!(r.data.len(), 4 + 4 + 36);
        assert_eq!(u32::from_be_bytes(r.data[4..8].try_into().unwrap()), d);
        // a missing name answers with a status byte only
        let mut p = Packet::new(CLTOMA_FUSE_LOOKUP);
        p.put_u32(10).put_u32(ROOT_INODE).put_name(b"nope").put_u32(0).put_u32(1).put_u32(0);
        let out = dispatch(&mut m, &mut conn, 1000, &p);
        assert_eq!(out.replies[0].data.len(), 5);
        assert_eq!(out.replies[0].data[4], u8::from(MfsStatus::ENoEnt));
    }

    #[test]
    fn write_read_locked_chunk_scenario() {
        // client A opens for write; B's READ_CHUNK parks; A's write end
        // wakes B with the current version
        let mut m = master();
        let mut conn_a = registered_conn(&mut m);
        let mut conn_b = registered_conn(&mut m);
        let f = mkfile(&mut m, &mut conn_a, ROOT_INODE, b"data");
        for conn in [&mut conn_a, &mut conn_b] {
            let mut p = Packet::new(CLTOMA_FUSE_OPEN);
            p.put_u32(2).put_u32(f).put_u32(0).put_u32(1).put_u32(0).put_u8(0x03);
            let out = dispatch(&mut m, conn, 1000, &p);
            assert_eq!(out.replies[0].data.len(), 4 + 4 + 36);
        }
        let mut p = Packet::new(CLTOMA_FUSE_WRITE_CHUNK);
        p.put_u32(3).put_u32(f).put_u32(0);
        let out = dispatch(&mut m, &mut conn_a, 1000, &p);
        let r = &out.replies[0];
        assert_eq!(r.ptype, MATOCL_FUSE_WRITE_CHUNK);
        let chunkid = u64::from_be_bytes(r.data[12..20].try_into().unwrap());
        // B reads the same chunk: no reply, parked
        let mut p = Packet::new(CLTOMA_FUSE_READ_CHUNK);
        p.put_u32(4).put_u32(f).put_u32(0);
        let out = dispatch(&mut m, &mut conn_b, 1000, &p);
        assert!(out.replies.is_empty());
        assert!(m.chunks.has_waiters(chunkid));
        // A finishes the write: B gets a deferred reply with the version
        let mut p = Packet::new(CLTOMA_FUSE_WRITE_CHUNK_END);
        p.put_u32(5).put_u64(chunkid).put_u32(f).put_u64(10);
        let out = dispatch(&mut m, &mut conn_a, 1001, &p);
        assert_eq!(out.replies[0].data[4], u8::from(MfsStatus::Ok));
        assert_eq!(out.deferred.len(), 1);
        let (sid, reply) = &out.deferred[0];
        assert_eq!(*sid, conn_b.sessionid);
        assert_eq!(reply.ptype, MATOCL_FUSE_READ_CHUNK);
        // length 10, the chunk id and version 1
        assert_eq!(u64::from_be_bytes(reply.data[4..12].try_into().unwrap()), 10);
        assert_eq!(u64::from_be_bytes(reply.data[12..20].try_into().unwrap()), chunkid);
        assert_eq!(u32::from_be_bytes(reply.data[20..24].try_into().unwrap()), 1);
    }

    #[test]
    fn waiter_timeout_answers_with_original_status() {
        let mut m = master();
        let mut conn = registered_conn(&mut m);
        let f = mkfile(&mut m, &mut conn, ROOT_INODE, b"w");
        let mut p = Packet::new(CLTOMA_FUSE_OPEN);
        p.put_u32(2).put_u32(f).put_u32(0).put_u32(1).put_u32(0).put_u8(0x03);
        dispatch(&mut m, &mut conn, 1000, &p);
        let mut p = Packet::new(CLTOMA_FUSE_WRITE_CHUNK);
        p.put_u32(3).put_u32(f).put_u32(0);
        dispatch(&mut m, &mut conn, 1000, &p);
        let mut p = Packet::new(CLTOMA_FUSE_READ_CHUNK);
        p.put_u32(4).put_u32(f).put_u32(0);
        let out = dispatch(&mut m, &mut conn, 1000, &p);
        assert!(out.replies.is_empty());
        // 30 seconds later the tick expires the waiter
        let expired = m.tick(1031);
        assert_eq!(expired.len(), 1);
        let (sid, reply) = answer_chunk_waiter(&mut m, 1031, &expired[0], true);
        assert_eq!(sid, conn.sessionid);
        assert_eq!(reply.data[4], u8::from(MfsStatus::Locked));
    }

    #[test]
    fn setsclass_group_gate() {
        // storage class in an export group outside the session mask:
        // EPERM, nothing journaled, meta version unchanged
        let mut m = master();
        let mut conn = registered_conn(&mut m);
        let f = mkfile(&mut m, &mut conn, ROOT_INODE, b"f");
        let mut sc = StorageClass::simple_goal(2, b"far");
        sc.export_group = 5;
        m.sclass.create(&mut m.chlog, 1000, sc).unwrap();
        m.sessions.find_mut(conn.sessionid).unwrap().sclassgroups = 0x0001;
        let version_before = m.chlog.version();
        let mut p = Packet::new(CLTOMA_FUSE_SETSCLASS);
        p.put_u32(9).put_u32(f).put_u32(0).put_u8(SMODE_SET);
        p.put_name(b"").put_name(b"far");
        let out = dispatch(&mut m, &mut conn, 1001, &p);
        assert_eq!(out.replies[0].data[4], u8::from(MfsStatus::EPerm));
        assert_eq!(m.chlog.version(), version_before);
        assert_eq!(m.tree.node(f).unwrap().sclassid, 1);
    }

    #[test]
    fn readonly_session_error_depends_on_abi() {
        let mut m = master();
        let mut conn = registered_conn(&mut m);
        mkfile(&mut m, &mut conn, ROOT_INODE, b"f");
        {
            let ses = m.sessions.find_mut(conn.sessionid).unwrap();
            ses.sesflags |= SESFLAG_READONLY;
        }
        let mut p = Packet::new(CLTOMA_FUSE_UNLINK);
        p.put_u32(9).put_u32(ROOT_INODE).put_name(b"f").put_u32(0).put_u32(1).put_u32(0);
        let out = dispatch(&mut m, &mut conn, 1001, &p);
        assert_eq!(out.replies[0].data[4], u8::from(MfsStatus::ERofs));
        // a legacy session (no attr bit) gets the old error
        {
            let ses = m.sessions.find_mut(conn.sessionid).unwrap();
            ses.sesflags &= !SESFLAG_ATTRBIT;
        }
        let out = dispatch(&mut m, &mut conn, 1001, &p);
        assert_eq!(out.replies[0].data[4], u8::from(MfsStatus::EAcces));
    }

    #[test]
    fn flock_over_the_wire() {
        let mut m = master();
        let mut conn_a = registered_conn(&mut m);
        let mut conn_b = registered_conn(&mut m);
        let f = mkfile(&mut m, &mut conn_a, ROOT_INODE, b"l");
        for conn in [&mut conn_a, &mut conn_b] {
            let mut p = Packet::new(CLTOMA_FUSE_OPEN);
            p.put_u32(1).put_u32(f).put_u32(0).put_u32(1).put_u32(0).put_u8(0x01);
            dispatch(&mut m, conn, 1000, &p);
        }
        let mut p = Packet::new(CLTOMA_FUSE_FLOCK);
        p.put_u32(2).put_u32(f).put_u32(11).put_u64(0xA).put_u8(FLOCK_LOCK_EXCLUSIVE);
        let out = dispatch(&mut m, &mut conn_a, 1000, &p);
        assert_eq!(out.replies[0].data[4], u8::from(MfsStatus::Ok));
        // B waits: no reply yet
        let mut p = Packet::new(CLTOMA_FUSE_FLOCK);
        p.put_u32(3).put_u32(f).put_u32(12).put_u64(0xB).put_u8(FLOCK_LOCK_EXCLUSIVE);
        let out = dispatch(&mut m, &mut conn_b, 1000, &p);
        assert!(out.replies.is_empty());
        // A unlocks: B's grant arrives as a deferred packet
        let mut p = Packet::new(CLTOMA_FUSE_FLOCK);
        p.put_u32(4).put_u32(f).put_u32(13).put_u64(0xA).put_u8(FLOCK_UNLOCK);
        let out = dispatch(&mut m, &mut conn_a, 1000, &p);
        assert_eq!(out.replies[0].data[4], u8::from(MfsStatus::Ok));
        assert_eq!(out.deferred.len(), 1);
        assert_eq!(out.deferred[0].0, conn_b.sessionid);
        assert_eq!(out.deferred[0].1.data[4], u8::from(MfsStatus::Ok));
    }

    #[test]
    fn posix_lock_get_reports_blocker() {
        let mut m = master();
        let mut conn = registered_conn(&mut m);
        let f = mkfile(&mut m, &mut conn, ROOT_INODE, b"p");
        let mut p = Packet::new(CLTOMA_FUSE_OPEN);
        p.put_u32(1).put_u32(f).put_u32(0).put_u32(1).put_u32(0).put_u8(0x03);
        dispatch(&mut m, &mut conn, 1000, &p);
        let mut p = Packet::new(CLTOMA_FUSE_POSIX_LOCK);
        p.put_u32(2).put_u32(f).put_u32(21).put_u64(0xAA).put_u32(500);
        p.put_u8(POSIX_LOCK_CMD_SET).put_u8(POSIX_LOCK_WRLCK).put_u64(0).put_u64(100);
        let out = dispatch(&mut m, &mut conn, 1000, &p);
        assert_eq!(out.replies[0].data[4], u8::from(MfsStatus::Ok));
        // GET from another owner in the same session sees the blocker pid
        let mut p = Packet::new(CLTOMA_FUSE_POSIX_LOCK);
        p.put_u32(3).put_u32(f).put_u32(22).put_u64(0xBB).put_u32(600);
        p.put_u8(POSIX_LOCK_CMD_GET).put_u8(POSIX_LOCK_WRLCK).put_u64(50).put_u64(60);
        let out = dispatch(&mut m, &mut conn, 1000, &p);
        let r = &out.replies[0];
        assert_eq!(r.ptype, MATOCL_FUSE_POSIX_LOCK);
        assert_eq!(u32::from_be_bytes(r.data[4..8].try_into().unwrap()), 500);
        assert_eq!(r.data[8], POSIX_LOCK_WRLCK);
    }

    #[test]
    fn sustained_inodes_report_syncs_open_files() {
        let mut m = master();
        let mut conn = registered_conn(&mut m);
        let f1 = mkfile(&mut m, &mut conn, ROOT_INODE, b"f1");
        let f2 = mkfile(&mut m, &mut conn, ROOT_INODE, b"f2");
        for f in [f1, f2] {
            let mut p = Packet::new(CLTOMA_FUSE_OPEN);
            p.put_u32(1).put_u32(f).put_u32(0).put_u32(1).put_u32(0).put_u8(0x01);
            dispatch(&mut m, &mut conn, 1000, &p);
        }
        // a lock on f2 dies with the release below
        let mut p = Packet::new(CLTOMA_FUSE_FLOCK);
        p.put_u32(2).put_u32(f2).put_u32(9).put_u64(0x9).put_u8(FLOCK_LOCK_SHARED);
        dispatch(&mut m, &mut conn, 1000, &p);
        // the client reports holding only f1
        let mut p = Packet::new(CLTOMA_FUSE_SUSTAINED_INODES);
        p.put_u32(f1);
        let out = dispatch(&mut m, &mut conn, 1001, &p);
        assert!(out.replies.is_empty());
        assert!(m.openfiles.checknode(conn.sessionid, f1));
        assert!(!m.openfiles.checknode(conn.sessionid, f2));
        assert!(m.flocks.list(f2).is_empty());
        assert!(m.chlog.recorded().iter().any(|l| l.contains(&format!("RELEASE({},", f2))));
    }

    #[test]
    fn sclass_admin_roundtrip() {
        let mut m = master();
        let mut conn = registered_conn(&mut m);
        let mut p = Packet::new(CLTOMA_SCLASS_CREATE);
        p.put_u32(1).put_name(b"fast");
        p.put_u8(0).put_u8(0).put_u8(SCLASS_ARCH_MODE_CTIME);
        p.put_u16(0).put_u64(0).put_u16(24);
        for expr in [&b"2A"[..], b"A,B", b"-", b"-"] {
            p.put_data(expr);
        }
        let out = dispatch(&mut m, &mut conn, 1000, &p);
        let r = &out.replies[0];
        assert_eq!(r.ptype, MATOCL_SCLASS_CREATE);
        assert_eq!(r.data.len(), 5);
        let id = r.data[4];
        assert_eq!(m.sclass.find_by_name(b"fast"), Some(id));
        // list carries it back
        let mut p = Packet::new(CLTOMA_SCLASS_LIST);
        p.put_u32(2).put_u8(0);
        let out = dispatch(&mut m, &mut conn, 1000, &p);
        assert!(out.replies[0].data.len() > 4);
    }
}
