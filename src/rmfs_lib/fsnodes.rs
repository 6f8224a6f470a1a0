//! The metadata graph: inodes, directory edges, trash and sustained
//! buckets, quotas, xattr and ACL side tables.
//!
//! All mutation happens on the single master thread; every mutating
//! operation appends exactly one changelog line before its reply and is
//! reproducible from that line by the matching `mr_` entry point.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;

use anyhow::{bail, Result};
use log::debug;

use crate::rmfs_lib::changelog::{escape_name, Changelog};
use crate::rmfs_lib::chunks::ChunkIndex;
use crate::rmfs_lib::codec::Cursor;
use crate::rmfs_lib::patterns::PatternTable;
use crate::rmfs_lib::sclass::SclassRegistry;
use crate::rmfs_lib::types::*;

pub const MFS_CHUNK_BYTES: u64 = 0x0400_0000;
pub const MFS_BLOCK_BYTES: u64 = 0x10000;
/// Highest addressable chunk index inside one file.
pub const MAX_CHUNK_INDEX: u32 = 0x7FFF_FFFF;
/// Deleted inode ids are quarantined this long before reuse.
pub const INODE_REUSE_DELAY: u32 = 86400;
/// Soft-quota grace window, seconds.
pub const QUOTA_DEFAULT_GRACE: u32 = 7 * 86400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeData {
    File { length: u64, chunks: Vec<u64> },
    Dir { children: BTreeMap<Vec<u8>, DirEntry> },
    Symlink { target: Vec<u8> },
    Dev { rdev: u32 },
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u32,
    pub edgeid: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsNode {
    pub id: u32,
    pub ntype: NodeType,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub trashretention: u16,
    pub sclassid: u8,
    pub eattr: u8,
    pub winattr: u8,
    pub parents: Vec<u32>,
    pub data: NodeData,
}

impl FsNode {
    pub fn is_dir(&self) -> bool {
        self.ntype == NodeType::Directory
    }

    pub fn length(&self) -> u64 {
        match &self.data {
            NodeData::File { length, .. } => *length,
            NodeData::Symlink { target } => target.len() as u64,
            _ => 0,
        }
    }

    // occupied size: length rounded up to whole 64 KiB blocks
    pub fn size(&self) -> u64 {
        match &self.data {
            NodeData::File { length, .. } => {
                (*length + MFS_BLOCK_BYTES - 1) & !(MFS_BLOCK_BYTES - 1)
            }
            _ => 0,
        }
    }

    /// Wire attribute record. 35 bytes for legacy clients, 36 (with the
    /// trailing winattr byte) when the session negotiated it.
    pub fn fill_attr(&self, nlink: u32, attr36: bool) -> Vec<u8> {
        let unix_type: u16 = match self.ntype {
            NodeType::File | NodeType::Trash | NodeType::Sustained => 0x8,
            NodeType::Directory => 0x4,
            NodeType::Symlink => 0xA,
            NodeType::Fifo => 0x1,
            NodeType::BlockDev => 0x6,
            NodeType::CharDev => 0x2,
            NodeType::Socket => 0xC,
        };
        let mut attr = Vec::with_capacity(36);
        attr.push(self.eattr);
        attr.extend_from_slice(&((unix_type << 12) | (self.mode & 0xFFF)).to_be_bytes());
        attr.extend_from_slice(&self.uid.to_be_bytes());
        attr.extend_from_slice(&self.gid.to_be_bytes());
        attr.extend_from_slice(&self.atime.to_be_bytes());
        attr.extend_from_slice(&self.mtime.to_be_bytes());
        attr.extend_from_slice(&self.ctime.to_be_bytes());
        attr.extend_from_slice(&nlink.to_be_bytes());
        match &self.data {
            NodeData::Dev { rdev } => {
                attr.extend_from_slice(&(((rdev >> 16) & 0xFFFF) as u16).to_be_bytes());
                attr.extend_from_slice(&((rdev & 0xFFFF) as u16).to_be_bytes());
                attr.extend_from_slice(&[0u8; 4]);
            }
            _ => attr.extend_from_slice(&self.length().to_be_bytes()),
        }
        if attr36 {
            attr.push(self.winattr);
        }
        attr
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuotaEntry {
    pub flags: u8,
    pub exceeded: bool,
    pub stimestamp: u32,
    pub sinodes: u32,
    pub hinodes: u32,
    pub slength: u64,
    pub hlength: u64,
    pub ssize: u64,
    pub hsize: u64,
    pub srealsize: u64,
    pub hrealsize: u64,
    pub timelimit: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubtreeStats {
    pub inodes: u32,
    pub length: u64,
    pub size: u64,
    pub realsize: u64,
}

pub struct FsTree {
    nodes: HashMap<u32, FsNode>,
    trash: HashMap<u32, Vec<u8>>,     // inode -> original path
    sustained: HashMap<u32, Vec<u8>>, // inode -> original path
    quotas: HashMap<u32, QuotaEntry>,
    xattrs: HashMap<u32, BTreeMap<Vec<u8>, Vec<u8>>>,
    acls: HashMap<(u32, u8), Vec<u8>>,
    freeinodes: Vec<u32>,
    pending_free: Vec<(u32, u32)>, // (inode id, freed-at ts)
    nextinodeid: u32,
    nextedgeid: u64,
}

fn valid_name(name: &[u8]) -> Result<(), MfsStatus> {
    if name.is_empty() || name.contains(&0) || name.contains(&b'/') {
        return Err(MfsStatus::EInval);
    }
    if name.len() > MAX_NAME_LENG {
        return Err(MfsStatus::ENameTooLong);
    }
    if name == b"." || name == b".." {
        return Err(MfsStatus::EInval);
    }
    Ok(())
}

impl FsTree {
    pub fn new(ts: u32) -> FsTree {
        let mut tree = FsTree {
            nodes: HashMap::new(),
            trash: HashMap::new(),
            sustained: HashMap::new(),
            quotas: HashMap::new(),
            xattrs: HashMap::new(),
            acls: HashMap::new(),
            freeinodes: Vec::new(),
            pending_free: Vec::new(),
            nextinodeid: ROOT_INODE + 1,
            nextedgeid: 1,
        };
        tree.nodes.insert(
            ROOT_INODE,
            FsNode {
                id: ROOT_INODE,
                ntype: NodeType::Directory,
                mode: 0o777,
                uid: 0,
                gid: 0,
                atime: ts,
                mtime: ts,
                ctime: ts,
                trashretention: 0,
                sclassid: 1,
                eattr: 0,
                winattr: 0,
                parents: Vec::new(),
                data: NodeData::Dir { children: BTreeMap::new() },
            },
        );
        tree
    }

    pub fn node(&self, inode: u32) -> Option<&FsNode> {
        self.nodes.get(&inode)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn trash_nodes(&self) -> impl Iterator<Item = (&u32, &Vec<u8>)> {
        self.trash.iter()
    }

    pub fn sustained_nodes(&self) -> impl Iterator<Item = (&u32, &Vec<u8>)> {
        self.sustained.iter()
    }

    /// Link count as reported in attributes: edges pointing at the node.
    pub fn nlink(&self, inode: u32) -> u32 {
        match self.nodes.get(&inode) {
            Some(n) if n.is_dir() => {
                let sub = match &n.data {
                    NodeData::Dir { children } => children
                        .values()
                        .filter(|e| self.nodes.get(&e.inode).map_or(false, |c| c.is_dir()))
                        .count() as u32,
                    _ => 0,
                };
                2 + sub
            }
            Some(n) => n.parents.len() as u32,
            None => 0,
        }
    }

    fn alloc_inode(&mut self) -> u32 {
        if let Some(id) = self.freeinodes.pop() {
            id
        } else {
            let id = self.nextinodeid;
            self.nextinodeid += 1;
            id
        }
    }

    fn alloc_edgeid(&mut self) -> u64 {
        let id = self.nextedgeid;
        self.nextedgeid += 1;
        id
    }

    fn dir_children(&self, inode: u32) -> Result<&BTreeMap<Vec<u8>, DirEntry>, MfsStatus> {
        match self.nodes.get(&inode) {
            None => Err(MfsStatus::ENoEnt),
            Some(n) => match &n.data {
                NodeData::Dir { children } => Ok(children),
                _ => Err(MfsStatus::ENotDir),
            },
        }
    }

    pub fn lookup(&self, parent: u32, name: &[u8]) -> Result<u32, MfsStatus> {
        let children = self.dir_children(parent)?;
        children.get(name).map(|e| e.inode).ok_or(MfsStatus::ENoEnt)
    }

    fn attach(&mut self, parent: u32, name: &[u8], inode: u32) -> u64 {
        let edgeid = self.alloc_edgeid();
        if let Some(NodeData::Dir { children }) = self.nodes.get_mut(&parent).map(|n| &mut n.data) {
            children.insert(name.to_vec(), DirEntry { inode, edgeid });
        }
        if let Some(n) = self.nodes.get_mut(&inode) {
            n.parents.push(parent);
        }
        edgeid
    }

    fn detach(&mut self, parent: u32, name: &[u8]) -> Option<u32> {
        let inode = match self.nodes.get_mut(&parent).map(|n| &mut n.data) {
            Some(NodeData::Dir { children }) => children.remove(name).map(|e| e.inode),
            _ => None,
        }?;
        if let Some(n) = self.nodes.get_mut(&inode) {
            if let Some(pos) = n.parents.iter().position(|&p| p == parent) {
                n.parents.remove(pos);
            }
        }
        Some(inode)
    }

    /// Full path of an inode through its first parent chain.
    pub fn path_of(&self, inode: u32) -> Vec<u8> {
        let mut parts: Vec<Vec<u8>> = Vec::new();
        let mut cur = inode;
        while cur != ROOT_INODE {
            let n = match self.nodes.get(&cur) {
                Some(n) => n,
                None => break,
            };
            let parent = match n.parents.first() {
                Some(&p) => p,
                None => break,
            };
            if let Ok(children) = self.dir_children(parent) {
                if let Some((name, _)) = children.iter().find(|(_, e)| e.inode == cur) {
                    parts.push(name.clone());
                }
            }
            cur = parent;
        }
        let mut path = Vec::new();
        for p in parts.iter().rev() {
            path.push(b'/');
            path.extend_from_slice(p);
        }
        if path.is_empty() {
            path.push(b'/');
        }
        path
    }

    /* quota */

    pub fn subtree_stats(&self, inode: u32) -> SubtreeStats {
        let mut st = SubtreeStats::default();
        let mut stack = vec![inode];
        while let Some(id) = stack.pop() {
            let n = match self.nodes.get(&id) {
                Some(n) => n,
                None => continue,
            };
            st.inodes += 1;
            st.length += n.length();
            st.size += n.size();
            st.realsize += n.size();
            if let NodeData::Dir { children } = &n.data {
                stack.extend(children.values().map(|e| e.inode));
            }
        }
        st
    }

    /// Would adding (`extra_inodes`, `extra_length`) under `inode` burst a
    /// hard quota (or an expired soft quota) on its ancestor chain?
    pub fn quota_exceeded(&self, inode: u32, ts: u32, extra_inodes: u32, extra_length: u64) -> bool {
        let mut cur = Some(inode);
        while let Some(id) = cur {
            if let Some(q) = self.quotas.get(&id) {
                let st = self.subtree_stats(id);
                if q.flags & QUOTA_FLAG_HINODES != 0 && st.inodes + extra_inodes > q.hinodes {
                    return true;
                }
                if q.flags & QUOTA_FLAG_HLENGTH != 0 && st.length + extra_length > q.hlength {
                    return true;
                }
                if q.flags & QUOTA_FLAG_HSIZE != 0 && st.size + extra_length > q.hsize {
                    return true;
                }
                if q.exceeded && q.stimestamp != 0 {
                    let grace = if q.timelimit != 0 { q.timelimit } else { QUOTA_DEFAULT_GRACE };
                    if ts > q.stimestamp + grace {
                        return true;
                    }
                }
            }
            cur = self.nodes.get(&id).and_then(|n| n.parents.first().copied());
        }
        false
    }

    /// Refresh soft-quota exceeded flags; called periodically.
    pub fn quota_refresh(&mut self, ts: u32) {
        let ids: Vec<u32> = self.quotas.keys().copied().collect();
        for id in ids {
            let st = self.subtree_stats(id);
            let q = self.quotas.get_mut(&id).unwrap();
            let soft_burst = (q.flags & QUOTA_FLAG_SINODES != 0 && st.inodes > q.sinodes)
                || (q.flags & QUOTA_FLAG_SLENGTH != 0 && st.length > q.slength)
                || (q.flags & QUOTA_FLAG_SSIZE != 0 && st.size > q.ssize)
                || (q.flags & QUOTA_FLAG_SREALSIZE != 0 && st.realsize > q.srealsize);
            if soft_burst && !q.exceeded {
                q.exceeded = true;
                q.stimestamp = ts;
            } else if !soft_burst && q.exceeded {
                q.exceeded = false;
                q.stimestamp = 0;
            }
        }
    }

    pub fn quota_get(&self, inode: u32) -> Option<&QuotaEntry> {
        self.quotas.get(&inode)
    }

    pub fn quota_set(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        inode: u32,
        q: QuotaEntry,
    ) -> Result<(), MfsStatus> {
        let n = self.nodes.get(&inode).ok_or(MfsStatus::ENoEnt)?;
        if !n.is_dir() {
            return Err(MfsStatus::EPerm);
        }
        chlog.append(&format!(
            "{}|QUOTA({},{},{},{},{},{},{},{},{},{},{},{},{})",
            ts,
            inode,
            q.exceeded as u8,
            q.flags,
            q.stimestamp,
            q.sinodes,
            q.hinodes,
            q.slength,
            q.hlength,
            q.ssize,
            q.hsize,
            q.srealsize,
            q.hrealsize,
            q.timelimit
        ));
        if q.flags == 0 {
            self.quotas.remove(&inode);
        } else {
            self.quotas.insert(inode, q);
        }
        Ok(())
    }

    /* create / link / unlink / rename */

    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        sclass: &mut SclassRegistry,
        patterns: &PatternTable,
        parent: u32,
        name: &[u8],
        ntype: NodeType,
        mode: u16,
        cumask: u16,
        uid: u32,
        gids: &[u32],
        rdev: u32,
    ) -> Result<u32, MfsStatus> {
        valid_name(name)?;
        let children = self.dir_children(parent)?;
        if children.contains_key(name) {
            return Err(MfsStatus::EExist);
        }
        if matches!(ntype, NodeType::Trash | NodeType::Sustained) {
            return Err(MfsStatus::EInval);
        }
        if self.quota_exceeded(parent, ts, 1, 0) {
            return Err(MfsStatus::Quota);
        }
        let gid = gids.first().copied().unwrap_or(0);
        let mut sclassid = self.nodes[&parent].sclassid;
        let mut trashretention = self.nodes[&parent].trashretention;
        let mut eattr = self.nodes[&parent].eattr;
        if let Some(ov) = patterns.find_matching(uid, gids, name) {
            if ov.omask & PATTERN_OMASK_SCLASS != 0 && ov.scid != 0 {
                sclassid = ov.scid;
            }
            if ov.omask & PATTERN_OMASK_TRASHRETENTION != 0 {
                trashretention = ov.trashretention;
            }
            if ov.omask & PATTERN_OMASK_EATTR != 0 {
                eattr = (eattr | ov.seteattr) & !ov.clreattr;
            }
        }
        let inode = self.do_create(
            ts,
            parent,
            name,
            ntype,
            mode & !cumask & 0xFFF,
            uid,
            gid,
            rdev,
            sclassid,
            trashretention,
            eattr,
        );
        sclass.incref(sclassid);
        chlog.append(&format!(
            "{}|CREATE({},{},{},{},{},{},{},{}):{}",
            ts,
            parent,
            escape_name(name),
            u8::from(ntype),
            mode & !cumask & 0xFFF,
            cumask,
            uid,
            gid,
            rdev,
            inode
        ));
        Ok(inode)
    }

    #[allow(clippy::too_many_arguments)]
    fn do_create(
        &mut self,
        ts: u32,
        parent: u32,
        name: &[u8],
        ntype: NodeType,
        mode: u16,
        uid: u32,
        gid: u32,
        rdev: u32,
        sclassid: u8,
        trashretention: u16,
        eattr: u8,
    ) -> u32 {
        let inode = self.alloc_inode();
        let data = match ntype {
            NodeType::File => NodeData::File { length: 0, chunks: Vec::new() },
            NodeType::Directory => NodeData::Dir { children: BTreeMap::new() },
            NodeType::Symlink => NodeData::Symlink { target: Vec::new() },
            NodeType::BlockDev | NodeType::CharDev => NodeData::Dev { rdev },
            _ => NodeData::Other,
        };
        self.nodes.insert(
            inode,
            FsNode {
                id: inode,
                ntype,
                mode,
                uid,
                gid,
                atime: ts,
                mtime: ts,
                ctime: ts,
                trashretention,
                sclassid,
                eattr,
                winattr: 0,
                parents: Vec::new(),
                data,
            },
        );
        self.attach(parent, name, inode);
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.mtime = ts;
            p.ctime = ts;
        }
        inode
    }

    pub fn symlink(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        sclass: &mut SclassRegistry,
        patterns: &PatternTable,
        parent: u32,
        name: &[u8],
        target: &[u8],
        uid: u32,
        gids: &[u32],
    ) -> Result<u32, MfsStatus> {
        if target.is_empty() || target.len() > MAX_PATH_LENG {
            return Err(MfsStatus::EInval);
        }
        let inode =
            self.create(chlog, ts, sclass, patterns, parent, name, NodeType::Symlink, 0o777, 0, uid, gids, 0)?;
        // the CREATE line made an empty symlink; the SETPATH line carries
        // the target
        if let Some(n) = self.nodes.get_mut(&inode) {
            n.data = NodeData::Symlink { target: target.to_vec() };
        }
        chlog.append(&format!("{}|SETPATH({},{})", ts, inode, escape_name(target)));
        Ok(inode)
    }

    pub fn readlink(&self, inode: u32) -> Result<&[u8], MfsStatus> {
        match self.nodes.get(&inode) {
            Some(FsNode { data: NodeData::Symlink { target }, .. }) => Ok(target),
            Some(_) => Err(MfsStatus::EInval),
            None => Err(MfsStatus::ENoEnt),
        }
    }

    pub fn link(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        inode: u32,
        parent: u32,
        name: &[u8],
    ) -> Result<(), MfsStatus> {
        valid_name(name)?;
        let n = self.nodes.get(&inode).ok_or(MfsStatus::ENoEnt)?;
        if n.is_dir() {
            return Err(MfsStatus::EPerm);
        }
        if matches!(n.ntype, NodeType::Trash | NodeType::Sustained) {
            return Err(MfsStatus::ENoEnt);
        }
        if n.parents.len() as u32 >= MAX_LINK_COUNT {
            return Err(MfsStatus::EMLink);
        }
        let children = self.dir_children(parent)?;
        if children.contains_key(name) {
            return Err(MfsStatus::EExist);
        }
        self.attach(parent, name, inode);
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.mtime = ts;
            p.ctime = ts;
        }
        if let Some(n) = self.nodes.get_mut(&inode) {
            n.ctime = ts;
        }
        chlog.append(&format!("{}|LINK({},{},{})", ts, inode, parent, escape_name(name)));
        Ok(())
    }

    /// Shared unlink path, run after the edge is detached: when the last
    /// link goes the node moves to trash (files with a retention), to the
    /// sustained bucket (still open) or is destroyed. `path` is the path
    /// the node had before the detach, kept for the trash listing.
    fn unlink_node(
        &mut self,
        ts: u32,
        sclass: &mut SclassRegistry,
        chunks: &mut ChunkIndex,
        inode: u32,
        is_open: bool,
        path: Vec<u8>,
    ) {
        let n = match self.nodes.get(&inode) {
            Some(n) => n,
            None => return,
        };
        if !n.parents.is_empty() {
            return; // other hard links remain
        }
        let n = self.nodes.get_mut(&inode).unwrap();
        if n.ntype == NodeType::File && n.trashretention > 0 {
            n.ntype = NodeType::Trash;
            n.ctime = ts;
            self.trash.insert(inode, path);
        } else if is_open {
            n.ntype = NodeType::Sustained;
            self.sustained.insert(inode, path);
        } else {
            self.destroy_node(ts, sclass, chunks, inode);
        }
    }

    fn destroy_node(&mut self, ts: u32, sclass: &mut SclassRegistry, chunks: &mut ChunkIndex, inode: u32) {
        if let Some(n) = self.nodes.remove(&inode) {
            sclass.decref(n.sclassid);
            if let NodeData::File { chunks: clist, .. } = &n.data {
                for (indx, &chunkid) in clist.iter().enumerate() {
                    if chunkid != 0 {
                        chunks.del_ref(ts, chunkid, inode, indx as u32);
                    }
                }
            }
            self.xattrs.remove(&inode);
            self.acls.remove(&(inode, 0));
            self.acls.remove(&(inode, 1));
            self.quotas.remove(&inode);
            self.pending_free.push((inode, ts));
        }
    }

    pub fn unlink(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        sclass: &mut SclassRegistry,
        chunks: &mut ChunkIndex,
        parent: u32,
        name: &[u8],
        is_open: impl Fn(u32) -> bool,
    ) -> Result<u32, MfsStatus> {
        valid_name(name)?;
        let inode = self.lookup(parent, name)?;
        if self.nodes.get(&inode).map_or(false, |n| n.is_dir()) {
            return Err(MfsStatus::EPerm);
        }
        let path = self.path_of(inode);
        self.detach(parent, name);
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.mtime = ts;
            p.ctime = ts;
        }
        if let Some(n) = self.nodes.get_mut(&inode) {
            n.ctime = ts;
        }
        chlog.append(&format!("{}|UNLINK({},{}):{}", ts, parent, escape_name(name), inode));
        let open = is_open(inode);
        self.unlink_node(ts, sclass, chunks, inode, open, path);
        Ok(inode)
    }

    pub fn rmdir(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        sclass: &mut SclassRegistry,
        chunks: &mut ChunkIndex,
        parent: u32,
        name: &[u8],
    ) -> Result<u32, MfsStatus> {
        valid_name(name)?;
        let inode = self.lookup(parent, name)?;
        match self.nodes.get(&inode) {
            Some(n) if !n.is_dir() => return Err(MfsStatus::ENotDir),
            Some(FsNode { data: NodeData::Dir { children }, .. }) if !children.is_empty() => {
                return Err(MfsStatus::ENotEmpty)
            }
            Some(_) => {}
            None => return Err(MfsStatus::ENoEnt),
        }
        self.detach(parent, name);
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.mtime = ts;
            p.ctime = ts;
        }
        chlog.append(&format!("{}|UNLINK({},{}):{}", ts, parent, escape_name(name), inode));
        self.destroy_node(ts, sclass, chunks, inode);
        Ok(inode)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn rename(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        sclass: &mut SclassRegistry,
        chunks: &mut ChunkIndex,
        parent_src: u32,
        name_src: &[u8],
        parent_dst: u32,
        name_dst: &[u8],
        is_open: impl Fn(u32) -> bool,
    ) -> Result<u32, MfsStatus> {
        valid_name(name_src)?;
        valid_name(name_dst)?;
        let inode = self.lookup(parent_src, name_src)?;
        self.dir_children(parent_dst)?;
        // a directory cannot move under its own subtree
        if self.nodes.get(&inode).map_or(false, |n| n.is_dir()) {
            let mut cur = Some(parent_dst);
            while let Some(id) = cur {
                if id == inode {
                    return Err(MfsStatus::EInval);
                }
                cur = self.nodes.get(&id).and_then(|n| n.parents.first().copied());
            }
        }
        if let Ok(existing) = self.lookup(parent_dst, name_dst) {
            if existing == inode {
                return Ok(inode);
            }
            match self.nodes.get(&existing) {
                Some(n) if n.is_dir() => match &n.data {
                    NodeData::Dir { children } if !children.is_empty() => {
                        return Err(MfsStatus::ENotEmpty)
                    }
                    _ => {
                        self.detach(parent_dst, name_dst);
                        self.destroy_node(ts, sclass, chunks, existing);
                    }
                },
                Some(_) => {
                    let path = self.path_of(existing);
                    self.detach(parent_dst, name_dst);
                    let open = is_open(existing);
                    self.unlink_node(ts, sclass, chunks, existing, open, path);
                }
                None => {}
            }
        }
        self.detach(parent_src, name_src);
        self.attach(parent_dst, name_dst, inode);
        for p in [parent_src, parent_dst] {
            if let Some(n) = self.nodes.get_mut(&p) {
                n.mtime = ts;
                n.ctime = ts;
            }
        }
        if let Some(n) = self.nodes.get_mut(&inode) {
            n.ctime = ts;
        }
        chlog.append(&format!(
            "{}|MOVE({},{},{},{}):{}",
            ts,
            parent_src,
            escape_name(name_src),
            parent_dst,
            escape_name(name_dst),
            inode
        ));
        Ok(inode)
    }

    /* attributes */

    #[allow(clippy::too_many_arguments)]
    pub fn setattr(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        inode: u32,
        mode: u16,
        uid: u32,
        gid: u32,
        atime: u32,
        mtime: u32,
        winattr: u8,
    ) -> Result<(), MfsStatus> {
        let n = self.nodes.get_mut(&inode).ok_or(MfsStatus::ENoEnt)?;
        n.mode = mode & 0xFFF;
        n.uid = uid;
        n.gid = gid;
        n.atime = atime;
        n.mtime = mtime;
        n.winattr = winattr;
        n.ctime = ts;
        chlog.append(&format!(
            "{}|ATTR({},{},{},{},{},{},{},{})",
            ts, inode, mode & 0xFFF, uid, gid, atime, mtime, winattr, mode & 0xFFF
        ));
        Ok(())
    }

    pub fn amtime(&mut self, chlog: &mut Changelog, inode: u32, atime: u32, mtime: u32, ctime: u32) -> Result<(), MfsStatus> {
        let n = self.nodes.get_mut(&inode).ok_or(MfsStatus::ENoEnt)?;
        n.atime = atime;
        n.mtime = mtime;
        n.ctime = ctime;
        chlog.append(&format!("0|AMTIME({},{},{},{})", inode, atime, mtime, ctime));
        Ok(())
    }

    pub fn access(&mut self, chlog: &mut Changelog, ts: u32, inode: u32) -> Result<(), MfsStatus> {
        let n = self.nodes.get_mut(&inode).ok_or(MfsStatus::ENoEnt)?;
        n.atime = ts;
        chlog.append(&format!("{}|ACCESS({})", ts, inode));
        Ok(())
    }

    /// Recursive attribute-change driver shared by the class, retention
    /// and eattr setters. Returns (changed, notchanged, notpermitted).
    fn recursive_apply(
        &mut self,
        inode: u32,
        recursive: bool,
        uid: u32,
        apply: &mut impl FnMut(&mut FsNode) -> bool,
    ) -> (u32, u32, u32) {
        let mut ci = 0;
        let mut nci = 0;
        let mut npi = 0;
        let mut stack = vec![inode];
        while let Some(id) = stack.pop() {
            if recursive {
                if let Some(NodeData::Dir { children }) = self.nodes.get(&id).map(|n| &n.data) {
                    stack.extend(children.values().map(|e| e.inode));
                }
            }
            if let Some(n) = self.nodes.get_mut(&id) {
                if uid != 0 && n.uid != uid {
                    npi += 1;
                } else if apply(n) {
                    ci += 1;
                } else {
                    nci += 1;
                }
            }
        }
        (ci, nci, npi)
    }

    pub fn settrashretention(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        inode: u32,
        uid: u32,
        trashretention: u16,
        smode: u8,
    ) -> Result<(u32, u32, u32), MfsStatus> {
        if self.nodes.get(&inode).is_none() {
            return Err(MfsStatus::ENoEnt);
        }
        let recursive = smode & 0x10 != 0;
        let res = self.recursive_apply(inode, recursive, uid, &mut |n| {
            let new = match smode & 0x0F {
                SMODE_INCREASE => n.trashretention.max(trashretention),
                SMODE_DECREASE => n.trashretention.min(trashretention),
                _ => trashretention,
            };
            if new != n.trashretention {
                n.trashretention = new;
                n.ctime = ts;
                true
            } else {
                false
            }
        });
        chlog.append(&format!(
            "{}|SETTRASHTIME({},{},{},{}):{},{},{}",
            ts, inode, uid, trashretention, smode, res.0, res.1, res.2
        ));
        Ok(res)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn setsclass(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        sclass: &mut SclassRegistry,
        chunks: &mut ChunkIndex,
        inode: u32,
        uid: u32,
        src_sclassid: u8,
        dst_sclassid: u8,
        smode: u8,
    ) -> Result<(u32, u32, u32), MfsStatus> {
        if self.nodes.get(&inode).is_none() {
            return Err(MfsStatus::ENoEnt);
        }
        if sclass.get(dst_sclassid).is_none() {
            return Err(MfsStatus::NoSuchClass);
        }
        let goal = sclass.get(dst_sclassid).map(|sc| sc.keep.copies()).unwrap_or(1);
        let mut reref: Vec<u8> = Vec::new();
        let mut regoal: Vec<u64> = Vec::new();
        let res = self.recursive_apply(inode, smode & 0x10 != 0, uid, &mut |n| {
            // exchange mode only touches nodes currently in src class
            if smode & 0x0F == 3 && n.sclassid != src_sclassid {
                return false;
            }
            if n.sclassid == dst_sclassid {
                return false;
            }
            reref.push(n.sclassid);
            n.sclassid = dst_sclassid;
            n.ctime = ts;
            if let NodeData::File { chunks: clist, .. } = &n.data {
                regoal.extend(clist.iter().filter(|&&c| c != 0));
            }
            true
        });
        for old in reref {
            sclass.decref(old);
            sclass.incref(dst_sclassid);
        }
        for chunkid in regoal {
            chunks.set_goal(chunkid, goal);
        }
        chlog.append(&format!(
            "{}|SETSCLASS({},{},{},{},{}):{},{},{}",
            ts, inode, uid, src_sclassid, dst_sclassid, smode, res.0, res.1, res.2
        ));
        Ok(res)
    }

    pub fn seteattr(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        inode: u32,
        uid: u32,
        eattr: u8,
        smode: u8,
    ) -> Result<(u32, u32, u32), MfsStatus> {
        if self.nodes.get(&inode).is_none() {
            return Err(MfsStatus::ENoEnt);
        }
        let res = self.recursive_apply(inode, smode & 0x10 != 0, uid, &mut |n| {
            let new = match smode & 0x0F {
                SMODE_INCREASE => n.eattr | eattr,
                SMODE_DECREASE => n.eattr & !eattr,
                _ => eattr,
            };
            if new != n.eattr {
                n.eattr = new;
                n.ctime = ts;
                true
            } else {
                false
            }
        });
        chlog.append(&format!(
            "{}|SETEATTR({},{},{},{}):{},{},{}",
            ts, inode, uid, eattr, smode, res.0, res.1, res.2
        ));
        Ok(res)
    }

    /* xattr and acl */

    pub fn setxattr(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        inode: u32,
        name: &[u8],
        value: &[u8],
        mode: u8,
    ) -> Result<(), MfsStatus> {
        if self.nodes.get(&inode).is_none() {
            return Err(MfsStatus::ENoEnt);
        }
        if name.is_empty() || name.len() > MAX_NAME_LENG {
            return Err(MfsStatus::EInval);
        }
        let present = self.xattrs.get(&inode).map_or(false, |m| m.contains_key(name));
        match mode {
            // 0 = create or replace, 1 = create only, 2 = replace only, 3 = remove
            0 => {
                self.xattrs.entry(inode).or_default().insert(name.to_vec(), value.to_vec());
            }
            1 => {
                if present {
                    return Err(MfsStatus::EExist);
                }
                self.xattrs.entry(inode).or_default().insert(name.to_vec(), value.to_vec());
            }
            2 => {
                if !present {
                    return Err(MfsStatus::ENoAttr);
                }
                self.xattrs.entry(inode).or_default().insert(name.to_vec(), value.to_vec());
            }
            3 => {
                if !present {
                    return Err(MfsStatus::ENoAttr);
                }
                self.xattrs.get_mut(&inode).unwrap().remove(name);
            }
            _ => return Err(MfsStatus::EInval),
        }
        if self.xattrs.get(&inode).map_or(false, |m| m.is_empty()) {
            self.xattrs.remove(&inode);
        }
        if let Some(n) = self.nodes.get_mut(&inode) {
            n.ctime = ts;
        }
        chlog.append(&format!(
            "{}|SETXATTR({},{},{},{})",
            ts,
            inode,
            escape_name(name),
            escape_name(value),
            mode
        ));
        Ok(())
    }

    pub fn getxattr(&self, inode: u32, name: &[u8]) -> Result<&[u8], MfsStatus> {
        self.xattrs
            .get(&inode)
            .and_then(|m| m.get(name))
            .map(|v| v.as_slice())
            .ok_or(MfsStatus::ENoAttr)
    }

    pub fn listxattr(&self, inode: u32) -> Vec<&[u8]> {
        self.xattrs
            .get(&inode)
            .map(|m| m.keys().map(|k| k.as_slice()).collect())
            .unwrap_or_default()
    }

    pub fn setacl(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        inode: u32,
        acltype: u8,
        data: &[u8],
    ) -> Result<(), MfsStatus> {
        if self.nodes.get(&inode).is_none() {
            return Err(MfsStatus::ENoEnt);
        }
        if acltype > 1 {
            return Err(MfsStatus::EInval);
        }
        if data.is_empty() {
            self.acls.remove(&(inode, acltype));
        } else {
            self.acls.insert((inode, acltype), data.to_vec());
        }
        if let Some(n) = self.nodes.get_mut(&inode) {
            n.ctime = ts;
        }
        chlog.append(&format!("{}|SETACL({},{},{})", ts, inode, acltype, escape_name(data)));
        Ok(())
    }

    pub fn getacl(&self, inode: u32, acltype: u8) -> Option<&[u8]> {
        self.acls.get(&(inode, acltype)).map(|v| v.as_slice())
    }

    /* file data plane bookkeeping */

    /// Open a chunk of a file for writing: allocates the chunk on first
    /// touch, otherwise bumps its version under the write lease.
    pub fn write_chunk(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        sclass: &SclassRegistry,
        chunks: &mut ChunkIndex,
        inode: u32,
        indx: u32,
    ) -> Result<(u64, u32), MfsStatus> {
        if indx > MAX_CHUNK_INDEX {
            return Err(MfsStatus::IndexTooBig);
        }
        let n = self.nodes.get(&inode).ok_or(MfsStatus::ENoEnt)?;
        if !n.ntype.is_file_like() {
            return Err(MfsStatus::EPerm);
        }
        if self.quota_exceeded(inode, ts, 0, MFS_CHUNK_BYTES) {
            return Err(MfsStatus::Quota);
        }
        let goal = sclass.get(n.sclassid).map(|sc| sc.keep.copies()).unwrap_or(1);
        let existing = match &n.data {
            NodeData::File { chunks: clist, .. } => clist.get(indx as usize).copied().unwrap_or(0),
            _ => return Err(MfsStatus::EPerm),
        };
        let (chunkid, version, opflag) = if existing == 0 {
            let (chunkid, version) = chunks.create(ts, inode, indx, goal);
            (chunkid, version, 1u32)
        } else {
            let version = chunks.open_for_write(ts, existing)?;
            (existing, version, 0u32)
        };
        let n = self.nodes.get_mut(&inode).unwrap();
        if let NodeData::File { chunks: clist, .. } = &mut n.data {
            if clist.len() <= indx as usize {
                clist.resize(indx as usize + 1, 0);
            }
            clist[indx as usize] = chunkid;
        }
        n.mtime = ts;
        n.ctime = ts;
        chlog.append(&format!("{}|WRITE({},{},{},1):{}", ts, inode, indx, opflag, chunkid));
        Ok((chunkid, version))
    }

    /// Read access to one chunk of a file.
    pub fn read_chunk(&self, inode: u32, indx: u32) -> Result<(u64, u64), MfsStatus> {
        if indx > MAX_CHUNK_INDEX {
            return Err(MfsStatus::IndexTooBig);
        }
        let n = self.nodes.get(&inode).ok_or(MfsStatus::ENoEnt)?;
        match &n.data {
            NodeData::File { length, chunks } => {
                let chunkid = chunks.get(indx as usize).copied().unwrap_or(0);
                Ok((chunkid, *length))
            }
            _ => Err(MfsStatus::EPerm),
        }
    }

    /// Close of a write: release the chunk lease and settle file length.
    pub fn write_chunk_end(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        chunks: &mut ChunkIndex,
        chunkid: u64,
        inode: u32,
        length: u64,
    ) -> Result<Vec<crate::rmfs_lib::chunks::ChunkWaiter>, MfsStatus> {
        if chunks.get(chunkid).is_none() {
            return Err(MfsStatus::NoChunk);
        }
        if length > 0 {
            self.set_length(chlog, ts, chunks, inode, length, true)?;
        }
        chlog.append(&format!("{}|UNLOCK({})", ts, chunkid));
        Ok(chunks.unlock(chunkid))
    }

    // shrink the chunk list when the new length cuts whole chunks off;
    // returns the dropped (indx, chunkid) pairs
    fn cut_chunks(n: &mut FsNode, length: u64) -> Vec<(u32, u64)> {
        let keep = ((length + MFS_CHUNK_BYTES - 1) / MFS_CHUNK_BYTES) as usize;
        let mut dropped = Vec::new();
        if let NodeData::File { length: l, chunks: clist } = &mut n.data {
            while clist.len() > keep {
                let indx = clist.len() - 1;
                let chunkid = clist.pop().unwrap();
                if chunkid != 0 {
                    dropped.push((indx as u32, chunkid));
                }
            }
            *l = length;
        }
        dropped
    }

    /// Set the file length; both the write-close path and truncation.
    /// Shrinking cuts the chunk list and drops the references beyond the
    /// new end.
    pub fn set_length(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        chunks: &mut ChunkIndex,
        inode: u32,
        length: u64,
        canmodmtime: bool,
    ) -> Result<(), MfsStatus> {
        let n = self.nodes.get_mut(&inode).ok_or(MfsStatus::ENoEnt)?;
        if !matches!(n.data, NodeData::File { .. }) {
            return Err(MfsStatus::EPerm);
        }
        let dropped = Self::cut_chunks(n, length);
        if canmodmtime {
            n.mtime = ts;
            n.ctime = ts;
        }
        for (indx, chunkid) in dropped {
            chunks.del_ref(ts, chunkid, inode, indx);
        }
        chlog.append(&format!(
            "{}|LENGTH({},{},{})",
            ts,
            inode,
            length,
            canmodmtime as u8
        ));
        Ok(())
    }

    /* readdir */

    /// Directory entries after the `cursor` edge id, in edge-id order
    /// (the dirent cursor), at most `maxentries`.
    pub fn readdir(
        &self,
        inode: u32,
        cursor: u64,
        maxentries: usize,
    ) -> Result<Vec<(u64, Vec<u8>, u32, NodeType)>, MfsStatus> {
        let children = self.dir_children(inode)?;
        let mut entries: Vec<(u64, Vec<u8>, u32, NodeType)> = children
            .iter()
            .filter(|(_, e)| e.edgeid > cursor)
            .filter_map(|(name, e)| {
                self.nodes.get(&e.inode).map(|n| (e.edgeid, name.clone(), e.inode, n.ntype))
            })
            .collect();
        entries.sort_by_key(|(edgeid, _, _, _)| *edgeid);
        entries.truncate(maxentries);
        Ok(entries)
    }

    /* trash / sustained lifecycle */

    pub fn trash_path(&self, inode: u32) -> Result<&[u8], MfsStatus> {
        self.trash.get(&inode).map(|p| p.as_slice()).ok_or(MfsStatus::ENoEnt)
    }

    pub fn set_trash_path(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        inode: u32,
        path: &[u8],
    ) -> Result<(), MfsStatus> {
        if path.is_empty() || path.len() > MAX_PATH_LENG {
            return Err(MfsStatus::EInval);
        }
        if !self.trash.contains_key(&inode) {
            return Err(MfsStatus::ENoEnt);
        }
        self.trash.insert(inode, path.to_vec());
        chlog.append(&format!("{}|SETPATH({},{})", ts, inode, escape_name(path)));
        Ok(())
    }

    /// Reattach a trashed node at its stored path, recreating missing
    /// directories along the way.
    pub fn undel(&mut self, chlog: &mut Changelog, ts: u32, sclass: &mut SclassRegistry, inode: u32) -> Result<(), MfsStatus> {
        let path = self.trash.get(&inode).cloned().ok_or(MfsStatus::ENoEnt)?;
        self.do_undel(ts, sclass, inode, &path)?;
        chlog.append(&format!("{}|UNDEL({})", ts, inode));
        Ok(())
    }

    fn do_undel(&mut self, ts: u32, sclass: &mut SclassRegistry, inode: u32, path: &[u8]) -> Result<(), MfsStatus> {
        let parts: Vec<&[u8]> = path.split(|&c| c == b'/').filter(|p| !p.is_empty()).collect();
        let (dirs, leaf) = match parts.split_last() {
            Some((leaf, dirs)) => (dirs, *leaf),
            None => return Err(MfsStatus::CantCreatePath),
        };
        valid_name(leaf)?;
        // validate the whole walk before mutating anything: a conflict at
        // the leaf must not leave freshly created directories behind
        {
            let mut cur = ROOT_INODE;
            let mut exists = true;
            for part in dirs {
                match self.lookup(cur, part) {
                    Ok(next) if self.nodes.get(&next).map_or(false, |n| n.is_dir()) => cur = next,
                    Ok(_) => return Err(MfsStatus::CantCreatePath),
                    Err(MfsStatus::ENoEnt) => {
                        exists = false;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if exists && self.lookup(cur, leaf).is_ok() {
                return Err(MfsStatus::EExist);
            }
        }
        let mut cur = ROOT_INODE;
        for part in dirs {
            cur = match self.lookup(cur, part) {
                Ok(next) => next,
                Err(_) => {
                    let (uid, gid, scid) = {
                        let n = &self.nodes[&inode];
                        (n.uid, n.gid, n.sclassid)
                    };
                    let d = self.do_create(ts, cur, part, NodeType::Directory, 0o755, uid, gid, 0, scid, 0, 0);
                    sclass.incref(scid);
                    d
                }
            };
        }
        self.trash.remove(&inode);
        if let Some(n) = self.nodes.get_mut(&inode) {
            n.ntype = NodeType::File;
            n.ctime = ts;
        }
        self.attach(cur, leaf, inode);
        if let Some(p) = self.nodes.get_mut(&cur) {
            p.mtime = ts;
            p.ctime = ts;
        }
        Ok(())
    }

    /// Irrevocably destroy one trashed node.
    pub fn purge(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        sclass: &mut SclassRegistry,
        chunks: &mut ChunkIndex,
        inode: u32,
    ) -> Result<(), MfsStatus> {
        if !self.trash.contains_key(&inode) {
            return Err(MfsStatus::ENoEnt);
        }
        chlog.append(&format!("{}|PURGE({})", ts, inode));
        self.trash.remove(&inode);
        self.destroy_node(ts, sclass, chunks, inode);
        Ok(())
    }

    /// Expire trash entries past their retention. Nodes still held open
    /// move to the sustained bucket instead of dying.
    pub fn emptytrash(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        sclass: &mut SclassRegistry,
        chunks: &mut ChunkIndex,
        is_open: impl Fn(u32) -> bool,
    ) -> (u32, u32) {
        let expired: Vec<u32> = self
            .trash
            .iter()
            .filter(|(&inode, _)| {
                self.nodes
                    .get(&inode)
                    .map_or(true, |n| ts >= n.ctime.saturating_add(n.trashretention as u32 * 3600))
            })
            .map(|(&inode, _)| inode)
            .collect();
        let mut freed = 0;
        let mut sustained = 0;
        for inode in expired {
            let path = self.trash.remove(&inode).unwrap_or_default();
            if is_open(inode) {
                if let Some(n) = self.nodes.get_mut(&inode) {
                    n.ntype = NodeType::Sustained;
                }
                self.sustained.insert(inode, path);
                sustained += 1;
            } else {
                self.destroy_node(ts, sclass, chunks, inode);
                freed += 1;
            }
        }
        chlog.append(&format!("{}|EMPTYTRASH():{},{}", ts, freed, sustained));
        (freed, sustained)
    }

    /// Destroy sustained nodes nobody holds open anymore.
    pub fn emptysustained(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        sclass: &mut SclassRegistry,
        chunks: &mut ChunkIndex,
        is_open: impl Fn(u32) -> bool,
    ) -> u32 {
        let closed: Vec<u32> =
            self.sustained.keys().copied().filter(|&inode| !is_open(inode)).collect();
        let mut freed = 0;
        for inode in closed {
            self.sustained.remove(&inode);
            self.destroy_node(ts, sclass, chunks, inode);
            freed += 1;
        }
        chlog.append(&format!("{}|EMPTYSUSTAINED():{}", ts, freed));
        freed
    }

    /// Recycle inode ids whose quarantine delay elapsed.
    pub fn freeinodes(&mut self, chlog: &mut Changelog, ts: u32) -> u32 {
        let mut freed = 0;
        let mut keep = Vec::new();
        for (id, freed_at) in self.pending_free.drain(..) {
            if ts.saturating_sub(freed_at) >= INODE_REUSE_DELAY {
                self.freeinodes.push(id);
                freed += 1;
            } else {
                keep.push((id, freed_at));
            }
        }
        self.pending_free = keep;
        if freed > 0 {
            chlog.append(&format!("{}|FREEINODES():{}", ts, freed));
        }
        freed
    }

    /* replay entry points */

    #[allow(clippy::too_many_arguments)]
    pub fn mr_create(
        &mut self,
        ts: u32,
        sclass: &mut SclassRegistry,
        parent: u32,
        name: &[u8],
        ntype: u8,
        mode: u16,
        _cumask: u16,
        uid: u32,
        gid: u32,
        rdev: u32,
        expected_inode: u32,
    ) -> MfsStatus {
        let ntype = match NodeType::try_from(ntype) {
            Ok(t) => t,
            Err(_) => return MfsStatus::EInval,
        };
        if self.dir_children(parent).is_err() {
            return MfsStatus::Mismatch;
        }
        if self.dir_children(parent).unwrap().contains_key(name) {
            return MfsStatus::Mismatch;
        }
        let (scid, tret, eattr) = {
            let p = &self.nodes[&parent];
            (p.sclassid, p.trashretention, p.eattr)
        };
        let inode = self.do_create(ts, parent, name, ntype, mode, uid, gid, rdev, scid, tret, eattr);
        if inode != expected_inode {
            return MfsStatus::Mismatch;
        }
        sclass.incref(scid);
        MfsStatus::Ok
    }

    pub fn mr_unlink(
        &mut self,
        ts: u32,
        sclass: &mut SclassRegistry,
        chunks: &mut ChunkIndex,
        is_open: impl Fn(u32) -> bool,
        parent: u32,
        name: &[u8],
        expected_inode: u32,
    ) -> MfsStatus {
        let inode = match self.lookup(parent, name) {
            Ok(i) => i,
            Err(_) => return MfsStatus::Mismatch,
        };
        if inode != expected_inode {
            return MfsStatus::Mismatch;
        }
        if self.nodes.get(&inode).map_or(false, |n| n.is_dir()) {
            match self.dir_children(inode) {
                Ok(c) if !c.is_empty() => return MfsStatus::Mismatch,
                _ => {}
            }
            self.detach(parent, name);
            self.destroy_node(ts, sclass, chunks, inode);
            return MfsStatus::Ok;
        }
        let path = self.path_of(inode);
        self.detach(parent, name);
        let open = is_open(inode);
        self.unlink_node(ts, sclass, chunks, inode, open, path);
        MfsStatus::Ok
    }

    #[allow(clippy::too_many_arguments)]
    pub fn mr_move(
        &mut self,
        ts: u32,
        sclass: &mut SclassRegistry,
        chunks: &mut ChunkIndex,
        parent_src: u32,
        name_src: &[u8],
        parent_dst: u32,
        name_dst: &[u8],
        expected_inode: u32,
    ) -> MfsStatus {
        let mut cl = Changelog::memory();
        match self.rename(&mut cl, ts, sclass, chunks, parent_src, name_src, parent_dst, name_dst, |_| false)
        {
            Ok(inode) if inode == expected_inode => MfsStatus::Ok,
            Ok(_) => MfsStatus::Mismatch,
            Err(_) => MfsStatus::Mismatch,
        }
    }

    pub fn mr_link(&mut self, ts: u32, inode: u32, parent: u32, name: &[u8]) -> MfsStatus {
        let mut cl = Changelog::memory();
        match self.link(&mut cl, ts, inode, parent, name) {
            Ok(()) => MfsStatus::Ok,
            Err(_) => MfsStatus::Mismatch,
        }
    }

    pub fn mr_write(
        &mut self,
        ts: u32,
        chunks: &mut ChunkIndex,
        inode: u32,
        indx: u32,
        opflag: u32,
        canmodmtime: bool,
        chunkid: u64,
    ) -> MfsStatus {
        let status = chunks.mr_write(ts, chunkid, opflag != 0);
        if status != MfsStatus::Ok {
            return status;
        }
        chunks.add_ref(chunkid, inode, indx);
        match self.nodes.get_mut(&inode) {
            Some(n) => {
                if let NodeData::File { chunks: clist, .. } = &mut n.data {
                    if clist.len() <= indx as usize {
                        clist.resize(indx as usize + 1, 0);
                    }
                    clist[indx as usize] = chunkid;
                }
                if canmodmtime {
                    n.mtime = ts;
                    n.ctime = ts;
                }
                MfsStatus::Ok
            }
            None => MfsStatus::Mismatch,
        }
    }

    pub fn mr_length(
        &mut self,
        ts: u32,
        chunks: &mut ChunkIndex,
        inode: u32,
        length: u64,
        canmodmtime: bool,
    ) -> MfsStatus {
        let n = match self.nodes.get_mut(&inode) {
            Some(n) => n,
            None => return MfsStatus::Mismatch,
        };
        if !matches!(n.data, NodeData::File { .. }) {
            return MfsStatus::Mismatch;
        }
        let dropped = Self::cut_chunks(n, length);
        if canmodmtime {
            n.mtime = ts;
            n.ctime = ts;
        }
        for (indx, chunkid) in dropped {
            chunks.del_ref(ts, chunkid, inode, indx);
        }
        MfsStatus::Ok
    }

    pub fn mr_undel(&mut self, ts: u32, sclass: &mut SclassRegistry, inode: u32) -> MfsStatus {
        let path = match self.trash.get(&inode).cloned() {
            Some(p) => p,
            None => return MfsStatus::Mismatch,
        };
        match self.do_undel(ts, sclass, inode, &path) {
            Ok(()) => MfsStatus::Ok,
            Err(_) => MfsStatus::Mismatch,
        }
    }

    pub fn mr_purge(&mut self, ts: u32, sclass: &mut SclassRegistry, chunks: &mut ChunkIndex, inode: u32) -> MfsStatus {
        if self.trash.remove(&inode).is_none() {
            return MfsStatus::Mismatch;
        }
        self.destroy_node(ts, sclass, chunks, inode);
        MfsStatus::Ok
    }

    pub fn mr_emptytrash(
        &mut self,
        ts: u32,
        sclass: &mut SclassRegistry,
        chunks: &mut ChunkIndex,
        is_open: impl Fn(u32) -> bool,
        expected_freed: u32,
        expected_sustained: u32,
    ) -> MfsStatus {
        let mut cl = Changelog::memory();
        let (freed, sustained) = self.emptytrash(&mut cl, ts, sclass, chunks, is_open);
        if freed == expected_freed && sustained == expected_sustained {
            MfsStatus::Ok
        } else {
            MfsStatus::Mismatch
        }
    }

    pub fn mr_emptysustained(
        &mut self,
        ts: u32,
        sclass: &mut SclassRegistry,
        chunks: &mut ChunkIndex,
        is_open: impl Fn(u32) -> bool,
        expected_freed: u32,
    ) -> MfsStatus {
        let mut cl = Changelog::memory();
        let freed = self.emptysustained(&mut cl, ts, sclass, chunks, is_open);
        if freed == expected_freed {
            MfsStatus::Ok
        } else {
            MfsStatus::Mismatch
        }
    }

    pub fn mr_freeinodes(&mut self, ts: u32, expected: u32) -> MfsStatus {
        let mut cl = Changelog::memory();
        let freed = self.freeinodes(&mut cl, ts);
        if freed == expected {
            MfsStatus::Ok
        } else {
            MfsStatus::Mismatch
        }
    }

    pub fn mr_setpath(&mut self, inode: u32, path: &[u8]) -> MfsStatus {
        // SETPATH doubles as the symlink-target record and the trash-path
        // rename, depending on what the inode is
        if let Some(n) = self.nodes.get_mut(&inode) {
            if let NodeData::Symlink { target } = &mut n.data {
                *target = path.to_vec();
                return MfsStatus::Ok;
            }
        }
        if self.trash.contains_key(&inode) {
            self.trash.insert(inode, path.to_vec());
            return MfsStatus::Ok;
        }
        MfsStatus::Mismatch
    }

    #[allow(clippy::too_many_arguments)]
    pub fn mr_attr(
        &mut self,
        ts: u32,
        inode: u32,
        mode: u16,
        uid: u32,
        gid: u32,
        atime: u32,
        mtime: u32,
        winattr: u8,
    ) -> MfsStatus {
        match self.nodes.get_mut(&inode) {
            Some(n) => {
                n.mode = mode & 0xFFF;
                n.uid = uid;
                n.gid = gid;
                n.atime = atime;
                n.mtime = mtime;
                n.winattr = winattr;
                n.ctime = ts;
                MfsStatus::Ok
            }
            None => MfsStatus::Mismatch,
        }
    }

    pub fn mr_amtime(&mut self, inode: u32, atime: u32, mtime: u32, ctime: u32) -> MfsStatus {
        match self.nodes.get_mut(&inode) {
            Some(n) => {
                n.atime = atime;
                n.mtime = mtime;
                n.ctime = ctime;
                MfsStatus::Ok
            }
            None => MfsStatus::Mismatch,
        }
    }

    pub fn mr_access(&mut self, ts: u32, inode: u32) -> MfsStatus {
        match self.nodes.get_mut(&inode) {
            Some(n) => {
                n.atime = ts;
                MfsStatus::Ok
            }
            None => MfsStatus::Mismatch,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn mr_quota(
        &mut self,
        inode: u32,
        exceeded: bool,
        flags: u8,
        stimestamp: u32,
        sinodes: u32,
        hinodes: u32,
        slength: u64,
        hlength: u64,
        ssize: u64,
        hsize: u64,
        srealsize: u64,
        hrealsize: u64,
        timelimit: u32,
    ) -> MfsStatus {
        if self.nodes.get(&inode).is_none() {
            return MfsStatus::Mismatch;
        }
        if flags == 0 {
            self.quotas.remove(&inode);
        } else {
            self.quotas.insert(
                inode,
                QuotaEntry {
                    flags,
                    exceeded,
                    stimestamp,
                    sinodes,
                    hinodes,
                    slength,
                    hlength,
                    ssize,
                    hsize,
                    srealsize,
                    hrealsize,
                    timelimit,
                },
            );
        }
        MfsStatus::Ok
    }

    /* image sections */

    pub fn store_nodes(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(&self.nextinodeid.to_be_bytes())?;
        w.write_all(&self.nextedgeid.to_be_bytes())?;
        let mut ids: Vec<u32> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let n = &self.nodes[&id];
            w.write_all(&[u8::from(n.ntype)])?;
            w.write_all(&n.id.to_be_bytes())?;
            w.write_all(&n.mode.to_be_bytes())?;
            w.write_all(&n.uid.to_be_bytes())?;
            w.write_all(&n.gid.to_be_bytes())?;
            w.write_all(&n.atime.to_be_bytes())?;
            w.write_all(&n.mtime.to_be_bytes())?;
            w.write_all(&n.ctime.to_be_bytes())?;
            w.write_all(&n.trashretention.to_be_bytes())?;
            w.write_all(&[n.sclassid, n.eattr, n.winattr])?;
            match &n.data {
                NodeData::File { length, chunks } => {
                    w.write_all(&length.to_be_bytes())?;
                    w.write_all(&(chunks.len() as u32).to_be_bytes())?;
                    for c in chunks {
                        w.write_all(&c.to_be_bytes())?;
                    }
                }
                NodeData::Symlink { target } => {
                    w.write_all(&(target.len() as u32).to_be_bytes())?;
                    w.write_all(target)?;
                }
                NodeData::Dev { rdev } => {
                    w.write_all(&rdev.to_be_bytes())?;
                }
                NodeData::Dir { .. } | NodeData::Other => {}
            }
        }
        w.write_all(&[0u8])?;
        Ok(())
    }

    pub fn store_edges(&self, w: &mut impl Write) -> Result<()> {
        let mut ids: Vec<u32> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if let NodeData::Dir { children } = &self.nodes[&id].data {
                for (name, e) in children {
                    w.write_all(&id.to_be_bytes())?;
                    w.write_all(&e.inode.to_be_bytes())?;
                    w.write_all(&e.edgeid.to_be_bytes())?;
                    w.write_all(&(name.len() as u32).to_be_bytes())?;
                    w.write_all(name)?;
                }
            }
        }
        // trash and sustained membership is stored as edges with the
        // distinguished parent markers
        for (marker, map) in [(0xFFFF_FFFFu32, &self.trash), (0xFFFF_FFFEu32, &self.sustained)] {
            let mut ids: Vec<u32> = map.keys().copied().collect();
            ids.sort_unstable();
            for id in ids {
                let path = &map[&id];
                w.write_all(&marker.to_be_bytes())?;
                w.write_all(&id.to_be_bytes())?;
                w.write_all(&0u64.to_be_bytes())?;
                w.write_all(&(path.len() as u32).to_be_bytes())?;
                w.write_all(path)?;
            }
        }
        w.write_all(&[0u8; 8])?;
        Ok(())
    }

    pub fn store_free(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(&(self.freeinodes.len() as u32).to_be_bytes())?;
        for id in &self.freeinodes {
            w.write_all(&id.to_be_bytes())?;
        }
        w.write_all(&(self.pending_free.len() as u32).to_be_bytes())?;
        for (id, ts) in &self.pending_free {
            w.write_all(&id.to_be_bytes())?;
            w.write_all(&ts.to_be_bytes())?;
        }
        Ok(())
    }

    pub fn store_quota(&self, w: &mut impl Write) -> Result<()> {
        let mut ids: Vec<u32> = self.quotas.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let q = &self.quotas[&id];
            w.write_all(&id.to_be_bytes())?;
            w.write_all(&[q.flags, q.exceeded as u8])?;
            w.write_all(&q.stimestamp.to_be_bytes())?;
            w.write_all(&q.sinodes.to_be_bytes())?;
            w.write_all(&q.hinodes.to_be_bytes())?;
            w.write_all(&q.slength.to_be_bytes())?;
            w.write_all(&q.hlength.to_be_bytes())?;
            w.write_all(&q.ssize.to_be_bytes())?;
            w.write_all(&q.hsize.to_be_bytes())?;
            w.write_all(&q.srealsize.to_be_bytes())?;
            w.write_all(&q.hrealsize.to_be_bytes())?;
            w.write_all(&q.timelimit.to_be_bytes())?;
        }
        w.write_all(&0u32.to_be_bytes())?;
        Ok(())
    }

    pub fn store_xattr(&self, w: &mut impl Write) -> Result<()> {
        let mut ids: Vec<u32> = self.xattrs.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            for (name, value) in &self.xattrs[&id] {
                w.write_all(&id.to_be_bytes())?;
                w.write_all(&[name.len() as u8])?;
                w.write_all(name)?;
                w.write_all(&(value.len() as u32).to_be_bytes())?;
                w.write_all(value)?;
            }
        }
        w.write_all(&0u32.to_be_bytes())?;
        Ok(())
    }

    pub fn store_acl(&self, w: &mut impl Write) -> Result<()> {
        let mut keys: Vec<(u32, u8)> = self.acls.keys().copied().collect();
        keys.sort_unstable();
        for (id, acltype) in keys {
            let data = &self.acls[&(id, acltype)];
            w.write_all(&id.to_be_bytes())?;
            w.write_all(&[acltype])?;
            w.write_all(&(data.len() as u32).to_be_bytes())?;
            w.write_all(data)?;
        }
        w.write_all(&0u32.to_be_bytes())?;
        Ok(())
    }

    pub fn load_nodes(&mut self, data: &[u8]) -> Result<()> {
        let mut c = Cursor::new(data);
        self.nodes.clear();
        self.nextinodeid = c.get_u32()?;
        self.nextedgeid = c.get_u64()?;
        loop {
            let t = c.get_u8()?;
            if t == 0 {
                break;
            }
            let ntype = NodeType::try_from(t).map_err(|_| anyhow::anyhow!("bad node type {}", t))?;
            let id = c.get_u32()?;
            let mode = c.get_u16()?;
            let uid = c.get_u32()?;
            let gid = c.get_u32()?;
            let atime = c.get_u32()?;
            let mtime = c.get_u32()?;
            let ctime = c.get_u32()?;
            let trashretention = c.get_u16()?;
            let sclassid = c.get_u8()?;
            let eattr = c.get_u8()?;
            let winattr = c.get_u8()?;
            let data = match ntype {
                NodeType::File | NodeType::Trash | NodeType::Sustained => {
                    let length = c.get_u64()?;
                    let cnt = c.get_u32()? as usize;
                    let mut chunks = Vec::with_capacity(cnt);
                    for _ in 0..cnt {
                        chunks.push(c.get_u64()?);
                    }
                    NodeData::File { length, chunks }
                }
                NodeType::Directory => NodeData::Dir { children: BTreeMap::new() },
                NodeType::Symlink => {
                    let leng = c.get_u32()? as usize;
                    NodeData::Symlink { target: c.get_bytes(leng)?.to_vec() }
                }
                NodeType::BlockDev | NodeType::CharDev => NodeData::Dev { rdev: c.get_u32()? },
                _ => NodeData::Other,
            };
            if self.nodes.contains_key(&id) {
                bail!("duplicate inode {}", id);
            }
            self.nodes.insert(
                id,
                FsNode {
                    id,
                    ntype,
                    mode,
                    uid,
                    gid,
                    atime,
                    mtime,
                    ctime,
                    trashretention,
                    sclassid,
                    eattr,
                    winattr,
                    parents: Vec::new(),
                    data,
                },
            );
        }
        if !self.nodes.contains_key(&ROOT_INODE) {
            bail!("image has no root inode");
        }
        Ok(())
    }

    pub fn load_edges(&mut self, data: &[u8], ignoreflag: bool) -> Result<()> {
        let mut c = Cursor::new(data);
        loop {
            let parent = c.get_u32()?;
            let inode = c.get_u32()?;
            if parent == 0 && inode == 0 {
                break;
            }
            let edgeid = c.get_u64()?;
            let nleng = c.get_u32()? as usize;
            let name = c.get_bytes(nleng)?.to_vec();
            match parent {
                0xFFFF_FFFF => {
                    self.trash.insert(inode, name);
                }
                0xFFFF_FFFE => {
                    self.sustained.insert(inode, name);
                }
                _ => {
                    if self.nodes.get(&inode).is_none() {
                        if ignoreflag {
                            log::warn!("edge to unknown inode {} (ignored)", inode);
                            continue;
                        }
                        bail!("edge to unknown inode {}", inode);
                    }
                    let dup = match self.nodes.get_mut(&parent).map(|n| &mut n.data) {
                        Some(NodeData::Dir { children }) => {
                            children.insert(name.clone(), DirEntry { inode, edgeid }).is_some()
                        }
                        _ => bail!("edge from non-directory {}", parent),
                    };
                    if dup {
                        bail!("duplicate edge name in directory {}", parent);
                    }
                    self.nodes.get_mut(&inode).unwrap().parents.push(parent);
                }
            }
        }
        Ok(())
    }

    pub fn load_free(&mut self, data: &[u8]) -> Result<()> {
        let mut c = Cursor::new(data);
        let cnt = c.get_u32()? as usize;
        self.freeinodes = (0..cnt).map(|_| c.get_u32()).collect::<Result<_>>()?;
        let cnt = c.get_u32()? as usize;
        self.pending_free.clear();
        for _ in 0..cnt {
            let id = c.get_u32()?;
            let ts = c.get_u32()?;
            self.pending_free.push((id, ts));
        }
        Ok(())
    }

    pub fn load_quota(&mut self, data: &[u8]) -> Result<()> {
        let mut c = Cursor::new(data);
        loop {
            let inode = c.get_u32()?;
            if inode == 0 {
                break;
            }
            let flags = c.get_u8()?;
            let exceeded = c.get_u8()? != 0;
            let stimestamp = c.get_u32()?;
            let sinodes = c.get_u32()?;
            let hinodes = c.get_u32()?;
            let slength = c.get_u64()?;
            let hlength = c.get_u64()?;
            let ssize = c.get_u64()?;
            let hsize = c.get_u64()?;
            let srealsize = c.get_u64()?;
            let hrealsize = c.get_u64()?;
            let timelimit = c.get_u32()?;
            self.quotas.insert(
                inode,
                QuotaEntry {
                    flags,
                    exceeded,
                    stimestamp,
                    sinodes,
                    hinodes,
                    slength,
                    hlength,
                    ssize,
                    hsize,
                    srealsize,
                    hrealsize,
                    timelimit,
                },
            );
        }
        Ok(())
    }

    pub fn load_xattr(&mut self, data: &[u8]) -> Result<()> {
        let mut c = Cursor::new(data);
        loop {
            let inode = c.get_u32()?;
            if inode == 0 {
                break;
            }
            let name = c.get_name()?.to_vec();
            let vleng = c.get_u32()? as usize;
            let value = c.get_bytes(vleng)?.to_vec();
            self.xattrs.entry(inode).or_default().insert(name, value);
        }
        Ok(())
    }

    pub fn load_acl(&mut self, data: &[u8]) -> Result<()> {
        let mut c = Cursor::new(data);
        loop {
            let inode = c.get_u32()?;
            if inode == 0 {
                break;
            }
            let acltype = c.get_u8()?;
            let leng = c.get_u32()? as usize;
            let data = c.get_bytes(leng)?.to_vec();
            self.acls.insert((inode, acltype), data);
        }
        Ok(())
    }

    /// Rebuild chunk back-references and storage-class refcounts after an
    /// image load.
    pub fn rebuild_references(&self, sclass: &mut SclassRegistry, chunks: &mut ChunkIndex) {
        for n in self.nodes.values() {
            sclass.incref(n.sclassid);
            if let NodeData::File { chunks: clist, .. } = &n.data {
                let goal = sclass.get(n.sclassid).map(|sc| sc.keep.copies()).unwrap_or(1);
                for (indx, &chunkid) in clist.iter().enumerate() {
                    if chunkid != 0 {
                        chunks.attach_ref(chunkid, n.id, indx as u32, goal);
                    }
                }
            }
        }
        debug!("references rebuilt for {} nodes", self.nodes.len());
    }

    /// Cross-check the invariants a loaded image must satisfy.
    pub fn verify(&self) -> Result<()> {
        for n in self.nodes.values() {
            for &p in &n.parents {
                let children = match self.nodes.get(&p).map(|pn| &pn.data) {
                    Some(NodeData::Dir { children }) => children,
                    _ => bail!("inode {} has non-directory parent {}", n.id, p),
                };
                if !children.values().any(|e| e.inode == n.id) {
                    bail!("inode {} missing from parent {} edge set", n.id, p);
                }
            }
            if let NodeData::Dir { children } = &n.data {
                for e in children.values() {
                    let child = self
                        .nodes
                        .get(&e.inode)
                        .ok_or_else(|| anyhow::anyhow!("dangling edge to {}", e.inode))?;
                    if !child.parents.contains(&n.id) {
                        bail!("child {} does not list parent {}", e.inode, n.id);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct World {
        tree: FsTree,
        sclass: SclassRegistry,
        patterns: PatternTable,
        chunks: ChunkIndex,
        cl: Changelog,
    }

    fn world() -> World {
        World {
            tree: FsTree::new(1000),
            sclass: SclassRegistry::new(),
            patterns: PatternTable::new(),
            chunks: ChunkIndex::new(),
            cl: Changelog::memory(),
        }
    }

    impl World {
        fn mkdir(&mut self, parent: u32, name: &[u8]) -> u32 {
            self.tree
                .create(&mut self.cl, 1000, &mut self.sclass, &self.patterns, parent, name,
                        NodeType::Directory, 0o755, 0o022, 0, &[0], 0)
                .unwrap()
        }

        fn mkfile(&mut self, parent: u32, name: &[u8]) -> u32 {
            self.tree
                .create(&mut self.cl, 1000, &mut self.sclass, &self.patterns, parent, name,
                        NodeType::File, 0o644, 0o022, 0, &[0], 0)
                .unwrap()
        }
    }

    #[test]
    fn create_write_close_scenario() {
        // mkdir /a, mkdir /a/b, create /a/b/c, write, close
        let mut w = world();
        let a = w.mkdir(ROOT_INODE, b"a");
        let b = w.mkdir(a, b"b");
        let c = w.mkfile(b, b"c");
        let (chunkid, version) =
            w.tree.write_chunk(&mut w.cl, 1000, &w.sclass, &mut w.chunks, c, 0).unwrap();
        assert_eq!(version, 1);
        let woken = w
            .tree
            .write_chunk_end(&mut w.cl, 1000, &mut w.chunks, chunkid, c, 10)
            .unwrap();
        assert!(woken.is_empty());
        assert_eq!(w.tree.node(c).unwrap().length(), 10);
        assert_eq!(w.chunks.get(chunkid).unwrap().version, 1);
        let journal: Vec<&str> = w.cl.recorded().iter().map(|s| s.as_str()).collect();
        assert_eq!(journal.iter().filter(|l| l.contains("|CREATE(")).count(), 3);
        assert_eq!(journal.iter().filter(|l| l.contains("|WRITE(")).count(), 1);
        assert!(journal.iter().any(|l| l.contains("|LENGTH(") && l.contains(",10,")));
        assert!(journal.iter().any(|l| l.contains("|UNLOCK(")));
        // every line advanced the version by exactly one
        assert_eq!(w.cl.version(), 1 + journal.len() as u64);
    }

    #[test]
    fn edge_names_are_unique() {
        let mut w = world();
        w.mkfile(ROOT_INODE, b"x");
        let err = w
            .tree
            .create(&mut w.cl, 1000, &mut w.sclass, &w.patterns, ROOT_INODE, b"x",
                    NodeType::File, 0o644, 0, 0, &[0], 0)
            .unwrap_err();
        assert_eq!(err, MfsStatus::EExist);
    }

    #[test]
    fn link_accounting() {
        let mut w = world();
        let f = w.mkfile(ROOT_INODE, b"f");
        assert_eq!(w.tree.nlink(f), 1);
        w.tree.link(&mut w.cl, 1000, f, ROOT_INODE, b"g").unwrap();
        assert_eq!(w.tree.nlink(f), 2);
        // unlink one name: the inode persists with nlink 1, no reclaim
        let inode =
            w.tree.unlink(&mut w.cl, 1000, &mut w.sclass, &mut w.chunks, ROOT_INODE, b"f", |_| false).unwrap();
        assert_eq!(inode, f);
        assert_eq!(w.tree.nlink(f), 1);
        assert!(w.tree.node(f).is_some());
        assert!(w.cl.recorded().iter().any(|l| l.contains("|UNLINK(1,f):")));
        assert!(!w.cl.recorded().iter().any(|l| l.contains("FREEINODES")));
    }

    #[test]
    fn unlink_with_retention_moves_to_trash() {
        let mut w = world();
        let f = w.mkfile(ROOT_INODE, b"doomed");
        w.tree.settrashretention(&mut w.cl, 1000, f, 0, 24, SMODE_SET).unwrap();
        w.tree.unlink(&mut w.cl, 1001, &mut w.sclass, &mut w.chunks, ROOT_INODE, b"doomed", |_| false).unwrap();
        assert_eq!(w.tree.node(f).unwrap().ntype, NodeType::Trash);
        assert_eq!(w.tree.trash_path(f).unwrap(), b"/doomed");
        // undelete brings it back
        w.tree.undel(&mut w.cl, 1002, &mut w.sclass, f).unwrap();
        assert_eq!(w.tree.node(f).unwrap().ntype, NodeType::File);
        assert_eq!(w.tree.lookup(ROOT_INODE, b"doomed").unwrap(), f);
    }

    #[test]
    fn undel_recreates_missing_directories() {
        let mut w = world();
        let a = w.mkdir(ROOT_INODE, b"a");
        let f = w.mkfile(a, b"f");
        w.tree.settrashretention(&mut w.cl, 1000, f, 0, 24, SMODE_SET).unwrap();
        w.tree.unlink(&mut w.cl, 1001, &mut w.sclass, &mut w.chunks, a, b"f", |_| false).unwrap();
        w.tree.rmdir(&mut w.cl, 1002, &mut w.sclass, &mut w.chunks, ROOT_INODE, b"a").unwrap();
        w.tree.undel(&mut w.cl, 1003, &mut w.sclass, f).unwrap();
        let a2 = w.tree.lookup(ROOT_INODE, b"a").unwrap();
        assert_eq!(w.tree.lookup(a2, b"f").unwrap(), f);
    }

    #[test]
    fn open_unlinked_file_is_sustained() {
        let mut w = world();
        let f = w.mkfile(ROOT_INODE, b"held");
        w.tree.unlink(&mut w.cl, 1000, &mut w.sclass, &mut w.chunks, ROOT_INODE, b"held", |_| true).unwrap();
        assert_eq!(w.tree.node(f).unwrap().ntype, NodeType::Sustained);
        // once closed, the sustained sweep destroys it
        let freed = w.tree.emptysustained(&mut w.cl, 2000, &mut w.sclass, &mut w.chunks, |_| false);
        assert_eq!(freed, 1);
        assert!(w.tree.node(f).is_none());
    }

    #[test]
    fn trash_expiry_honors_retention() {
        let mut w = world();
        let f = w.mkfile(ROOT_INODE, b"t");
        w.tree.settrashretention(&mut w.cl, 1000, f, 0, 1, SMODE_SET).unwrap();
        w.tree.unlink(&mut w.cl, 1000, &mut w.sclass, &mut w.chunks, ROOT_INODE, b"t", |_| false).unwrap();
        let (freed, _) = w.tree.emptytrash(&mut w.cl, 1000 + 3599, &mut w.sclass, &mut w.chunks, |_| false);
        assert_eq!(freed, 0);
        let (freed, _) = w.tree.emptytrash(&mut w.cl, 1000 + 3600, &mut w.sclass, &mut w.chunks, |_| false);
        assert_eq!(freed, 1);
        assert!(w.tree.node(f).is_none());
    }

    #[test]
    fn rename_replaces_and_reattaches() {
        let mut w = world();
        let a = w.mkdir(ROOT_INODE, b"a");
        let f = w.mkfile(ROOT_INODE, b"f");
        let g = w.mkfile(a, b"g");
        let inode = w
            .tree
            .rename(&mut w.cl, 1000, &mut w.sclass, &mut w.chunks, ROOT_INODE, b"f", a, b"g", |_| false)
            .unwrap();
        assert_eq!(inode, f);
        assert!(w.tree.node(g).is_none()); // replaced target destroyed
        assert_eq!(w.tree.lookup(a, b"g").unwrap(), f);
        assert!(w.tree.lookup(ROOT_INODE, b"f").is_err());
    }

    #[test]
    fn rename_into_own_subtree_rejected() {
        let mut w = world();
        let a = w.mkdir(ROOT_INODE, b"a");
        let b = w.mkdir(a, b"b");
        let err = w
            .tree
            .rename(&mut w.cl, 1000, &mut w.sclass, &mut w.chunks, ROOT_INODE, b"a", b, b"a2", |_| false)
            .unwrap_err();
        assert_eq!(err, MfsStatus::EInval);
    }

    #[test]
    fn readdir_cursor_is_the_edge_id() {
        let mut w = world();
        w.mkfile(ROOT_INODE, b"one");
        w.mkfile(ROOT_INODE, b"two");
        w.mkfile(ROOT_INODE, b"three");
        let first = w.tree.readdir(ROOT_INODE, 0, 2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].1, b"one".to_vec());
        assert_eq!(first[1].1, b"two".to_vec());
        let rest = w.tree.readdir(ROOT_INODE, first[1].0, 10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].1, b"three".to_vec());
    }

    #[test]
    fn quota_blocks_create() {
        let mut w = world();
        let d = w.mkdir(ROOT_INODE, b"limited");
        let q = QuotaEntry { flags: QUOTA_FLAG_HINODES, hinodes: 2, ..Default::default() };
        w.tree.quota_set(&mut w.cl, 1000, d, q).unwrap();
        w.mkfile(d, b"one"); // dir itself + one file = 2
        let err = w
            .tree
            .create(&mut w.cl, 1000, &mut w.sclass, &w.patterns, d, b"two",
                    NodeType::File, 0o644, 0, 0, &[0], 0)
            .unwrap_err();
        assert_eq!(err, MfsStatus::Quota);
    }

    #[test]
    fn pattern_overrides_on_create() {
        let mut w = world();
        let mut sc = crate::rmfs_lib::sclass::StorageClass::simple_goal(2, b"video");
        sc.name = b"video".to_vec();
        let scid = w.sclass.create(&mut w.cl, 0, sc).unwrap();
        w.patterns.add(
            &mut w.cl,
            0,
            crate::rmfs_lib::patterns::Pattern {
                gname: b"*.mp4".to_vec(),
                euid: PATTERN_EUGID_ANY,
                egid: PATTERN_EUGID_ANY,
                priority: 1,
                omask: PATTERN_OMASK_SCLASS | PATTERN_OMASK_TRASHRETENTION,
                scid,
                trashretention: 48,
                seteattr: 0,
                clreattr: 0,
            },
        );
        let f = w.mkfile(ROOT_INODE, b"clip.mp4");
        let n = w.tree.node(f).unwrap();
        assert_eq!(n.sclassid, scid);
        assert_eq!(n.trashretention, 48);
        let g = w.mkfile(ROOT_INODE, b"notes.txt");
        assert_eq!(w.tree.node(g).unwrap().sclassid, 1);
    }

    #[test]
    fn setsclass_moves_refcounts() {
        let mut w = world();
        let f = w.mkfile(ROOT_INODE, b"f");
        assert_eq!(w.sclass.refs(1), 1);
        let (ci, _, _) = w
            .tree
            .setsclass(&mut w.cl, 1000, &mut w.sclass, &mut w.chunks, f, 0, 1, 3, SMODE_SET)
            .unwrap();
        assert_eq!(ci, 1);
        assert_eq!(w.sclass.refs(1), 0);
        assert_eq!(w.sclass.refs(3), 1);
        assert_eq!(w.tree.node(f).unwrap().sclassid, 3);
    }

    #[test]
    fn attr_record_sizes() {
        let w = {
            let mut w = world();
            w.mkfile(ROOT_INODE, b"f");
            w
        };
        let f = w.tree.lookup(ROOT_INODE, b"f").unwrap();
        let n = w.tree.node(f).unwrap();
        assert_eq!(n.fill_attr(w.tree.nlink(f), false).len(), 35);
        assert_eq!(n.fill_attr(w.tree.nlink(f), true).len(), 36);
        let attr = n.fill_attr(w.tree.nlink(f), true);
        // type nibble for a regular file is 0x8
        assert_eq!(attr[1] >> 4, 0x8);
    }

    #[test]
    fn store_load_roundtrip() -> Result<()> {
        let mut w = world();
        let a = w.mkdir(ROOT_INODE, b"a");
        let f = w.mkfile(a, b"data.bin");
        w.tree.write_chunk(&mut w.cl, 1000, &w.sclass, &mut w.chunks, f, 0).unwrap();
        w.tree.set_length(&mut w.cl, 1000, &mut w.chunks, f, 1234, true).unwrap();
        w.tree.setxattr(&mut w.cl, 1000, f, b"user.tag", b"v", 0).unwrap();
        w.tree.setacl(&mut w.cl, 1000, f, 0, b"acldata").unwrap();
        let q = QuotaEntry { flags: QUOTA_FLAG_HLENGTH, hlength: 1 << 30, ..Default::default() };
        w.tree.quota_set(&mut w.cl, 1000, a, q).unwrap();
        let t = w.mkfile(ROOT_INODE, b"gone");
        w.tree.settrashretention(&mut w.cl, 1000, t, 0, 24, SMODE_SET).unwrap();
        w.tree.unlink(&mut w.cl, 1000, &mut w.sclass, &mut w.chunks, ROOT_INODE, b"gone", |_| false).unwrap();

        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        let mut free = Vec::new();
        let mut quota = Vec::new();
        let mut xattr = Vec::new();
        let mut acl = Vec::new();
        w.tree.store_nodes(&mut nodes)?;
        w.tree.store_edges(&mut edges)?;
        w.tree.store_free(&mut free)?;
        w.tree.store_quota(&mut quota)?;
        w.tree.store_xattr(&mut xattr)?;
        w.tree.store_acl(&mut acl)?;

        let mut tree2 = FsTree::new(0);
        tree2.load_nodes(&nodes)?;
        tree2.load_edges(&edges, false)?;
        tree2.load_free(&free)?;
        tree2.load_quota(&quota)?;
        tree2.load_xattr(&xattr)?;
        tree2.load_acl(&acl)?;
        tree2.verify()?;

        assert_eq!(tree2.lookup(ROOT_INODE, b"a").unwrap(), a);
        assert_eq!(tree2.lookup(a, b"data.bin").unwrap(), f);
        assert_eq!(tree2.node(f).unwrap().length(), 1234);
        assert_eq!(tree2.getxattr(f, b"user.tag").unwrap(), b"v");
        assert_eq!(tree2.getacl(f, 0), Some(&b"acldata"[..]));
        assert_eq!(tree2.quota_get(a).unwrap().hlength, 1 << 30);
        assert_eq!(tree2.trash_path(t).unwrap(), b"/gone");
        assert_eq!(tree2.nlink(f), 1);
        Ok(())
    }

    #[test]
    fn replay_reproduces_create_unlink() {
        let mut w = world();
        let mut sclass2 = SclassRegistry::new();
        let mut chunks2 = ChunkIndex::new();
        let mut tree2 = FsTree::new(1000);
        let f = w.mkfile(ROOT_INODE, b"f");
        assert_eq!(
            tree2.mr_create(1000, &mut sclass2, ROOT_INODE, b"f", u8::from(NodeType::File),
                            0o644, 0o022, 0, 0, 0, f),
            MfsStatus::Ok
        );
        assert_eq!(tree2.lookup(ROOT_INODE, b"f").unwrap(), f);
        // a replayed create with the wrong expected inode is a mismatch
        let mut tree3 = FsTree::new(1000);
        assert_eq!(
            tree3.mr_create(1000, &mut sclass2, ROOT_INODE, b"f", u8::from(NodeType::File),
                            0o644, 0o022, 0, 0, 0, 999),
            MfsStatus::Mismatch
        );
        assert_eq!(
            tree2.mr_unlink(1001, &mut sclass2, &mut chunks2, |_| false, ROOT_INODE, b"f", f),
            MfsStatus::Ok
        );
        assert!(tree2.lookup(ROOT_INODE, b"f").is_err());
    }
}
