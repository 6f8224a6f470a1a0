/// Master metadata server logics
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::*;

pub mod changelog;
pub mod chunks;
pub mod codec;
pub mod flocks;
pub mod fsnodes;
pub mod image;
pub mod labels;
pub mod matoclserv;
pub mod openfiles;
pub mod patterns;
pub mod plocks;
pub mod restore;
pub mod sclass;
pub mod sessions;
pub mod types;

use changelog::Changelog;
use chunks::ChunkIndex;
use flocks::{FlockSchedMode, FlockTable, LockWakeUp};
use fsnodes::FsTree;
use openfiles::OpenFiles;
use patterns::PatternTable;
use plocks::PosixLockTable;
use sclass::SclassRegistry;
use sessions::SessionTable;

/// The single-writer metadata service: every subsystem of the master
/// lives here and all mutation happens through one `&mut Master` at a
/// time. No internal locking, matching the one-event-loop process model.
pub struct Master {
    pub tree: FsTree,
    pub sclass: SclassRegistry,
    pub patterns: PatternTable,
    pub sessions: SessionTable,
    pub openfiles: OpenFiles,
    pub flocks: FlockTable,
    pub plocks: PosixLockTable,
    pub chunks: ChunkIndex,
    pub chlog: Changelog,
    pub metaid: u64,
    /// Mount password; registration digests verify against it when set.
    pub auth_secret: Option<Vec<u8>>,
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct MasterOptions {
    pub data_dir: Option<PathBuf>,
    pub flock_mode: FlockSchedMode,
    pub session_sustain_time: u32,
    pub ignore_load_errors: bool,
    pub auth_secret: Option<Vec<u8>>,
}

impl Default for MasterOptions {
    fn default() -> Self {
        MasterOptions {
            data_dir: None,
            flock_mode: FlockSchedMode::Correct,
            session_sustain_time: sessions::SESSION_SUSTAIN_DEFAULT,
            ignore_load_errors: false,
            auth_secret: None,
        }
    }
}

impl Master {
    /// Fresh metadata: an empty tree with only the root inode.
    pub fn new(ts: u32, metaid: u64, opts: &MasterOptions) -> Result<Master> {
        let chlog = match &opts.data_dir {
            Some(dir) => Changelog::open(dir.clone())?,
            None => Changelog::memory(),
        };
        Ok(Master {
            tree: FsTree::new(ts),
            sclass: SclassRegistry::new(),
            patterns: PatternTable::new(),
            sessions: SessionTable::new(opts.session_sustain_time),
            openfiles: OpenFiles::new(),
            flocks: FlockTable::new(opts.flock_mode),
            plocks: PosixLockTable::new(),
            chunks: ChunkIndex::new(),
            chlog,
            metaid,
            auth_secret: opts.auth_secret.clone(),
            data_dir: opts.data_dir.clone(),
        })
    }

    /// Start-up path: load the newest image, then replay every changelog
    /// carrying versions beyond it.
    pub fn load(opts: &MasterOptions) -> Result<Master> {
        let dir = opts
            .data_dir
            .clone()
            .context("metadata load needs a data directory")?;
        let img = image::load_image(
            &dir,
            opts.flock_mode,
            opts.session_sustain_time,
            opts.ignore_load_errors,
        )?;
        let mut chlog = Changelog::open(dir.clone())?;
        chlog.set_version(img.metaversion);
        let mut master = Master {
            tree: img.tree,
            sclass: img.sclass,
            patterns: img.patterns,
            sessions: img.sessions,
            openfiles: img.openfiles,
            flocks: img.flocks,
            plocks: img.plocks,
            chunks: img.chunks,
            chlog,
            metaid: img.metaid,
            auth_secret: opts.auth_secret.clone(),
            data_dir: Some(dir.clone()),
        };
        // oldest rotation first, changelog.0.mfs last
        let mut logs: Vec<(u32, PathBuf)> = std::fs::read_dir(&dir)?
            .flatten()
            .filter_map(|de| {
                let name = de.file_name().to_string_lossy().into_owned();
                let n = name.strip_prefix("changelog.")?.strip_suffix(".mfs")?.parse::<u32>().ok()?;
                Some((n, de.path()))
            })
            .collect();
        logs.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, path) in logs {
            restore::restore_file(&mut master, &path)
                .with_context(|| format!("replaying {}", path.display()))?;
        }
        info!(
            "metadata ready: {} inodes, {} chunks, meta version {}",
            master.tree.node_count(),
            master.chunks.count(),
            master.chlog.version()
        );
        Ok(master)
    }

    /// Dump the metadata image and rotate the changelog.
    pub fn store_image(&mut self) -> Result<()> {
        let dir = self
            .data_dir
            .clone()
            .context("image store needs a data directory")?;
        image::store_image(
            &dir,
            self.chlog.version(),
            self.metaid,
            &self.tree,
            &self.sclass,
            &self.patterns,
            &self.sessions,
            &self.openfiles,
            &self.flocks,
            &self.plocks,
            &self.chunks,
        )?;
        self.chlog.rotate()?;
        Ok(())
    }

    /// Tear down every per-file state of a dying session: open files and
    /// both advisory lock kinds.
    pub fn session_cleanup(&mut self, ts: u32, sessionid: u32) {
        for (sid, inode) in self.openfiles.session_removed(sessionid) {
            self.flocks.file_closed(&mut self.chlog, ts, sid, inode);
            self.plocks.file_closed(&mut self.chlog, ts, sid, inode);
        }
    }

    /// Periodic housekeeping driven by the event loop once a second.
    /// Returns the chunk waiters whose 30 s window ran out; the dispatch
    /// layer answers them with their original blocking status.
    pub fn tick(&mut self, ts: u32) -> Vec<chunks::ChunkWaiter> {
        for sessionid in self.sessions.check_expired(&mut self.chlog, ts) {
            self.session_cleanup(ts, sessionid);
        }
        self.tree.quota_refresh(ts);
        if let Err(e) = self.chlog.maybe_rotate_hourly() {
            warn!("changelog rotation failed: {}", e);
        }
        self.chunks.expire_waiters(ts)
    }

    /// Hourly housekeeping: trash expiry, sustained sweep, inode reuse,
    /// session counters.
    pub fn hourly(&mut self, ts: u32) {
        let openfiles = std::mem::take(&mut self.openfiles);
        self.tree.emptytrash(&mut self.chlog, ts, &mut self.sclass, &mut self.chunks, |ino| {
            openfiles.is_file_open(ino)
        });
        self.tree.emptysustained(&mut self.chlog, ts, &mut self.sclass, &mut self.chunks, |ino| {
            openfiles.is_file_open(ino)
        });
        self.openfiles = openfiles;
        self.tree.freeinodes(&mut self.chlog, ts);
        self.sessions.stats_cycle();
    }

    /// Deferred lock replies produced since the last drain.
    pub fn take_lock_wakeups(&mut self) -> Vec<LockWakeUp> {
        let mut w = self.flocks.take_wakeups();
        w.extend(self.plocks.take_wakeups());
        w
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rmfs_lib::sessions::NewSessionParams;
    use crate::rmfs_lib::types::*;

    #[test]
    fn session_expiry_cascades_into_locks() {
        let mut m = Master::new(1000, 1, &MasterOptions {
            session_sustain_time: 60,
            ..Default::default()
        })
        .unwrap();
        let sid = m.sessions.new_session(&mut m.chlog, 1000, NewSessionParams::default());
        let f = m
            .tree
            .create(&mut m.chlog, 1000, &mut m.sclass, &m.patterns, ROOT_INODE, b"f",
                    NodeType::File, 0o644, 0, 0, &[0], 0)
            .unwrap();
        m.openfiles.open_file(&mut m.chlog, 1000, sid, f);
        m.flocks.cmd(&mut m.chlog, 1000, sid, 1, 1, f, 9, FLOCK_LOCK_EXCLUSIVE, true);
        assert_eq!(m.flocks.list(f).len(), 1);
        m.sessions.disconnect(&mut m.chlog, 1000, sid);
        m.tick(2000);
        assert!(m.sessions.find(sid).is_none());
        assert!(!m.openfiles.checknode(sid, f));
        assert!(m.flocks.list(f).is_empty());
    }

    #[test]
    fn hourly_sweep_runs_trash_lifecycle() {
        let mut m = Master::new(1000, 1, &MasterOptions::default()).unwrap();
        let f = m
            .tree
            .create(&mut m.chlog, 1000, &mut m.sclass, &m.patterns, ROOT_INODE, b"f",
                    NodeType::File, 0o644, 0, 0, &[0], 0)
            .unwrap();
        m.tree.settrashretention(&mut m.chlog, 1000, f, 0, 1, SMODE_SET).unwrap();
        m.tree
            .unlink(&mut m.chlog, 1000, &mut m.sclass, &mut m.chunks, ROOT_INODE, b"f", |_| false)
            .unwrap();
        m.hourly(1000 + 3600);
        assert!(m.tree.node(f).is_none());
    }
}
