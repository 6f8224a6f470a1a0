//! Metadata image: point-in-time dump of the whole metadata state.
//!
//! Layout: 8-byte magic `RMFSM2.0`-style header (`MFSM 2.0`), a 16-byte
//! (meta version, metadata id) pair, then sections. Each section starts
//! with an 8-byte ASCII header naming the tag and its minor version
//! (`NODE 1.0`) followed by a big-endian u64 body length. The image ends
//! with the 16-byte `[MFS EOF MARKER]`. Writing goes to a temporary name
//! followed by an atomic rename and a directory fsync; a corrupted image
//! aborts loading unless the operator passes the ignore flag.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{info, warn};

use crate::rmfs_lib::chunks::ChunkIndex;
use crate::rmfs_lib::flocks::{FlockSchedMode, FlockTable};
use crate::rmfs_lib::fsnodes::FsTree;
use crate::rmfs_lib::openfiles::OpenFiles;
use crate::rmfs_lib::patterns::PatternTable;
use crate::rmfs_lib::plocks::PosixLockTable;
use crate::rmfs_lib::sclass::SclassRegistry;
use crate::rmfs_lib::sessions::SessionTable;

pub const IMAGE_MAGIC: &[u8; 8] = b"MFSM 2.0";
pub const EOF_MARKER: &[u8; 16] = b"[MFS EOF MARKER]";
pub const IMAGE_NAME: &str = "metadata.mfs";
pub const IMAGE_TMP_NAME: &str = "metadata.mfs.tmp";

const SECTION_MINOR: u8 = 0x10;

fn section_header(tag: &[u8; 4], mver: u8) -> [u8; 8] {
    // "TAGx 1.0" shape: major in byte 5, minor in byte 7
    [
        tag[0],
        tag[1],
        tag[2],
        tag[3],
        b' ',
        b'0' + (mver >> 4),
        b'.',
        b'0' + (mver & 0xF),
    ]
}

fn write_section(w: &mut impl Write, tag: &[u8; 4], body: &[u8]) -> Result<()> {
    w.write_all(&section_header(tag, SECTION_MINOR))?;
    w.write_all(&(body.len() as u64).to_be_bytes())?;
    w.write_all(body)?;
    Ok(())
}

/// Everything an image holds, in loadable form.
pub struct LoadedImage {
    pub metaversion: u64,
    pub metaid: u64,
    pub tree: FsTree,
    pub sclass: SclassRegistry,
    pub patterns: PatternTable,
    pub sessions: SessionTable,
    pub openfiles: OpenFiles,
    pub flocks: FlockTable,
    pub plocks: PosixLockTable,
    pub chunks: ChunkIndex,
}

#[allow(clippy::too_many_arguments)]
pub fn store_image(
    dir: &Path,
    metaversion: u64,
    metaid: u64,
    tree: &FsTree,
    sclass: &SclassRegistry,
    patterns: &PatternTable,
    sessions: &SessionTable,
    openfiles: &OpenFiles,
    flocks: &FlockTable,
    plocks: &PosixLockTable,
    chunks: &ChunkIndex,
) -> Result<()> {
    let tmp = dir.join(IMAGE_TMP_NAME);
    let fin = dir.join(IMAGE_NAME);
    let file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
    let mut w = BufWriter::new(file);

    w.write_all(IMAGE_MAGIC)?;
    w.write_all(&metaversion.to_be_bytes())?;
    w.write_all(&metaid.to_be_bytes())?;

    let mut body = Vec::new();
    sessions.store(&mut body)?;
    write_section(&mut w, b"SESS", &body)?;
    body.clear();
    sclass.store(&mut body)?;
    write_section(&mut w, b"SCLA", &body)?;
    body.clear();
    tree.store_nodes(&mut body)?;
    write_section(&mut w, b"NODE", &body)?;
    body.clear();
    tree.store_edges(&mut body)?;
    write_section(&mut w, b"EDGE", &body)?;
    body.clear();
    tree.store_free(&mut body)?;
    write_section(&mut w, b"FREE", &body)?;
    body.clear();
    tree.store_quota(&mut body)?;
    write_section(&mut w, b"QUOT", &body)?;
    body.clear();
    tree.store_xattr(&mut body)?;
    write_section(&mut w, b"XATR", &body)?;
    body.clear();
    tree.store_acl(&mut body)?;
    write_section(&mut w, b"PACL", &body)?;
    body.clear();
    openfiles.store(&mut body)?;
    write_section(&mut w, b"OPEN", &body)?;
    body.clear();
    flocks.store(&mut body)?;
    write_section(&mut w, b"FLCK", &body)?;
    body.clear();
    plocks.store(&mut body)?;
    write_section(&mut w, b"PLCK", &body)?;
    body.clear();
    chunks.store(&mut body)?;
    write_section(&mut w, b"CHNK", &body)?;
    body.clear();
    patterns.store(&mut body)?;
    write_section(&mut w, b"PATT", &body)?;

    w.write_all(EOF_MARKER)?;
    let file = w.into_inner()?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, &fin)?;
    // the rename itself must be durable
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
    info!("metadata image stored (version {})", metaversion);
    Ok(())
}

pub fn load_image(
    dir: &Path,
    flock_mode: FlockSchedMode,
    sustain_time: u32,
    ignoreflag: bool,
) -> Result<LoadedImage> {
    let path = dir.join(IMAGE_NAME);
    let file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
    let mut r = BufReader::new(file);

    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if &magic != IMAGE_MAGIC {
        bail!("{}: not a metadata image", path.display());
    }
    let mut head = [0u8; 16];
    r.read_exact(&mut head)?;
    let metaversion = u64::from_be_bytes(head[0..8].try_into().unwrap());
    let metaid = u64::from_be_bytes(head[8..16].try_into().unwrap());

    let mut sections: HashMap<[u8; 4], Vec<u8>> = HashMap::new();
    loop {
        let mut hdr = [0u8; 16];
        r.read_exact(&mut hdr)?;
        if &hdr == EOF_MARKER {
            break;
        }
        let tag: [u8; 4] = hdr[0..4].try_into().unwrap();
        if !tag.iter().all(|c| c.is_ascii_uppercase()) {
            bail!("{}: corrupted section header", path.display());
        }
        let mver = (((hdr[5] - b'0') & 0xF) << 4) + (hdr[7] & 0xF);
        let leng = u64::from_be_bytes(hdr[8..16].try_into().unwrap());
        let mut body = vec![0u8; leng as usize];
        r.read_exact(&mut body)?;
        if mver != SECTION_MINOR {
            if ignoreflag {
                warn!(
                    "section {} has unsupported version 0x{:02X} (ignored)",
                    String::from_utf8_lossy(&tag),
                    mver
                );
                continue;
            }
            bail!("section {} has unsupported version 0x{:02X}", String::from_utf8_lossy(&tag), mver);
        }
        sections.insert(tag, body);
    }

    let take = |sections: &mut HashMap<[u8; 4], Vec<u8>>, tag: &[u8; 4]| -> Result<Vec<u8>> {
        match sections.remove(tag) {
            Some(b) => Ok(b),
            None => bail!("missing section {}", String::from_utf8_lossy(tag)),
        }
    };

    let sessions = SessionTable::load(&take(&mut sections, b"SESS")?, sustain_time)?;
    let mut sclass = SclassRegistry::load(&take(&mut sections, b"SCLA")?)?;
    let mut tree = FsTree::new(0);
    tree.load_nodes(&take(&mut sections, b"NODE")?)?;
    tree.load_edges(&take(&mut sections, b"EDGE")?, ignoreflag)?;
    tree.load_free(&take(&mut sections, b"FREE")?)?;
    tree.load_quota(&take(&mut sections, b"QUOT")?)?;
    tree.load_xattr(&take(&mut sections, b"XATR")?)?;
    tree.load_acl(&take(&mut sections, b"PACL")?)?;
    tree.verify()?;
    let openfiles =
        OpenFiles::load(&take(&mut sections, b"OPEN")?, |sid| sessions.find(sid).is_some())?;
    let mut flocks = FlockTable::new(flock_mode);
    flocks.load(&take(&mut sections, b"FLCK")?, ignoreflag, |sid, ino| openfiles.checknode(sid, ino))?;
    let mut plocks = PosixLockTable::new();
    plocks.load(&take(&mut sections, b"PLCK")?, ignoreflag, |sid, ino| openfiles.checknode(sid, ino))?;
    let mut chunks = ChunkIndex::load(&take(&mut sections, b"CHNK")?)?;
    let patterns = PatternTable::load(&take(&mut sections, b"PATT")?)?;

    tree.rebuild_references(&mut sclass, &mut chunks);
    info!("metadata image loaded (version {})", metaversion);
    Ok(LoadedImage {
        metaversion,
        metaid,
        tree,
        sclass,
        patterns,
        sessions,
        openfiles,
        flocks,
        plocks,
        chunks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rmfs_lib::changelog::Changelog;
    use crate::rmfs_lib::sessions::NewSessionParams;
    use crate::rmfs_lib::types::*;
    use std::path::PathBuf;

    fn testdir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rmfs_image_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn image_roundtrip() -> Result<()> {
        let dir = testdir("roundtrip");
        let mut cl = Changelog::memory();
        let mut tree = FsTree::new(1000);
        let mut sclass = SclassRegistry::new();
        let patterns = PatternTable::new();
        let mut sessions = SessionTable::new(3600);
        let mut openfiles = OpenFiles::new();
        let mut flocks = FlockTable::new(FlockSchedMode::Correct);
        let plocks = PosixLockTable::new();
        let mut chunks = ChunkIndex::new();

        let d = tree
            .create(&mut cl, 1000, &mut sclass, &patterns, ROOT_INODE, b"dir",
                    NodeType::Directory, 0o755, 0, 0, &[0], 0)
            .unwrap();
        let f = tree
            .create(&mut cl, 1000, &mut sclass, &patterns, d, b"file",
                    NodeType::File, 0o644, 0, 0, &[0], 0)
            .unwrap();
        tree.write_chunk(&mut cl, 1000, &sclass, &mut chunks, f, 0).unwrap();
        let sid = sessions.new_session(&mut cl, 1000, NewSessionParams::default());
        openfiles.open_file(&mut cl, 1000, sid, f);
        flocks.cmd(&mut cl, 1000, sid, 1, 1, f, 77, FLOCK_LOCK_SHARED, true);

        store_image(&dir, cl.version(), 0xABCD, &tree, &sclass, &patterns, &sessions,
                    &openfiles, &flocks, &plocks, &chunks)?;
        let img = load_image(&dir, FlockSchedMode::Correct, 3600, false)?;
        assert_eq!(img.metaversion, cl.version());
        assert_eq!(img.metaid, 0xABCD);
        assert_eq!(img.tree.lookup(ROOT_INODE, b"dir").unwrap(), d);
        assert_eq!(img.tree.lookup(d, b"file").unwrap(), f);
        assert!(img.openfiles.checknode(sid, f));
        assert_eq!(img.flocks.list(f).len(), 1);
        assert_eq!(img.chunks.count(), 1);
        // back-references were rebuilt: deleting the file drops the chunk
        assert_eq!(img.chunks.get(1).unwrap().refs(), &[(f, 0)]);
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn truncated_image_is_rejected() -> Result<()> {
        let dir = testdir("truncated");
        let cl = Changelog::memory();
        let tree = FsTree::new(1000);
        let sclass = SclassRegistry::new();
        let patterns = PatternTable::new();
        let sessions = SessionTable::new(3600);
        let openfiles = OpenFiles::new();
        let flocks = FlockTable::new(FlockSchedMode::Correct);
        let plocks = PosixLockTable::new();
        let chunks = ChunkIndex::new();
        store_image(&dir, cl.version(), 1, &tree, &sclass, &patterns, &sessions,
                    &openfiles, &flocks, &plocks, &chunks)?;
        let path = dir.join(IMAGE_NAME);
        let data = std::fs::read(&path)?;
        std::fs::write(&path, &data[..data.len() - 20])?;
        assert!(load_image(&dir, FlockSchedMode::Correct, 3600, false).is_err());
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn bad_magic_is_rejected() -> Result<()> {
        let dir = testdir("magic");
        std::fs::write(dir.join(IMAGE_NAME), b"NOTANIMAGE______")?;
        assert!(load_image(&dir, FlockSchedMode::Correct, 3600, false).is_err());
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
