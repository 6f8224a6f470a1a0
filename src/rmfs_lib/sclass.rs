//! Storage-class registry.
//!
//! Up to 255 named redundancy policies addressed by an 8-bit id. Ids 1..9
//! are reserved for the numeric "simple goal" classes kept for
//! compatibility with plain goal numbers. Every class owns four label
//! program sets (create, keep, arch, trash), archive control flags and a
//! minimum trash retention. Mutations are journaled and replayed through
//! the `mr_` entry points.

use std::io::Write;

use anyhow::{bail, Result};

use crate::rmfs_lib::changelog::{escape_name, Changelog};
use crate::rmfs_lib::codec::Cursor;
use crate::rmfs_lib::labels::{make_label_expr, parse_label_expr, LabelExpr, ParsedExpr};
use crate::rmfs_lib::types::*;

pub const MAX_SCLASS_ID: usize = 255;
pub const FIRST_FREE_SCLASS_ID: u8 = 10;

/// One label program set with its own uniqueness mask and labels mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SclassSet {
    pub labelexpr: Vec<LabelExpr>,
    pub uniqmask: u32,
    pub labels_mode: u8,
    pub ec_parts: u8,
}

impl Default for SclassSet {
    fn default() -> Self {
        SclassSet { labelexpr: Vec::new(), uniqmask: 0, labels_mode: LABELS_MODE_GLOBAL, ec_parts: 0 }
    }
}

impl SclassSet {
    pub fn from_parsed(pd: &ParsedExpr) -> SclassSet {
        SclassSet {
            labelexpr: pd.labelexpr.clone(),
            uniqmask: pd.uniqmask,
            labels_mode: pd.labels_mode,
            ec_parts: pd.ec_data_chksum_parts,
        }
    }

    pub fn to_parsed(&self) -> ParsedExpr {
        ParsedExpr {
            labelexpr: self.labelexpr.clone(),
            uniqmask: self.uniqmask,
            labels_mode: self.labels_mode,
            ec_data_chksum_parts: self.ec_parts,
        }
    }

    pub fn parse(expr: &[u8]) -> Result<SclassSet, MfsStatus> {
        Ok(SclassSet::from_parsed(&parse_label_expr(expr)?))
    }

    pub fn render(&self) -> String {
        make_label_expr(&self.to_parsed())
    }

    /// `copies` unconstrained copies; the shape of a numeric goal.
    pub fn simple(copies: u8) -> SclassSet {
        SclassSet {
            labelexpr: vec![crate::rmfs_lib::labels::EMPTY_EXPR; copies as usize],
            ..Default::default()
        }
    }

    pub fn copies(&self) -> u8 {
        self.labelexpr.len() as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageClass {
    pub name: Vec<u8>,
    pub admin_only: bool,
    pub export_group: u8,
    pub arch_mode: u8,
    pub arch_delay: u16,
    pub arch_min_size: u64,
    pub min_trashretention: u16,
    pub create: SclassSet,
    pub keep: SclassSet,
    pub arch: SclassSet,
    pub trash: SclassSet,
}

impl StorageClass {
    pub fn simple_goal(goal: u8, name: &[u8]) -> StorageClass {
        StorageClass {
            name: name.to_vec(),
            admin_only: false,
            export_group: 0,
            arch_mode: SCLASS_ARCH_MODE_CTIME,
            arch_delay: 0,
            arch_min_size: 0,
            min_trashretention: 0,
            create: SclassSet::simple(goal),
            keep: SclassSet::simple(goal),
            arch: SclassSet::simple(goal),
            trash: SclassSet::simple(goal),
        }
    }
}

pub struct SclassRegistry {
    classes: Vec<Option<StorageClass>>,
    refcount: Vec<u32>,
}

fn valid_name(name: &[u8]) -> bool {
    !name.is_empty() && name.len() <= MAX_NAME_LENG && !name.contains(&0)
}

impl SclassRegistry {
    pub fn new() -> SclassRegistry {
        let mut reg = SclassRegistry {
            classes: (0..=MAX_SCLASS_ID).map(|_| None).collect(),
            refcount: vec![0; MAX_SCLASS_ID + 1],
        };
        for goal in 1..=9u8 {
            reg.classes[goal as usize] =
                Some(StorageClass::simple_goal(goal, format!("{}", goal).as_bytes()));
        }
        reg
    }

    pub fn get(&self, id: u8) -> Option<&StorageClass> {
        self.classes[id as usize].as_ref()
    }

    pub fn find_by_name(&self, name: &[u8]) -> Option<u8> {
        (1..=MAX_SCLASS_ID as u8).find(|&id| {
            self.classes[id as usize].as_ref().map(|sc| sc.name.as_slice()) == Some(name)
        })
    }

    pub fn get_name(&self, id: u8) -> &[u8] {
        self.get(id).map(|sc| sc.name.as_slice()).unwrap_or(b"")
    }

    pub fn incref(&mut self, id: u8) {
        self.refcount[id as usize] += 1;
    }

    pub fn decref(&mut self, id: u8) {
        debug_assert!(self.refcount[id as usize] > 0);
        self.refcount[id as usize] = self.refcount[id as usize].saturating_sub(1);
    }

    pub fn refs(&self, id: u8) -> u32 {
        self.refcount[id as usize]
    }

    fn first_free_id(&self) -> Option<u8> {
        (FIRST_FREE_SCLASS_ID..=MAX_SCLASS_ID as u8)
            .find(|&id| self.classes[id as usize].is_none())
    }

    fn journal_set(&self, chlog: &mut Changelog, ts: u32, id: u8, newflag: u8) {
        let sc = self.get(id).unwrap();
        chlog.append(&format!(
            "{}|SCSET({},{},{},{},{},{},{},{},{},{},{},{}):{}",
            ts,
            escape_name(&sc.name),
            newflag,
            sc.admin_only as u8,
            sc.export_group,
            sc.arch_mode,
            sc.arch_delay,
            sc.arch_min_size,
            sc.min_trashretention,
            escape_name(sc.create.render().as_bytes()),
            escape_name(sc.keep.render().as_bytes()),
            escape_name(sc.arch.render().as_bytes()),
            escape_name(sc.trash.render().as_bytes()),
            id
        ));
    }

    fn insert(&mut self, sc: StorageClass) -> Result<u8, MfsStatus> {
        if !valid_name(&sc.name) || sc.keep.copies() == 0 {
            return Err(MfsStatus::EInval);
        }
        if self.find_by_name(&sc.name).is_some() {
            return Err(MfsStatus::ClassExists);
        }
        let id = self.first_free_id().ok_or(MfsStatus::ClassLimitReached)?;
        self.classes[id as usize] = Some(sc);
        Ok(id)
    }

    pub fn create(&mut self, chlog: &mut Changelog, ts: u32, sc: StorageClass) -> Result<u8, MfsStatus> {
        let id = self.insert(sc)?;
        self.journal_set(chlog, ts, id, 1);
        Ok(id)
    }

    /// Apply the fields selected by `chgmask` from `newsc` onto the class
    /// named `name`; the whole resulting record is journaled.
    pub fn change(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        name: &[u8],
        chgmask: u16,
        newsc: &StorageClass,
    ) -> Result<u8, MfsStatus> {
        let id = self.find_by_name(name).ok_or(MfsStatus::NoSuchClass)?;
        if chgmask & SCLASS_CHG_KEEP_MASKS != 0 && newsc.keep.copies() == 0 {
            return Err(MfsStatus::EInval);
        }
        {
            let sc = self.classes[id as usize].as_mut().unwrap();
            if chgmask & SCLASS_CHG_ADMIN_ONLY != 0 {
                sc.admin_only = newsc.admin_only;
            }
            if chgmask & SCLASS_CHG_EXPORT_GROUP != 0 {
                sc.export_group = newsc.export_group;
            }
            if chgmask & SCLASS_CHG_ARCH_MODE != 0 {
                sc.arch_mode = newsc.arch_mode;
            }
            if chgmask & SCLASS_CHG_ARCH_DELAY != 0 {
                sc.arch_delay = newsc.arch_delay;
            }
            if chgmask & SCLASS_CHG_ARCH_MIN_SIZE != 0 {
                sc.arch_min_size = newsc.arch_min_size;
            }
            if chgmask & SCLASS_CHG_MIN_TRASHRETENTION != 0 {
                sc.min_trashretention = newsc.min_trashretention;
            }
            if chgmask & SCLASS_CHG_CREATE_MASKS != 0 {
                sc.create = newsc.create.clone();
            }
            if chgmask & SCLASS_CHG_KEEP_MASKS != 0 {
                sc.keep = newsc.keep.clone();
            }
            if chgmask & SCLASS_CHG_ARCH_MASKS != 0 {
                sc.arch = newsc.arch.clone();
            }
            if chgmask & SCLASS_CHG_TRASH_MASKS != 0 {
                sc.trash = newsc.trash.clone();
            }
        }
        self.journal_set(chlog, ts, id, 0);
        Ok(id)
    }

    pub fn delete(&mut self, chlog: &mut Changelog, ts: u32, name: &[u8]) -> Result<u8, MfsStatus> {
        let id = self.find_by_name(name).ok_or(MfsStatus::NoSuchClass)?;
        if id < FIRST_FREE_SCLASS_ID {
            return Err(MfsStatus::EPerm);
        }
        if self.refcount[id as usize] > 0 {
            return Err(MfsStatus::ClassInUse);
        }
        chlog.append(&format!("{}|SCDEL({}):{}", ts, escape_name(name), id));
        self.classes[id as usize] = None;
        Ok(id)
    }

    pub fn duplicate(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        sname: &[u8],
        dname: &[u8],
    ) -> Result<u8, MfsStatus> {
        let sid = self.find_by_name(sname).ok_or(MfsStatus::NoSuchClass)?;
        let mut sc = self.classes[sid as usize].as_ref().unwrap().clone();
        sc.name = dname.to_vec();
        let did = self.insert(sc)?;
        chlog.append(&format!(
            "{}|SCDUP({},{}):{},{}",
            ts,
            escape_name(sname),
            escape_name(dname),
            sid,
            did
        ));
        Ok(did)
    }

    pub fn rename(
        &mut self,
        chlog: &mut Changelog,
        ts: u32,
        sname: &[u8],
        dname: &[u8],
    ) -> Result<u8, MfsStatus> {
        let id = self.find_by_name(sname).ok_or(MfsStatus::NoSuchClass)?;
        if id < FIRST_FREE_SCLASS_ID {
            return Err(MfsStatus::EPerm);
        }
        if !valid_name(dname) {
            return Err(MfsStatus::EInval);
        }
        if self.find_by_name(dname).is_some() {
            return Err(MfsStatus::ClassExists);
        }
        chlog.append(&format!("{}|SCREN({},{}):{}", ts, escape_name(sname), escape_name(dname), id));
        self.classes[id as usize].as_mut().unwrap().name = dname.to_vec();
        Ok(id)
    }

    pub fn list_ids(&self) -> Vec<u8> {
        (1..=MAX_SCLASS_ID as u8).filter(|&id| self.classes[id as usize].is_some()).collect()
    }

    /* replay entry points; the caller bumps the meta version on success */

    pub fn mr_set_entry(&mut self, name: &[u8], spid: u8, newflag: u8, sc: StorageClass) -> MfsStatus {
        if newflag != 0 {
            match self.insert(sc) {
                Ok(id) if id == spid => MfsStatus::Ok,
                Ok(_) => MfsStatus::Mismatch,
                Err(s) => s,
            }
        } else {
            match self.find_by_name(name) {
                Some(id) if id == spid => {
                    let name = self.classes[id as usize].as_ref().unwrap().name.clone();
                    self.classes[id as usize] = Some(StorageClass { name, ..sc });
                    MfsStatus::Ok
                }
                _ => MfsStatus::Mismatch,
            }
        }
    }

    pub fn mr_delete_entry(&mut self, name: &[u8], spid: u8) -> MfsStatus {
        match self.find_by_name(name) {
            Some(id) if id == spid && id >= FIRST_FREE_SCLASS_ID => {
                if self.refcount[id as usize] > 0 {
                    return MfsStatus::ClassInUse;
                }
                self.classes[id as usize] = None;
                MfsStatus::Ok
            }
            _ => MfsStatus::Mismatch,
        }
    }

    pub fn mr_duplicate_entry(&mut self, sname: &[u8], dname: &[u8], sspid: u8, dspid: u8) -> MfsStatus {
        match self.find_by_name(sname) {
            Some(sid) if sid == sspid => {
                let mut sc = self.classes[sid as usize].as_ref().unwrap().clone();
                sc.name = dname.to_vec();
                match self.insert(sc) {
                    Ok(id) if id == dspid => MfsStatus::Ok,
                    Ok(_) => MfsStatus::Mismatch,
                    Err(s) => s,
                }
            }
            _ => MfsStatus::Mismatch,
        }
    }

    pub fn mr_rename_entry(&mut self, sname: &[u8], dname: &[u8], spid: u8) -> MfsStatus {
        match self.find_by_name(sname) {
            Some(id) if id == spid => {
                if self.find_by_name(dname).is_some() {
                    return MfsStatus::ClassExists;
                }
                self.classes[id as usize].as_mut().unwrap().name = dname.to_vec();
                MfsStatus::Ok
            }
            _ => MfsStatus::Mismatch,
        }
    }

    /* image section serialization, minor version 0x10 */

    fn store_set(w: &mut impl Write, set: &SclassSet) -> Result<()> {
        w.write_all(&[set.labels_mode])?;
        w.write_all(&set.uniqmask.to_be_bytes())?;
        w.write_all(&[set.ec_parts])?;
        w.write_all(&[set.copies()])?;
        for expr in &set.labelexpr {
            w.write_all(expr)?;
        }
        Ok(())
    }

    fn load_set(c: &mut Cursor) -> Result<SclassSet> {
        let labels_mode = c.get_u8()?;
        let uniqmask = c.get_u32()?;
        let ec_parts = c.get_u8()?;
        let cnt = c.get_u8()?;
        if cnt > 9 {
            bail!("storage class set with {} label programs", cnt);
        }
        let mut labelexpr = Vec::with_capacity(cnt as usize);
        for _ in 0..cnt {
            let mut expr: LabelExpr = [0u8; SCLASS_EXPR_MAX_SIZE];
            expr.copy_from_slice(c.get_bytes(SCLASS_EXPR_MAX_SIZE)?);
            labelexpr.push(expr);
        }
        Ok(SclassSet { labelexpr, uniqmask, labels_mode, ec_parts })
    }

    pub fn store(&self, w: &mut impl Write) -> Result<()> {
        for id in 1..=MAX_SCLASS_ID as u8 {
            if let Some(sc) = &self.classes[id as usize] {
                w.write_all(&[id, sc.name.len() as u8])?;
                w.write_all(&sc.name)?;
                w.write_all(&[sc.admin_only as u8, sc.export_group, sc.arch_mode])?;
                w.write_all(&sc.arch_delay.to_be_bytes())?;
                w.write_all(&sc.arch_min_size.to_be_bytes())?;
                w.write_all(&sc.min_trashretention.to_be_bytes())?;
                Self::store_set(w, &sc.create)?;
                Self::store_set(w, &sc.keep)?;
                Self::store_set(w, &sc.arch)?;
                Self::store_set(w, &sc.trash)?;
            }
        }
        w.write_all(&[0u8])?; // terminator
        Ok(())
    }

    pub fn load(data: &[u8]) -> Result<SclassRegistry> {
        let mut reg = SclassRegistry {
            classes: (0..=MAX_SCLASS_ID).map(|_| None).collect(),
            refcount: vec![0; MAX_SCLASS_ID + 1],
        };
        let mut c = Cursor::new(data);
        loop {
            let id = c.get_u8()?;
            if id == 0 {
                break;
            }
            let nleng = c.get_u8()?;
            let name = c.get_bytes(nleng as usize)?.to_vec();
            let admin_only = c.get_u8()? != 0;
            let export_group = c.get_u8()?;
            let arch_mode = c.get_u8()?;
            let arch_delay = c.get_u16()?;
            let arch_min_size = c.get_u64()?;
            let min_trashretention = c.get_u16()?;
            let create = Self::load_set(&mut c)?;
            let keep = Self::load_set(&mut c)?;
            let arch = Self::load_set(&mut c)?;
            let trash = Self::load_set(&mut c)?;
            if reg.classes[id as usize].is_some() {
                bail!("duplicate storage class id {}", id);
            }
            reg.classes[id as usize] = Some(StorageClass {
                name,
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
            });
        }
        Ok(reg)
    }
}

impl Default for SclassRegistry {
    fn default() -> Self {
        SclassRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn two_copies_ab() -> StorageClass {
        let mut sc = StorageClass::simple_goal(2, b"fast");
        sc.keep = SclassSet::parse(b"A,B").unwrap();
        sc.create = SclassSet::parse(b"2A").unwrap();
        sc
    }

    #[test]
    fn simple_goals_preseeded() {
        let reg = SclassRegistry::new();
        assert_eq!(reg.find_by_name(b"2"), Some(2));
        assert_eq!(reg.get(3).unwrap().keep.copies(), 3);
        assert_eq!(reg.get(10), None);
    }

    #[test]
    fn create_assigns_first_free_id() {
        let mut reg = SclassRegistry::new();
        let mut cl = Changelog::memory();
        let id = reg.create(&mut cl, 0, two_copies_ab()).unwrap();
        assert_eq!(id, FIRST_FREE_SCLASS_ID);
        assert_eq!(reg.find_by_name(b"fast"), Some(id));
        assert_eq!(cl.version(), 2);
        assert!(cl.recorded()[0].contains("SCSET(fast,1,"));
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut reg = SclassRegistry::new();
        let mut cl = Changelog::memory();
        reg.create(&mut cl, 0, two_copies_ab()).unwrap();
        assert_eq!(reg.create(&mut cl, 0, two_copies_ab()), Err(MfsStatus::ClassExists));
    }

    #[test]
    fn delete_respects_references() {
        let mut reg = SclassRegistry::new();
        let mut cl = Changelog::memory();
        let id = reg.create(&mut cl, 0, two_copies_ab()).unwrap();
        reg.incref(id);
        assert_eq!(reg.delete(&mut cl, 0, b"fast"), Err(MfsStatus::ClassInUse));
        reg.decref(id);
        assert_eq!(reg.delete(&mut cl, 0, b"fast"), Ok(id));
        assert_eq!(reg.find_by_name(b"fast"), None);
    }

    #[test]
    fn reserved_ids_protected() {
        let mut reg = SclassRegistry::new();
        let mut cl = Changelog::memory();
        assert_eq!(reg.delete(&mut cl, 0, b"2"), Err(MfsStatus::EPerm));
        assert_eq!(reg.rename(&mut cl, 0, b"2", b"two"), Err(MfsStatus::EPerm));
    }

    #[test]
    fn change_applies_masked_fields_only() {
        let mut reg = SclassRegistry::new();
        let mut cl = Changelog::memory();
        reg.create(&mut cl, 0, two_copies_ab()).unwrap();
        let mut newsc = two_copies_ab();
        newsc.arch_delay = 24;
        newsc.admin_only = true;
        let id = reg.change(&mut cl, 0, b"fast", SCLASS_CHG_ARCH_DELAY, &newsc).unwrap();
        let sc = reg.get(id).unwrap();
        assert_eq!(sc.arch_delay, 24);
        assert!(!sc.admin_only);
    }

    #[test]
    fn duplicate_and_rename() {
        let mut reg = SclassRegistry::new();
        let mut cl = Changelog::memory();
        reg.create(&mut cl, 0, two_copies_ab()).unwrap();
        let did = reg.duplicate(&mut cl, 0, b"fast", b"fast2").unwrap();
        assert_eq!(reg.get(did).unwrap().keep, SclassSet::parse(b"A,B").unwrap());
        reg.rename(&mut cl, 0, b"fast2", b"slow").unwrap();
        assert_eq!(reg.find_by_name(b"fast2"), None);
        assert_eq!(reg.find_by_name(b"slow"), Some(did));
    }

    #[test]
    fn store_load_roundtrip() -> Result<()> {
        let mut reg = SclassRegistry::new();
        let mut cl = Changelog::memory();
        let mut sc = two_copies_ab();
        sc.min_trashretention = 48;
        sc.arch_min_size = 1 << 20;
        let id = reg.create(&mut cl, 0, sc.clone())?;
        let mut buf = Vec::new();
        reg.store(&mut buf)?;
        let reg2 = SclassRegistry::load(&buf)?;
        assert_eq!(reg2.get(id), Some(&sc));
        assert_eq!(reg2.get(5).unwrap().keep.copies(), 5);
        Ok(())
    }

    #[test]
    fn replay_checks_expected_id() {
        let mut reg = SclassRegistry::new();
        assert_eq!(
            reg.mr_set_entry(b"fast", FIRST_FREE_SCLASS_ID, 1, two_copies_ab()),
            MfsStatus::Ok
        );
        assert_eq!(reg.mr_set_entry(b"other", 99, 1, {
            let mut sc = two_copies_ab();
            sc.name = b"other".to_vec();
            sc
        }), MfsStatus::Mismatch);
    }
}
