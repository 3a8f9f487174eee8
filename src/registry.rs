//! Address-keyed bookkeeping for backends whose unmap and flush calls need
//! the native handle that produced a view, not just its address.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::err::{Error, Result};

/// What to do with the mapping handle once its view is gone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cleanup {
    CloseHandle,
}

#[derive(Debug)]
pub struct Entry<H> {
    pub len: usize,
    pub handle: H,
    /// Handle of the file the view came from, if any. Not owned.
    pub file: Option<H>,
    pub cleanup: Cleanup,
}

/// The lock only covers the table, never the mapped bytes.
#[derive(Debug)]
pub struct Registry<H> {
    active: Mutex<HashMap<usize, Entry<H>>>,
}

impl<H> Registry<H> {
    pub fn new() -> Self {
        Registry { active: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, addr: usize, entry: Entry<H>) -> Result<()> {
        let mut active = self.active.lock();
        if active.contains_key(&addr) {
            return Err(Error::InvalidArgument("address already registered"));
        }
        active.insert(addr, entry);
        Ok(())
    }

    /// Unknown addresses and length mismatches mean a double unmap or an
    /// unmap of a foreign view; both are reported, not ignored.
    pub fn remove(&self, addr: usize, len: usize) -> Result<Entry<H>> {
        let mut active = self.active.lock();
        match active.get(&addr) {
            Some(entry) if entry.len == len => {}
            Some(_) => return Err(Error::InvalidArgument("unmap length does not match mapping")),
            None => return Err(Error::InvalidArgument("address is not mapped")),
        }
        active.remove(&addr).ok_or(Error::InvalidArgument("address is not mapped"))
    }

    pub fn with<R, F>(&self, addr: usize, f: F) -> Result<R>
        where F: FnOnce(&Entry<H>) -> R
    {
        let active = self.active.lock();
        active.get(&addr)
            .map(f)
            .ok_or(Error::InvalidArgument("address is not mapped"))
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Registry::new()
    }
}

#[cfg(test)]
fn entry(len: usize, handle: u32) -> Entry<u32> {
    Entry { len, handle, file: None, cleanup: Cleanup::CloseHandle }
}

#[test]
fn test_insert_and_remove() {
    let reg = Registry::new();
    reg.insert(0x1000, entry(4096, 7)).unwrap();
    assert_eq!(reg.len(), 1);
    assert_eq!(reg.with(0x1000, |e| e.handle).unwrap(), 7);

    let e = reg.remove(0x1000, 4096).unwrap();
    assert_eq!(e.handle, 7);
    assert_eq!(e.cleanup, Cleanup::CloseHandle);
    assert!(reg.is_empty());
}

#[test]
fn test_double_remove_is_rejected() {
    let reg = Registry::new();
    reg.insert(0x2000, entry(16, 1)).unwrap();
    reg.remove(0x2000, 16).unwrap();
    match reg.remove(0x2000, 16) {
        Err(Error::InvalidArgument(_)) => {}
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_length_mismatch_keeps_entry() {
    let reg = Registry::new();
    reg.insert(0x3000, entry(16, 1)).unwrap();
    assert!(matches!(reg.remove(0x3000, 32), Err(Error::InvalidArgument(_))));
    assert_eq!(reg.len(), 1);
    assert!(reg.remove(0x3000, 16).is_ok());
}

#[test]
fn test_duplicate_insert_is_rejected() {
    let reg = Registry::new();
    reg.insert(0x4000, entry(16, 1)).unwrap();
    assert!(matches!(reg.insert(0x4000, entry(16, 2)), Err(Error::InvalidArgument(_))));
    assert_eq!(reg.with(0x4000, |e| e.handle).unwrap(), 1);
}

#[test]
fn test_unknown_lookup() {
    let reg: Registry<u32> = Registry::new();
    assert!(matches!(reg.with(0x5000, |e| e.len), Err(Error::InvalidArgument(_))));
}
