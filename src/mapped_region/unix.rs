use super::{adjust_page_offset, Kind, Region};
use crate::config::Config;
use crate::err::*;
use crate::flags::{Protection, Sharing};
use crate::key::SegmentId;

use std::fs::File;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::ptr;

use tracing::debug;

/// Largest id a SysV key can hold.
pub const MAX_KEY: i64 = libc::key_t::MAX as i64;

const SEGMENT_PERM: libc::c_int = 0o600;

bitflags! {
    pub struct Prot: libc::c_int {
        const READ = libc::PROT_READ;
        const WRITE = libc::PROT_WRITE;
        const EXEC = libc::PROT_EXEC;
    }
}

/// Native constants for each protection intent.
trait Privilege {
    fn map_prot(&self) -> Prot;

    fn map_flags(&self, sharing: Sharing) -> Result<libc::c_int>;

    fn shmflg(&self) -> Result<libc::c_int>;
}

impl Privilege for Protection {
    fn map_prot(&self) -> Prot {
        match *self {
            Protection::ReadOnly => Prot::READ,
            Protection::WriteOnly | Protection::ReadWrite | Protection::CopyOnWrite => {
                Prot::READ | Prot::WRITE
            }
            Protection::ReadExecute => Prot::READ | Prot::EXEC,
        }
    }

    fn map_flags(&self, sharing: Sharing) -> Result<libc::c_int> {
        match (*self, sharing) {
            (Protection::CopyOnWrite, Sharing::Shared) => {
                Err(Error::UnsupportedProtection { protection: *self, sharing })
            }
            (_, Sharing::Shared) => Ok(libc::MAP_SHARED),
            (_, Sharing::Private) => Ok(libc::MAP_PRIVATE),
        }
    }

    fn shmflg(&self) -> Result<libc::c_int> {
        match *self {
            Protection::ReadOnly => Ok(libc::SHM_RDONLY),
            Protection::ReadWrite => Ok(0),
            _ => Err(Error::UnsupportedProtection { protection: *self, sharing: Sharing::Shared }),
        }
    }
}

/// Owner's grip on a SysV segment, needed to remove it.
#[derive(Debug)]
pub struct SegmentHandle {
    shmid: libc::c_int,
    id: SegmentId,
}

impl SegmentHandle {
    pub fn id(&self) -> SegmentId {
        self.id
    }
}

pub fn system_page_size() -> (usize, usize) {
    let size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    };
    (size, size)
}

fn key_of(id: SegmentId) -> Result<libc::key_t> {
    match id.as_raw() {
        raw if raw > 0 && raw <= MAX_KEY => Ok(raw as libc::key_t),
        _ => Err(Error::InvalidArgument("segment id out of range for a SysV key")),
    }
}

fn not_found_or(call: &'static str, id: SegmentId, ec: ErrCode) -> Error {
    if ec == NO_SUCH_FILE_OR_DIRECTORY || ec == IDENTIFIER_REMOVED || ec == INVALID_ARGUMENT {
        Error::SegmentNotFound { call, id }
    } else {
        Error::mapping_failed(call, ec)
    }
}

pub struct Backend {
    config: Config,
}

impl Backend {
    pub fn new(config: Config) -> Self {
        Backend { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn map_file_region(&self,
                           file: &File,
                           offset: u64,
                           len: usize,
                           protection: Protection,
                           sharing: Sharing) -> Result<Region> {
        if len == 0 {
            return Err(Error::InvalidArgument("cannot map zero bytes"));
        }
        let flags = protection.map_flags(sharing)?;
        let page_offset = adjust_page_offset(offset, self.config.granularity());
        let map_len = len.checked_add(page_offset)
            .ok_or(Error::InvalidArgument("mapping length overflows"))?;
        let file_offset = offset - page_offset as u64;

        match unsafe {
            libc::mmap(ptr::null_mut(),
                       map_len,
                       protection.map_prot().bits(),
                       flags,
                       file.as_raw_fd(),
                       file_offset as libc::off_t)
        } {
            libc::MAP_FAILED => Err(Error::mapping_failed("mmap", ErrCode::last_error())),
            base => {
                if self.config.debug() {
                    debug!(fd = file.as_raw_fd(), offset, len, ?protection, ?sharing, "mapped file region");
                }
                Ok(unsafe { Region::from_raw(base as *mut u8, len, page_offset, Kind::File) })
            }
        }
    }

    /// Unmaps a file region or detaches a segment view, whichever it is.
    pub fn release(&self, region: Region) -> Result<()> {
        let start = region.mapping_start() as *mut libc::c_void;
        match region.kind() {
            Kind::Empty => Ok(()),
            Kind::File => match unsafe { libc::munmap(start, region.mapping_len()) } {
                -1 => Err(Error::mapping_failed("munmap", ErrCode::last_error())),
                _ => {
                    if self.config.debug() {
                        debug!(len = region.len(), "unmapped file region");
                    }
                    Ok(())
                }
            },
            Kind::Segment => match unsafe { libc::shmdt(start) } {
                -1 => Err(Error::mapping_failed("shmdt", ErrCode::last_error())),
                _ => {
                    if self.config.debug() {
                        debug!(len = region.len(), "detached segment");
                    }
                    Ok(())
                }
            },
        }
    }

    pub fn create_segment(&self, id: SegmentId, len: usize) -> Result<SegmentHandle> {
        let key = key_of(id)?;
        if len == 0 {
            return Err(Error::InvalidArgument("cannot create an empty segment"));
        }
        match unsafe { libc::shmget(key, len, SEGMENT_PERM | libc::IPC_CREAT | libc::IPC_EXCL) } {
            -1 => match ErrCode::last_error() {
                ec if ec == FILE_EXISTS => Err(Error::KeyInUse { call: "shmget", id }),
                ec => Err(Error::mapping_failed("shmget", ec)),
            },
            shmid => {
                if self.config.debug() {
                    debug!(%id, shmid, len, "created segment");
                }
                Ok(SegmentHandle { shmid, id })
            }
        }
    }

    pub fn attach_segment(&self, id: SegmentId, len: usize, protection: Protection) -> Result<Region> {
        let shmflg = protection.shmflg()?;
        let key = key_of(id)?;
        let shmid = match unsafe { libc::shmget(key, 0, 0) } {
            -1 => return Err(not_found_or("shmget", id, ErrCode::last_error())),
            shmid => shmid,
        };
        let size = xsi_size(shmid).map_err(|ec| not_found_or("shmctl", id, ec))?;

        let base = unsafe { libc::shmat(shmid, ptr::null(), shmflg) };
        if base == (usize::max_value() as *mut libc::c_void) {
            return Err(not_found_or("shmat", id, ErrCode::last_error()));
        }

        let view = if len == 0 { size } else { len.min(size) };
        if self.config.debug() {
            debug!(%id, shmid, size, view, ?protection, "attached segment");
        }
        Ok(unsafe { Region::from_raw(base as *mut u8, view, 0, Kind::Segment) })
    }

    pub fn destroy_segment(&self, handle: SegmentHandle) -> Result<()> {
        match unsafe { libc::shmctl(handle.shmid, libc::IPC_RMID, ptr::null_mut()) } {
            -1 => Err(not_found_or("shmctl", handle.id, ErrCode::last_error())),
            _ => {
                if self.config.debug() {
                    debug!(id = %handle.id, shmid = handle.shmid, "removed segment");
                }
                Ok(())
            }
        }
    }

    /// SysV memory has no backing store, so only file regions do any work.
    pub fn flush(&self, region: &Region) -> Result<()> {
        match region.kind() {
            Kind::File => {
                let start = region.mapping_start() as *mut libc::c_void;
                match unsafe { libc::msync(start, region.mapping_len(), libc::MS_SYNC) } {
                    -1 => Err(Error::mapping_failed("msync", ErrCode::last_error())),
                    _ => Ok(()),
                }
            }
            Kind::Empty | Kind::Segment => Ok(()),
        }
    }
}

fn xsi_size(shmid: libc::c_int) -> std::result::Result<usize, ErrCode> {
    let mut ds: libc::shmid_ds = unsafe { mem::zeroed() };
    match unsafe { libc::shmctl(shmid, libc::IPC_STAT, &mut ds) } {
        -1 => Err(ErrCode::last_error()),
        _ => Ok(ds.shm_segsz as usize),
    }
}

#[test]
fn test_map_prot_table() {
    assert_eq!(Protection::ReadOnly.map_prot(), Prot::READ);
    // The cursor reads back through writable views, so they always get READ.
    assert_eq!(Protection::WriteOnly.map_prot(), Prot::READ | Prot::WRITE);
    assert_eq!(Protection::ReadWrite.map_prot(), Prot::READ | Prot::WRITE);
    assert_eq!(Protection::ReadExecute.map_prot(), Prot::READ | Prot::EXEC);
    assert_eq!(Protection::CopyOnWrite.map_prot(), Prot::READ | Prot::WRITE);
}

#[test]
fn test_map_flags_table() {
    assert_eq!(Protection::ReadWrite.map_flags(Sharing::Shared).unwrap(), libc::MAP_SHARED);
    assert_eq!(Protection::CopyOnWrite.map_flags(Sharing::Private).unwrap(), libc::MAP_PRIVATE);
    assert!(Protection::CopyOnWrite.map_flags(Sharing::Shared).is_err());
}

#[test]
fn test_shmflg_table() {
    assert_eq!(Protection::ReadOnly.shmflg().unwrap(), libc::SHM_RDONLY);
    assert_eq!(Protection::ReadWrite.shmflg().unwrap(), 0);
    for p in [Protection::WriteOnly, Protection::ReadExecute, Protection::CopyOnWrite].iter() {
        assert!(matches!(p.shmflg(), Err(Error::UnsupportedProtection { .. })));
    }
}

#[test]
fn test_key_range() {
    assert!(key_of(SegmentId::AUTO).is_err());
    assert!(key_of(SegmentId::new(-5)).is_err());
    assert!(key_of(SegmentId::new(MAX_KEY + 1)).is_err());
    assert_eq!(key_of(SegmentId::new(MAX_KEY)).unwrap() as i64, MAX_KEY);
}
