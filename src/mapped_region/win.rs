use super::{adjust_page_offset, Kind, Region};
use crate::config::Config;
use crate::err::*;
use crate::flags::{Protection, Sharing};
use crate::key::SegmentId;
use crate::registry::{Cleanup, Entry, Registry};

use std::ffi::c_void;
use std::fs::File;
use std::iter;
use std::mem;
use std::os::windows::io::AsRawHandle;
use std::ptr;

use tracing::debug;
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::Storage::FileSystem::FlushFileBuffers;
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, FlushViewOfFile, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile,
    VirtualQuery, FILE_MAP, FILE_MAP_COPY, FILE_MAP_EXECUTE, FILE_MAP_READ, FILE_MAP_WRITE,
    MEMORY_BASIC_INFORMATION, MEMORY_MAPPED_VIEW_ADDRESS, PAGE_EXECUTE_READ, PAGE_PROTECTION_FLAGS,
    PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Mapping object names carry the full 63-bit id.
pub const MAX_KEY: i64 = i64::MAX;

/// Native constants for each protection intent. Windows can only express a
/// private writable view through FILE_MAP_COPY, so everything else that is
/// private and writable or executable is refused.
trait Privilege {
    fn page_protect(&self, sharing: Sharing) -> Result<PAGE_PROTECTION_FLAGS>;

    fn map_access(&self, sharing: Sharing) -> Result<FILE_MAP>;

    fn segment_access(&self) -> Result<FILE_MAP>;
}

impl Privilege for Protection {
    fn page_protect(&self, sharing: Sharing) -> Result<PAGE_PROTECTION_FLAGS> {
        match (*self, sharing) {
            (Protection::ReadOnly, _) => Ok(PAGE_READONLY),
            (Protection::WriteOnly, Sharing::Shared) | (Protection::ReadWrite, Sharing::Shared) => {
                Ok(PAGE_READWRITE)
            }
            (Protection::ReadExecute, Sharing::Shared) => Ok(PAGE_EXECUTE_READ),
            (Protection::CopyOnWrite, Sharing::Private) => Ok(PAGE_WRITECOPY),
            (protection, sharing) => Err(Error::UnsupportedProtection { protection, sharing }),
        }
    }

    fn map_access(&self, sharing: Sharing) -> Result<FILE_MAP> {
        self.page_protect(sharing)?;
        Ok(match *self {
            Protection::ReadOnly => FILE_MAP_READ,
            Protection::WriteOnly | Protection::ReadWrite => FILE_MAP_READ | FILE_MAP_WRITE,
            Protection::ReadExecute => FILE_MAP_READ | FILE_MAP_EXECUTE,
            Protection::CopyOnWrite => FILE_MAP_COPY,
        })
    }

    fn segment_access(&self) -> Result<FILE_MAP> {
        match *self {
            Protection::ReadOnly => Ok(FILE_MAP_READ),
            Protection::ReadWrite => Ok(FILE_MAP_READ | FILE_MAP_WRITE),
            protection => Err(Error::UnsupportedProtection { protection, sharing: Sharing::Shared }),
        }
    }
}

/// Owner's handle on a named mapping object. Closing it is how the owner
/// gives the object up.
#[derive(Debug)]
pub struct SegmentHandle {
    handle: HANDLE,
    id: SegmentId,
}

impl SegmentHandle {
    pub fn id(&self) -> SegmentId {
        self.id
    }
}

pub fn system_page_size() -> (usize, usize) {
    let mut info: SYSTEM_INFO = unsafe { mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    (info.dwPageSize as usize, info.dwAllocationGranularity as usize)
}

fn segment_name(id: SegmentId) -> Vec<u16> {
    format!("mapmem_{}", id).encode_utf16().chain(iter::once(0)).collect()
}

fn check_key(id: SegmentId) -> Result<()> {
    if id.as_raw() <= 0 {
        return Err(Error::InvalidArgument("segment id must be positive"));
    }
    Ok(())
}

fn view_address(addr: *mut c_void) -> MEMORY_MAPPED_VIEW_ADDRESS {
    MEMORY_MAPPED_VIEW_ADDRESS { Value: addr }
}

pub struct Backend {
    config: Config,
    registry: Registry<HANDLE>,
}

impl Backend {
    pub fn new(config: Config) -> Self {
        Backend { config, registry: Registry::new() }
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
        let protect = protection.page_protect(sharing)?;
        let access = protection.map_access(sharing)?;
        let page_offset = adjust_page_offset(offset, self.config.granularity());
        let map_len = len.checked_add(page_offset)
            .ok_or(Error::InvalidArgument("mapping length overflows"))?;
        let file_offset = offset - page_offset as u64;
        let max_size = offset.checked_add(len as u64).ok_or(Error::InvalidOffset(offset))?;
        let file_handle = file.as_raw_handle() as HANDLE;

        let handle = unsafe {
            CreateFileMappingW(file_handle,
                               ptr::null(),
                               protect,
                               (max_size >> 32) as u32,
                               max_size as u32,
                               ptr::null())
        };
        if handle == 0 {
            return Err(Error::mapping_failed("CreateFileMappingW", ErrCode::last_error()));
        }

        let view = unsafe {
            MapViewOfFile(handle, access, (file_offset >> 32) as u32, file_offset as u32, map_len)
        };
        if view.Value.is_null() {
            let ec = ErrCode::last_error();
            unsafe { CloseHandle(handle) };
            return Err(Error::mapping_failed("MapViewOfFile", ec));
        }

        self.register(view.Value, map_len, handle, Some(file_handle))?;
        if self.config.debug() {
            debug!(offset, len, ?protection, ?sharing, "mapped file region");
        }
        Ok(unsafe { Region::from_raw(view.Value as *mut u8, len, page_offset, Kind::File) })
    }

    fn register(&self, start: *mut c_void, len: usize, handle: HANDLE, file: Option<HANDLE>) -> Result<()> {
        let entry = Entry { len, handle, file, cleanup: Cleanup::CloseHandle };
        if let Err(err) = self.registry.insert(start as usize, entry) {
            unsafe {
                UnmapViewOfFile(view_address(start));
                CloseHandle(handle);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Unmaps a file region or detaches a segment view; both go through
    /// the registry to find the mapping handle.
    pub fn release(&self, region: Region) -> Result<()> {
        if region.kind() == Kind::Empty {
            return Ok(());
        }
        let start = region.mapping_start() as *mut c_void;
        let entry = self.registry.remove(start as usize, region.mapping_len())?;

        let unmapped = match unsafe { UnmapViewOfFile(view_address(start)) } {
            0 => Err(Error::mapping_failed("UnmapViewOfFile", ErrCode::last_error())),
            _ => Ok(()),
        };
        let closed = match entry.cleanup {
            Cleanup::CloseHandle => match unsafe { CloseHandle(entry.handle) } {
                0 => Err(Error::mapping_failed("CloseHandle", ErrCode::last_error())),
                _ => Ok(()),
            },
        };
        if self.config.debug() {
            debug!(len = region.len(), kind = ?region.kind(), "released region");
        }
        unmapped.and(closed)
    }

    pub fn create_segment(&self, id: SegmentId, len: usize) -> Result<SegmentHandle> {
        check_key(id)?;
        if len == 0 {
            return Err(Error::InvalidArgument("cannot create an empty segment"));
        }
        let name = segment_name(id);
        let size = len as u64;
        let handle = unsafe {
            CreateFileMappingW(INVALID_HANDLE_VALUE,
                               ptr::null(),
                               PAGE_READWRITE,
                               (size >> 32) as u32,
                               size as u32,
                               name.as_ptr())
        };
        if handle == 0 {
            return Err(Error::mapping_failed("CreateFileMappingW", ErrCode::last_error()));
        }
        // A name collision still hands back a handle to the existing object.
        if ErrCode::last_error() == ALREADY_EXISTS {
            unsafe { CloseHandle(handle) };
            return Err(Error::KeyInUse { call: "CreateFileMappingW", id });
        }
        if self.config.debug() {
            debug!(%id, len, "created segment");
        }
        Ok(SegmentHandle { handle, id })
    }

    pub fn attach_segment(&self, id: SegmentId, len: usize, protection: Protection) -> Result<Region> {
        check_key(id)?;
        let access = protection.segment_access()?;
        let name = segment_name(id);
        let handle = unsafe { OpenFileMappingW(access, 0, name.as_ptr()) };
        if handle == 0 {
            return match ErrCode::last_error() {
                ec if ec == FILE_NOT_FOUND => Err(Error::SegmentNotFound { call: "OpenFileMappingW", id }),
                ec => Err(Error::mapping_failed("OpenFileMappingW", ec)),
            };
        }

        let view = unsafe { MapViewOfFile(handle, access, 0, 0, 0) };
        if view.Value.is_null() {
            let ec = ErrCode::last_error();
            unsafe { CloseHandle(handle) };
            return Err(Error::mapping_failed("MapViewOfFile", ec));
        }

        // The section size is not queryable; the view covers it rounded up
        // to whole pages.
        let mut info: MEMORY_BASIC_INFORMATION = unsafe { mem::zeroed() };
        let queried = unsafe {
            VirtualQuery(view.Value, &mut info, mem::size_of::<MEMORY_BASIC_INFORMATION>())
        };
        if queried == 0 {
            let ec = ErrCode::last_error();
            unsafe {
                UnmapViewOfFile(view);
                CloseHandle(handle);
            }
            return Err(Error::mapping_failed("VirtualQuery", ec));
        }
        let size = info.RegionSize;
        let view_len = if len == 0 { size } else { len.min(size) };

        self.register(view.Value, view_len, handle, None)?;
        if self.config.debug() {
            debug!(%id, size, view = view_len, ?protection, "attached segment");
        }
        Ok(unsafe { Region::from_raw(view.Value as *mut u8, view_len, 0, Kind::Segment) })
    }

    pub fn destroy_segment(&self, handle: SegmentHandle) -> Result<()> {
        match unsafe { CloseHandle(handle.handle) } {
            0 => Err(Error::mapping_failed("CloseHandle", ErrCode::last_error())),
            _ => {
                if self.config.debug() {
                    debug!(id = %handle.id, "closed owner handle");
                }
                Ok(())
            }
        }
    }

    pub fn flush(&self, region: &Region) -> Result<()> {
        if region.kind() == Kind::Empty {
            return Ok(());
        }
        let start = region.mapping_start() as *const c_void;
        let file = self.registry.with(start as usize, |entry| entry.file)?;
        if unsafe { FlushViewOfFile(start, region.mapping_len()) } == 0 {
            return Err(Error::mapping_failed("FlushViewOfFile", ErrCode::last_error()));
        }
        if let Some(file) = file {
            if unsafe { FlushFileBuffers(file) } == 0 {
                return Err(Error::mapping_failed("FlushFileBuffers", ErrCode::last_error()));
            }
        }
        Ok(())
    }
}
