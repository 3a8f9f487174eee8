//! Mapped regions and the per-platform backend behind them.
//!
//! A [`Region`] is a move-only token for one live mapping or attachment.
//! Every release call on [`Mapper`] takes it by value, so a region cannot be
//! unmapped twice and cannot be touched after release.

use std::fs::File;
use std::path::Path;
use std::ptr::NonNull;
use std::slice;
use std::sync::{Arc, OnceLock};

use crate::config::Config;
use crate::err::Result;
use crate::flags::{Protection, Sharing};
use crate::key::SegmentId;
use crate::map_file::MapFile;
use crate::segment::Segment;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use self::unix::{system_page_size, Backend, MAX_KEY};
#[cfg(unix)]
pub use self::unix::SegmentHandle;

#[cfg(windows)]
mod win;
#[cfg(windows)]
pub(crate) use self::win::{system_page_size, Backend, MAX_KEY};
#[cfg(windows)]
pub use self::win::SegmentHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Kind {
    /// Nothing was requested from the OS.
    Empty,
    File,
    Segment,
}

pub struct Region {
    base: NonNull<u8>,
    len: usize,
    page_offset: usize,
    kind: Kind,
}

// A region is exclusively owned; sharing the bytes with other mappers is
// the OS's business, not the type system's.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub(crate) fn empty() -> Self {
        Region {
            base: NonNull::dangling(),
            len: 0,
            page_offset: 0,
            kind: Kind::Empty,
        }
    }

    /// `start` is what the OS returned; the usable bytes begin
    /// `page_offset` bytes later.
    pub(crate) unsafe fn from_raw(start: *mut u8, len: usize, page_offset: usize, kind: Kind) -> Self {
        Region {
            base: NonNull::new_unchecked(start.add(page_offset)),
            len,
            page_offset,
            kind,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    /// Mutable view of the bytes. Writing through a region mapped without
    /// write access faults; the front ends check before calling this.
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
    }

    pub(crate) fn kind(&self) -> Kind {
        self.kind
    }

    /// Address the OS handed out, before page alignment slack was skipped.
    pub(crate) fn mapping_start(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().sub(self.page_offset) }
    }

    pub(crate) fn mapping_len(&self) -> usize {
        self.len + self.page_offset
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Distance from the aligned-down offset the OS gets to the offset the
/// caller asked for.
pub(crate) fn adjust_page_offset(offset: u64, granularity: usize) -> usize {
    (offset % granularity as u64) as usize
}

/// Handle on the platform backend. Cheap to clone; every file and segment
/// keeps one so that dropping them can still reach the backend.
#[derive(Clone)]
pub struct Mapper {
    backend: Arc<Backend>,
}

static SHARED: OnceLock<Mapper> = OnceLock::new();

impl Mapper {
    pub fn new(config: Config) -> Self {
        Mapper { backend: Arc::new(Backend::new(config)) }
    }

    /// Process-wide mapper built from [`Config::from_env`] on first use.
    /// Backs the convenience constructors that take no mapper.
    pub fn shared() -> Mapper {
        SHARED.get_or_init(|| Mapper::new(Config::from_env())).clone()
    }

    pub fn config(&self) -> &Config {
        self.backend.config()
    }

    /// Maps `len` bytes of `file` starting at `offset`.
    pub fn map_file_region(&self,
                           file: &File,
                           offset: u64,
                           len: usize,
                           protection: Protection,
                           sharing: Sharing) -> Result<Region> {
        self.backend.map_file_region(file, offset, len, protection, sharing)
    }

    pub fn unmap_region(&self, region: Region) -> Result<()> {
        debug_assert_ne!(region.kind(), Kind::Segment);
        self.backend.release(region)
    }

    /// Creates a segment under `id`, failing with `KeyInUse` if one exists.
    pub fn create_segment(&self, id: SegmentId, len: usize) -> Result<SegmentHandle> {
        self.backend.create_segment(id, len)
    }

    /// Maps an existing segment. `len == 0` views the whole segment,
    /// anything larger than the segment is clipped.
    pub fn attach_segment(&self, id: SegmentId, len: usize, protection: Protection) -> Result<Region> {
        self.backend.attach_segment(id, len, protection)
    }

    pub fn detach_segment(&self, region: Region) -> Result<()> {
        debug_assert_ne!(region.kind(), Kind::File);
        self.backend.release(region)
    }

    /// Requests removal of the segment. On POSIX the id stops resolving at
    /// once and the memory goes away with the last detach. On Windows the
    /// object lives until every handle to it in every process is closed.
    pub fn destroy_segment(&self, handle: SegmentHandle) -> Result<()> {
        self.backend.destroy_segment(handle)
    }

    pub fn flush(&self, region: &Region) -> Result<()> {
        self.backend.flush(region)
    }

    pub fn open_file<P: AsRef<Path>>(&self, path: P) -> Result<MapFile> {
        MapFile::options().open_with(self, path)
    }

    pub fn open_segment(&self, id: SegmentId, size: usize) -> Result<Segment> {
        Segment::options().size(size).open_with(self, id)
    }
}

impl Default for Mapper {
    fn default() -> Self {
        Mapper::new(Config::from_env())
    }
}

impl std::fmt::Debug for Mapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapper").field("config", self.config()).finish()
    }
}

#[test]
fn test_adjust_page_offset() {
    let ps = system_page_size().1;
    assert_eq!(adjust_page_offset(0, ps), 0);
    assert_eq!(adjust_page_offset(1, ps), 1);
    assert_eq!(adjust_page_offset(ps as u64 - 1, ps), ps - 1);
    assert_eq!(adjust_page_offset(ps as u64, ps), 0);
    assert_eq!(adjust_page_offset(ps as u64 + 1, ps), 1);
}

#[test]
fn test_empty_region() {
    let region = Region::empty();
    assert!(region.is_empty());
    assert_eq!(region.as_slice(), &[] as &[u8]);
    assert_eq!(region.kind(), Kind::Empty);
    Mapper::default().unmap_region(region).unwrap();
}

#[test]
fn test_map_zero_bytes_is_rejected() {
    let file = tempfile::tempfile().unwrap();
    let mapper = Mapper::default();
    match mapper.map_file_region(&file, 0, 0, Protection::ReadOnly, Sharing::Shared) {
        Err(crate::Error::InvalidArgument(_)) => {}
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_map_file_region_at_unaligned_offset() {
    use std::io::Write;

    let mut file = tempfile::tempfile().unwrap();
    let data: Vec<u8> = (0..3 * 4096u32).map(|i| (i % 251) as u8).collect();
    file.write_all(&data).unwrap();

    let mapper = Mapper::default();
    let offset = 4096 + 17;
    let region = mapper.map_file_region(&file, offset, 100, Protection::ReadOnly, Sharing::Shared).unwrap();
    assert_eq!(region.len(), 100);
    assert_eq!(region.as_slice(), &data[offset as usize..offset as usize + 100]);
    mapper.flush(&region).unwrap();
    mapper.unmap_region(region).unwrap();
}

#[test]
fn test_copy_on_write_requires_private() {
    let file = tempfile::tempfile().unwrap();
    file.set_len(16).unwrap();
    let mapper = Mapper::default();
    match mapper.map_file_region(&file, 0, 16, Protection::CopyOnWrite, Sharing::Shared) {
        Err(crate::Error::UnsupportedProtection { protection, sharing }) => {
            assert_eq!(protection, Protection::CopyOnWrite);
            assert_eq!(sharing, Sharing::Shared);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_shared_mapper_is_reused() {
    let a = Mapper::shared();
    let b = Mapper::shared();
    assert!(Arc::ptr_eq(&a.backend, &b.backend));
    assert!(!Arc::ptr_eq(&a.backend, &Mapper::default().backend));
}
