//! Shared memory segments, created by one owner and attached by anyone who
//! knows the id.

use std::fmt;
use std::io::{self, SeekFrom};
use std::mem;

use tracing::{debug, warn};

use crate::err::{Error, Result};
use crate::flags::Protection;
use crate::key::{KeySource, RandomKeys, SegmentId};
use crate::mapped_region::{Mapper, SegmentHandle, MAX_KEY};
use crate::view::View;

enum Role {
    /// Created the segment; asks for its removal on close.
    Owner(SegmentHandle),
    Attacher,
}

#[derive(Clone, Debug)]
pub struct SegmentOptions {
    size: usize,
    protection: Protection,
}

impl SegmentOptions {
    pub fn new() -> Self {
        SegmentOptions { size: 0, protection: Protection::ReadWrite }
    }

    /// Owners create a segment of this many bytes, or one page for zero.
    /// Attachers view at most this many bytes, or the whole segment for zero.
    pub fn size(&mut self, size: usize) -> &mut Self {
        self.size = size;
        self
    }

    /// Only `ReadOnly` and `ReadWrite` can be expressed for segments.
    pub fn protection(&mut self, protection: Protection) -> &mut Self {
        self.protection = protection;
        self
    }

    pub fn read_only(&mut self) -> &mut Self {
        self.protection(Protection::ReadOnly)
    }

    pub fn open(&self, id: SegmentId) -> Result<Segment> {
        self.open_with(&Mapper::shared(), id)
    }

    pub fn open_with(&self, mapper: &Mapper, id: SegmentId) -> Result<Segment> {
        self.open_with_keys(mapper, id, &mut RandomKeys)
    }

    /// Like [`open_with`](Self::open_with), drawing new ids from `keys`
    /// when `id` is `SegmentId::AUTO`.
    pub fn open_with_keys<K: KeySource>(&self, mapper: &Mapper, id: SegmentId, keys: &mut K) -> Result<Segment> {
        if id.is_auto() {
            self.create(mapper, keys)
        } else {
            self.attach(mapper, id)
        }
    }

    fn create<K: KeySource>(&self, mapper: &Mapper, keys: &mut K) -> Result<Segment> {
        let config = mapper.config();
        let size = if self.size == 0 { config.page_size() } else { self.size };

        let mut handle = None;
        for attempt in 1..=config.key_attempts() {
            let id = keys.next_key(MAX_KEY);
            if id.is_auto() {
                return Err(Error::InvalidArgument("key source returned the auto id"));
            }
            match mapper.create_segment(id, size) {
                Ok(h) => {
                    handle = Some(h);
                    break;
                }
                Err(Error::KeyInUse { .. }) => {
                    debug!(%id, attempt, "segment key in use, drawing another");
                }
                Err(err) => return Err(err),
            }
        }
        let handle = handle.ok_or(Error::KeyExhausted { attempts: config.key_attempts() })?;
        let id = handle.id();

        let region = match mapper.attach_segment(id, size, self.protection) {
            Ok(region) => region,
            Err(err) => {
                if let Err(destroy_err) = mapper.destroy_segment(handle) {
                    warn!(%id, err = %destroy_err, "failed to remove segment after attach error");
                }
                return Err(err);
            }
        };

        Ok(Segment {
            mapper: mapper.clone(),
            id,
            role: Role::Owner(handle),
            view: View::new(region, self.protection.writable(), config.debug()),
        })
    }

    fn attach(&self, mapper: &Mapper, id: SegmentId) -> Result<Segment> {
        let region = mapper.attach_segment(id, self.size, self.protection)?;
        Ok(Segment {
            mapper: mapper.clone(),
            id,
            role: Role::Attacher,
            view: View::new(region, self.protection.writable(), mapper.config().debug()),
        })
    }
}

impl Default for SegmentOptions {
    fn default() -> Self {
        SegmentOptions::new()
    }
}

/// A view of a shared memory segment with a read/write cursor.
///
/// Whoever opens with `SegmentId::AUTO` owns the segment and removes it on
/// close; everyone else only detaches. Contents written by one process are
/// visible to every other process attached to the same id.
pub struct Segment {
    mapper: Mapper,
    id: SegmentId,
    role: Role,
    view: View,
}

impl Segment {
    /// `SegmentId::AUTO` creates a new segment of `size` bytes; any other id
    /// attaches to an existing one, viewing at most `size` bytes.
    pub fn open(id: SegmentId, size: usize) -> Result<Segment> {
        SegmentOptions::new().size(size).open(id)
    }

    /// Attaches to the whole of an existing segment.
    pub fn attach(id: SegmentId) -> Result<Segment> {
        if id.is_auto() {
            return Err(Error::InvalidArgument("cannot attach to the auto id"));
        }
        SegmentOptions::new().open(id)
    }

    pub fn options() -> SegmentOptions {
        SegmentOptions::new()
    }

    /// Id other processes pass to [`Segment::attach`].
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// True while this handle still owns the segment. Cleared by close.
    pub fn is_owner(&self) -> bool {
        match self.role {
            Role::Owner(_) => true,
            Role::Attacher => false,
        }
    }

    pub fn len(&self) -> usize {
        self.view.len()
    }

    pub fn is_empty(&self) -> bool {
        self.view.len() == 0
    }

    pub fn position(&self) -> u64 {
        self.view.position()
    }

    pub fn is_writable(&self) -> bool {
        self.view.writable()
    }

    pub fn is_closed(&self) -> bool {
        self.view.is_closed()
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        self.view.get(index)
    }

    pub fn as_slice(&self) -> Result<&[u8]> {
        self.view.as_slice()
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.view.read(buf)
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        self.view.read_byte()
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.view.read_at(buf, offset)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.view.write(buf)
    }

    pub fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.view.write_byte(byte)
    }

    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        self.view.write_at(buf, offset)
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.view.seek(pos)
    }

    /// Segments have no backing file; this only checks the handle is usable.
    pub fn sync(&self) -> Result<()> {
        let region = self.view.region_ref()?;
        if !self.view.writable() {
            return Err(Error::NotWritable);
        }
        self.mapper.flush(region)
    }

    /// Detaches, then gives the segment up if this handle owns it. Both
    /// steps run even if the first fails. Closing again does nothing.
    pub fn close(&mut self) -> Result<()> {
        let region = match self.view.release() {
            Ok(region) => region,
            Err(Error::AlreadyClosed) => return Ok(()),
            Err(err) => return Err(err),
        };
        let detached = self.mapper.detach_segment(region);
        let destroyed = match mem::replace(&mut self.role, Role::Attacher) {
            Role::Owner(handle) => self.mapper.destroy_segment(handle),
            Role::Attacher => Ok(()),
        };
        detached.and(destroyed)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(id = %self.id, %err, "failed to close segment");
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("owner", &self.is_owner())
            .field("len", &self.len())
            .field("position", &self.position())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl io::Read for Segment {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match Segment::read(self, buf) {
            Ok(n) => Ok(n),
            Err(Error::EndOfRegion { read }) => Ok(read),
            Err(err) => Err(err.into()),
        }
    }
}

impl io::Write for Segment {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match Segment::write(self, buf) {
            Ok(n) => Ok(n),
            Err(Error::ShortWrite { written }) if written > 0 => Ok(written),
            Err(err) => Err(err.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for Segment {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Segment::seek(self, pos).map_err(Into::into)
    }
}

#[test]
fn test_owner_and_attacher_scenario() {
    let mut owner = Segment::open(SegmentId::AUTO, 18).unwrap();
    assert!(owner.is_owner());
    assert!(!owner.id().is_auto());
    assert_eq!(owner.len(), 18);
    assert_eq!(owner.write(b"hello world!\nbye.\n").unwrap(), 18);

    let mut peer = Segment::attach(owner.id()).unwrap();
    assert!(!peer.is_owner());
    assert!(peer.len() >= 18);
    assert_eq!(&peer.as_slice().unwrap()[..18], b"hello world!\nbye.\n");

    owner.write_at(b"bye!\n", 3).unwrap();
    assert_eq!(&peer.as_slice().unwrap()[..18], b"helbye!\nrld!\nbye.\n");

    owner.seek(SeekFrom::Start(0)).unwrap();
    owner.write(b"hello world!\nbye\n").unwrap();
    assert_eq!(&peer.as_slice().unwrap()[..18], b"hello world!\nbye\n\n");

    assert_eq!(owner.seek(SeekFrom::End(-5)).unwrap(), 13);
    owner.write_byte(b't').unwrap();
    let mut buf = [0u8; 18];
    assert_eq!(peer.read(&mut buf).unwrap(), 18);
    assert_eq!(&buf, b"hello world!\ntye\n\n");

    peer.close().unwrap();
    owner.close().unwrap();
}

#[test]
fn test_owner_close_removes_segment() {
    let mut owner = Segment::open(SegmentId::AUTO, 64).unwrap();
    let id = owner.id();
    owner.write_at(b"still here", 0).unwrap();
    let mut peer = Segment::attach(id).unwrap();

    owner.close().unwrap();
    assert!(!owner.is_owner());

    // Attached views outlive the owner.
    let mut buf = [0u8; 10];
    peer.read_at(&mut buf, 0).unwrap();
    assert_eq!(&buf, b"still here");

    #[cfg(unix)]
    match Segment::attach(id) {
        Err(Error::SegmentNotFound { id: missing, .. }) => assert_eq!(missing, id),
        other => panic!("unexpected {:?}", other),
    }
    peer.close().unwrap();
}

#[test]
fn test_attacher_close_keeps_segment() {
    let mut owner = Segment::open(SegmentId::AUTO, 64).unwrap();
    let id = owner.id();
    owner.write_at(b"kept", 0).unwrap();

    let mut first = Segment::attach(id).unwrap();
    first.close().unwrap();

    let mut second = Segment::attach(id).unwrap();
    assert!(second.len() >= 64);
    let mut buf = [0u8; 4];
    second.read_at(&mut buf, 0).unwrap();
    assert_eq!(&buf, b"kept");
    second.close().unwrap();

    owner.close().unwrap();
    match Segment::attach(id) {
        Err(Error::SegmentNotFound { id: missing, .. }) => assert_eq!(missing, id),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_close_twice() {
    let mut owner = Segment::open(SegmentId::AUTO, 16).unwrap();
    owner.close().unwrap();
    owner.close().unwrap();
    assert!(owner.is_closed());
    assert_eq!(owner.len(), 0);
    assert!(matches!(owner.write(b"x"), Err(Error::InvalidArgument(_))));
}

#[test]
fn test_read_only_attach() {
    let mut owner = Segment::open(SegmentId::AUTO, 32).unwrap();
    owner.write(b"abc").unwrap();

    let mut peer = Segment::options().read_only().open(owner.id()).unwrap();
    assert!(!peer.is_writable());
    assert!(matches!(peer.write(b"x"), Err(Error::NotWritable)));
    assert!(matches!(peer.write_at(b"x", 0), Err(Error::NotWritable)));
    assert!(matches!(peer.sync(), Err(Error::NotWritable)));
    assert_eq!(peer.read_byte().unwrap(), b'a');

    owner.sync().unwrap();
    peer.close().unwrap();
    owner.close().unwrap();
}

#[test]
fn test_attach_bounds_view() {
    let owner = Segment::open(SegmentId::AUTO, 4096).unwrap();
    let peer = Segment::open(owner.id(), 100).unwrap();
    assert_eq!(peer.len(), 100);
    let whole = Segment::open(owner.id(), 1 << 20).unwrap();
    assert_eq!(whole.len(), 4096);
}

#[test]
fn test_zero_size_owner_gets_a_page() {
    let mapper = Mapper::default();
    let owner = mapper.open_segment(SegmentId::AUTO, 0).unwrap();
    assert_eq!(owner.len(), mapper.config().page_size());
}

#[test]
fn test_attach_auto_is_rejected() {
    assert!(matches!(Segment::attach(SegmentId::AUTO), Err(Error::InvalidArgument(_))));
}

#[test]
fn test_key_exhausted() {
    let mapper = Mapper::new(crate::Config::from_env().with_key_attempts(3));
    let taken = Segment::options().size(16).open_with(&mapper, SegmentId::AUTO).unwrap();
    let id = taken.id();

    let mut calls = 0;
    let mut same = |_max: i64| {
        calls += 1;
        id
    };
    match Segment::options().size(16).open_with_keys(&mapper, SegmentId::AUTO, &mut same) {
        Err(Error::KeyExhausted { attempts: 3 }) => {}
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(calls, 3);
}

#[test]
fn test_key_collision_retries() {
    let mapper = Mapper::default();
    let taken = Segment::options().size(16).open_with(&mapper, SegmentId::AUTO).unwrap();
    let fresh = loop {
        let id = RandomKeys.next_key(MAX_KEY);
        if id != taken.id() {
            break id;
        }
    };

    let mut ids = vec![fresh, taken.id()];
    let mut keys = |_max: i64| ids.pop().unwrap_or(SegmentId::AUTO);
    let seg = Segment::options().size(16).open_with_keys(&mapper, SegmentId::AUTO, &mut keys).unwrap();
    assert_eq!(seg.id(), fresh);
    assert!(seg.is_owner());
}

#[test]
fn test_attach_missing_segment() {
    let mapper = Mapper::default();
    let id = {
        let mut seg = mapper.open_segment(SegmentId::AUTO, 16).unwrap();
        let id = seg.id();
        seg.close().unwrap();
        id
    };
    assert!(matches!(mapper.open_segment(id, 0), Err(Error::SegmentNotFound { .. })));
}

#[test]
fn test_segment_io_traits() {
    use std::io::{Read, Seek, Write};

    let mut seg = Segment::open(SegmentId::AUTO, 8).unwrap();
    assert_eq!(Write::write(&mut seg, b"0123456789").unwrap(), 8);
    Seek::seek(&mut seg, SeekFrom::Start(2)).unwrap();
    let mut out = Vec::new();
    Read::read_to_end(&mut seg, &mut out).unwrap();
    assert_eq!(out, b"234567");
}
