//! Files mapped into memory with a read/write cursor on top.

use std::fs::{File, Metadata, OpenOptions};
use std::io::{self, SeekFrom};
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
#[cfg(windows)]
use std::os::windows::io::{AsRawHandle, RawHandle};

use tracing::{debug, warn};

use crate::err::{Error, Result};
use crate::flags::{Protection, Sharing};
use crate::mapped_region::{Mapper, Region};
use crate::view::View;

/// Builder for [`MapFile`], in the spirit of `std::fs::OpenOptions`.
#[derive(Clone, Debug)]
pub struct FileOptions {
    protection: Protection,
    sharing: Option<Sharing>,
    create: bool,
    size: usize,
    offset: u64,
    #[cfg(unix)]
    mode: u32,
}

impl FileOptions {
    pub fn new() -> Self {
        FileOptions {
            protection: Protection::ReadOnly,
            sharing: None,
            create: false,
            size: 0,
            offset: 0,
            #[cfg(unix)]
            mode: 0o644,
        }
    }

    pub fn protection(&mut self, protection: Protection) -> &mut Self {
        self.protection = protection;
        self
    }

    pub fn read_only(&mut self) -> &mut Self {
        self.protection(Protection::ReadOnly)
    }

    pub fn write_only(&mut self) -> &mut Self {
        self.protection(Protection::WriteOnly)
    }

    pub fn read_write(&mut self) -> &mut Self {
        self.protection(Protection::ReadWrite)
    }

    pub fn copy_on_write(&mut self) -> &mut Self {
        self.protection(Protection::CopyOnWrite)
    }

    /// Overrides the sharing mode implied by the protection.
    pub fn sharing(&mut self, sharing: Sharing) -> &mut Self {
        self.sharing = Some(sharing);
        self
    }

    /// Creates the file if it is missing.
    pub fn create(&mut self, create: bool) -> &mut Self {
        self.create = create;
        self
    }

    /// Minimum number of bytes to map. Writable opens grow the file to
    /// `offset + size` first; read-only opens ignore it.
    pub fn size(&mut self, size: usize) -> &mut Self {
        self.size = size;
        self
    }

    /// Maps from this file offset. Need not be page aligned.
    pub fn offset(&mut self, offset: u64) -> &mut Self {
        self.offset = offset;
        self
    }

    /// Permission bits for a newly created file.
    #[cfg(unix)]
    pub fn mode(&mut self, mode: u32) -> &mut Self {
        self.mode = mode;
        self
    }

    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<MapFile> {
        self.open_with(&Mapper::shared(), path)
    }

    pub fn open_with<P: AsRef<Path>>(&self, mapper: &Mapper, path: P) -> Result<MapFile> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("empty path"));
        }
        let protection = self.protection;
        let sharing = self.sharing.unwrap_or_else(|| protection.default_sharing());
        let write_handle = protection.needs_write_handle();
        let wanted = if write_handle {
            self.offset.checked_add(self.size as u64).ok_or(Error::InvalidOffset(self.offset))?
        } else {
            self.offset
        };

        let file = self.file_open(path, write_handle)?;
        let file_size = file.metadata()?.len();

        let len = if write_handle {
            if file_size < wanted {
                file.set_len(wanted)?;
            }
            file_size.max(wanted) - self.offset
        } else {
            if self.offset > file_size {
                return Err(Error::InvalidOffset(self.offset));
            }
            file_size - self.offset
        };
        if len > usize::max_value() as u64 {
            return Err(Error::InvalidArgument("file is too large to map"));
        }
        let len = len as usize;

        let region = if len == 0 {
            if mapper.config().debug() {
                debug!(path = %path.display(), ?protection, "empty file, nothing mapped");
            }
            Region::empty()
        } else {
            mapper.map_file_region(&file, self.offset, len, protection, sharing)?
        };

        Ok(MapFile {
            mapper: mapper.clone(),
            file: Some(file),
            view: View::new(region, protection.writable(), mapper.config().debug()),
            protection,
            sharing,
        })
    }

    fn file_open(&self, path: &Path, write_handle: bool) -> Result<File> {
        let mut options = OpenOptions::new();
        options.read(true);
        #[cfg(unix)]
        options.mode(self.mode);

        if write_handle {
            options.write(true).create(self.create);
        } else if self.create {
            // std refuses `create` without write access; create it empty first.
            let mut creator = OpenOptions::new();
            creator.append(true).create(true);
            #[cfg(unix)]
            creator.mode(self.mode);
            creator.open(path)?;
        }
        Ok(options.open(path)?)
    }
}

impl Default for FileOptions {
    fn default() -> Self {
        FileOptions::new()
    }
}

/// A file mapped into memory, read and written through a cursor.
///
/// The mapping length is fixed at open time: writes never grow the file,
/// they stop at the end of the region with [`Error::ShortWrite`].
pub struct MapFile {
    mapper: Mapper,
    file: Option<File>,
    view: View,
    protection: Protection,
    sharing: Sharing,
}

impl MapFile {
    /// Maps the whole file read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<MapFile> {
        FileOptions::new().open(path)
    }

    pub fn options() -> FileOptions {
        FileOptions::new()
    }

    /// Length of the mapped region in bytes. Zero once closed.
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

    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Byte at `index`, or `None` past the end or after close.
    pub fn get(&self, index: usize) -> Option<u8> {
        self.view.get(index)
    }

    /// Borrows the mapped bytes without copying.
    pub fn as_slice(&self) -> Result<&[u8]> {
        self.view.as_slice()
    }

    /// Copies from the cursor and advances it. Fails with `EndOfRegion`
    /// once the cursor has reached the end.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.view.read(buf)
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        self.view.read_byte()
    }

    /// Copies from `offset` without touching the cursor. A short read
    /// reports `EndOfRegion` carrying the number of bytes copied.
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

    /// Writes dirty pages back to the file. Private mappings have nothing
    /// to write back and succeed trivially.
    pub fn sync(&self) -> Result<()> {
        let region = self.view.region_ref()?;
        if !self.view.writable() {
            return Err(Error::NotWritable);
        }
        match self.sharing {
            Sharing::Shared => self.mapper.flush(region),
            Sharing::Private => Ok(()),
        }
    }

    pub fn stat(&self) -> Result<Metadata> {
        let file = self.file.as_ref().ok_or(Error::InvalidArgument("mapping is closed"))?;
        Ok(file.metadata()?)
    }

    #[cfg(unix)]
    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(AsRawFd::as_raw_fd)
    }

    #[cfg(windows)]
    pub fn as_raw_handle(&self) -> Option<RawHandle> {
        self.file.as_ref().map(AsRawHandle::as_raw_handle)
    }

    /// Syncs, unmaps and closes the file. A failed sync does not stop the
    /// unmap; the first error is returned. Closing again does nothing.
    pub fn close(&mut self) -> Result<()> {
        let region = match self.view.release() {
            Ok(region) => region,
            Err(Error::AlreadyClosed) => return Ok(()),
            Err(err) => return Err(err),
        };
        let synced = if self.view.writable() && self.sharing == Sharing::Shared {
            self.mapper.flush(&region)
        } else {
            Ok(())
        };
        let unmapped = self.mapper.unmap_region(region);
        self.file.take();
        synced.and(unmapped)
    }
}

impl Drop for MapFile {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(%err, "failed to close mapped file");
        }
    }
}

impl std::fmt::Debug for MapFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapFile")
            .field("len", &self.len())
            .field("position", &self.position())
            .field("protection", &self.protection)
            .field("sharing", &self.sharing)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl io::Read for MapFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match MapFile::read(self, buf) {
            Ok(n) => Ok(n),
            Err(Error::EndOfRegion { read }) => Ok(read),
            Err(err) => Err(err.into()),
        }
    }
}

impl io::Write for MapFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match MapFile::write(self, buf) {
            Ok(n) => Ok(n),
            Err(Error::ShortWrite { written }) if written > 0 => Ok(written),
            Err(err) => Err(err.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.is_writable() {
            return Ok(());
        }
        self.sync().map_err(Into::into)
    }
}

impl io::Seek for MapFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        MapFile::seek(self, pos).map_err(Into::into)
    }
}

#[cfg(test)]
fn seeded(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_open_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let want: Vec<u8> = (0..200u8).collect();
    let path = seeded(&dir, "ro.bin", &want);

    let mut f = MapFile::open(&path).unwrap();
    assert!(!f.is_writable());
    assert_eq!(f.len(), want.len());
    assert_eq!(f.stat().unwrap().len(), want.len() as u64);
    assert_eq!(f.as_slice().unwrap(), &want[..]);
    assert_eq!(f.get(32), Some(want[32]));
    assert_eq!(f.get(200), None);

    let mut buf = [0u8; 32];
    assert_eq!(f.read(&mut buf).unwrap(), 32);
    assert_eq!(&buf[..], &want[..32]);
    assert_eq!(f.seek(SeekFrom::Current(0)).unwrap(), 32);

    f.seek(SeekFrom::Start(32)).unwrap();
    assert_eq!(f.read_byte().unwrap(), want[32]);
    f.seek(SeekFrom::Current(32)).unwrap();
    assert_eq!(f.read_byte().unwrap(), want[65]);
    f.seek(SeekFrom::End(-32)).unwrap();
    assert_eq!(f.read_byte().unwrap(), want[want.len() - 32]);

    assert!(matches!(f.sync(), Err(Error::NotWritable)));
    let pos = f.position();
    assert!(matches!(f.write(b"hello"), Err(Error::NotWritable)));
    assert!(matches!(f.write_at(b"hello", 0), Err(Error::NotWritable)));
    assert!(matches!(f.write_byte(b'h'), Err(Error::NotWritable)));
    assert_eq!(f.position(), pos);

    f.close().unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), want);
}

#[test]
fn test_write_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let path = seeded(&dir, "rw.txt", b"hello world!\nbye.\n");

    let mut f = MapFile::options().read_write().open(&path).unwrap();
    assert_eq!(f.write_at(b"bye!\n", 3).unwrap(), 5);
    assert_eq!(std::fs::read(&path).unwrap(), b"helbye!\nrld!\nbye.\n");

    assert_eq!(f.seek(SeekFrom::Start(0)).unwrap(), 0);
    assert_eq!(f.write(b"hello world!\nbye\n").unwrap(), 17);
    assert_eq!(std::fs::read(&path).unwrap(), b"hello world!\nbye\n\n");

    assert_eq!(f.seek(SeekFrom::End(-5)).unwrap(), 13);
    f.write_byte(b't').unwrap();
    f.sync().unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"hello world!\ntye\n\n");
    f.close().unwrap();
}

#[test]
fn test_zero_length_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.bin");

    let mut f = MapFile::options().create(true).open(&path).unwrap();
    assert!(path.exists());
    assert!(f.is_empty());
    assert!(matches!(f.read(&mut [0u8; 4]), Err(Error::EndOfRegion { read: 0 })));
    assert!(matches!(f.read_byte(), Err(Error::EndOfRegion { read: 0 })));
    assert!(matches!(f.read_at(&mut [0u8; 4], 0), Err(Error::EndOfRegion { read: 0 })));
    f.close().unwrap();
}

#[test]
fn test_size_hint_grows_writable_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grown.bin");

    let mut f = MapFile::options().read_write().create(true).size(64).open(&path).unwrap();
    assert_eq!(f.len(), 64);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 64);

    let payload = [0xabu8; 64];
    assert_eq!(f.write(&payload).unwrap(), 64);
    assert!(matches!(f.write(b"x"), Err(Error::ShortWrite { written: 0 })));
    f.close().unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), payload.to_vec());
}

#[test]
fn test_read_only_ignores_size_hint() {
    let dir = tempfile::tempdir().unwrap();
    let path = seeded(&dir, "small.bin", b"abc");

    let f = MapFile::options().size(4096).open(&path).unwrap();
    assert_eq!(f.len(), 3);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 3);
}

#[test]
fn test_offset_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
    let path = seeded(&dir, "offset.bin", &content);

    let f = MapFile::options().offset(5000).open(&path).unwrap();
    assert_eq!(f.len(), 5000);
    let mut buf = [0u8; 10];
    f.read_at(&mut buf, 0).unwrap();
    assert_eq!(&buf[..], &content[5000..5010]);

    match MapFile::options().offset(10_001).open(&path) {
        Err(Error::InvalidOffset(10_001)) => {}
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_round_trip_between_instances() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.bin");

    let mut writer = MapFile::options().read_write().create(true).size(128).open(&path).unwrap();
    let reader = MapFile::open(&path).unwrap();

    let data = b"mapped both ways";
    writer.write_at(data, 40).unwrap();
    let mut buf = vec![0u8; data.len()];
    assert_eq!(reader.read_at(&mut buf, 40).unwrap(), data.len());
    assert_eq!(&buf[..], &data[..]);
}

#[test]
fn test_copy_on_write_leaves_file_alone() {
    let dir = tempfile::tempdir().unwrap();
    let path = seeded(&dir, "cow.txt", b"original");

    let mut f = MapFile::options().copy_on_write().open(&path).unwrap();
    assert!(f.is_writable());
    f.write(b"modified").unwrap();
    assert_eq!(f.as_slice().unwrap(), b"modified");
    f.sync().unwrap();
    f.close().unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"original");
}

#[test]
fn test_close_twice() {
    let dir = tempfile::tempdir().unwrap();
    let path = seeded(&dir, "twice.txt", b"data");

    let mut f = MapFile::options().read_write().open(&path).unwrap();
    f.close().unwrap();
    assert!(f.is_closed());
    f.close().unwrap();
    assert_eq!(f.len(), 0);
    #[cfg(unix)]
    assert!(f.as_raw_fd().is_none());
    #[cfg(windows)]
    assert!(f.as_raw_handle().is_none());
    assert!(matches!(f.read(&mut [0u8; 1]), Err(Error::InvalidArgument(_))));
    assert!(matches!(f.sync(), Err(Error::InvalidArgument(_))));
    assert!(matches!(f.stat(), Err(Error::InvalidArgument(_))));
}

#[test]
fn test_std_io_traits() {
    use std::io::{Read, Seek, Write};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("io.txt");

    let mut f = MapFile::options().read_write().create(true).size(8).open(&path).unwrap();
    assert_eq!(Write::write(&mut f, b"0123456789").unwrap(), 8);
    assert_eq!(Write::write(&mut f, b"x").unwrap_err().kind(), io::ErrorKind::WriteZero);
    Write::flush(&mut f).unwrap();

    Seek::seek(&mut f, SeekFrom::Start(0)).unwrap();
    let mut out = Vec::new();
    Read::read_to_end(&mut f, &mut out).unwrap();
    assert_eq!(out, b"01234567");
    assert_eq!(Seek::seek(&mut f, SeekFrom::End(1)).unwrap_err().kind(), io::ErrorKind::InvalidInput);
}

#[test]
fn test_offset_overflow_leaves_file_alone() {
    let dir = tempfile::tempdir().unwrap();
    let path = seeded(&dir, "huge.bin", b"abc");

    let offset = u64::max_value() - 1;
    match MapFile::options().read_write().offset(offset).size(16).open(&path) {
        Err(Error::InvalidOffset(got)) => assert_eq!(got, offset),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 3);
    assert!(matches!(MapFile::options().offset(offset).open(&path), Err(Error::InvalidOffset(_))));
}

#[test]
fn test_empty_path() {
    assert!(matches!(MapFile::open(""), Err(Error::InvalidArgument(_))));
}
