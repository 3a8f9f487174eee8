//! Cursor bookkeeping over a region, shared by files and segments.

use std::io::SeekFrom;

use tracing::trace;

use crate::err::{Error, Result};
use crate::mapped_region::Region;

pub(crate) struct View {
    region: Option<Region>,
    pos: usize,
    writable: bool,
    trace: bool,
}

impl View {
    pub fn new(region: Region, writable: bool, trace: bool) -> Self {
        View { region: Some(region), pos: 0, writable, trace }
    }

    fn region(&self) -> Result<&Region> {
        self.region.as_ref().ok_or(Error::InvalidArgument("mapping is closed"))
    }

    pub fn is_closed(&self) -> bool {
        self.region.is_none()
    }

    pub fn len(&self) -> usize {
        self.region.as_ref().map_or(0, Region::len)
    }

    pub fn position(&self) -> u64 {
        self.pos as u64
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn as_slice(&self) -> Result<&[u8]> {
        Ok(self.region()?.as_slice())
    }

    pub fn region_ref(&self) -> Result<&Region> {
        self.region()
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        self.region.as_ref().and_then(|r| r.as_slice().get(index).copied())
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let pos = self.pos;
        let n = {
            let data = self.region()?.as_slice();
            if pos >= data.len() {
                return Err(Error::EndOfRegion { read: 0 });
            }
            let n = buf.len().min(data.len() - pos);
            buf[..n].copy_from_slice(&data[pos..pos + n]);
            n
        };
        self.pos += n;
        if self.trace {
            trace!(pos = self.pos, n, "read");
        }
        Ok(n)
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read(&mut byte)?;
        Ok(byte[0])
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = self.region()?.as_slice();
        if offset > data.len() as u64 {
            return Err(Error::InvalidOffset(offset));
        }
        let off = offset as usize;
        let n = buf.len().min(data.len() - off);
        buf[..n].copy_from_slice(&data[off..off + n]);
        if self.trace {
            trace!(offset, n, "read_at");
        }
        if n < buf.len() {
            return Err(Error::EndOfRegion { read: n });
        }
        Ok(n)
    }

    fn writable_region(&mut self) -> Result<&mut Region> {
        let writable = self.writable;
        let region = self.region.as_mut().ok_or(Error::InvalidArgument("mapping is closed"))?;
        if !writable {
            return Err(Error::NotWritable);
        }
        Ok(region)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let pos = self.pos;
        let n = {
            let data = self.writable_region()?.as_mut_slice();
            let n = buf.len().min(data.len().saturating_sub(pos));
            data[pos..pos + n].copy_from_slice(&buf[..n]);
            n
        };
        self.pos += n;
        if self.trace {
            trace!(pos = self.pos, n, "write");
        }
        if n < buf.len() {
            return Err(Error::ShortWrite { written: n });
        }
        Ok(n)
    }

    pub fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.write(&[byte]).map(|_| ())
    }

    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        let trace = self.trace;
        let data = self.writable_region()?.as_mut_slice();
        if offset > data.len() as u64 {
            return Err(Error::InvalidOffset(offset));
        }
        let off = offset as usize;
        let n = buf.len().min(data.len() - off);
        data[off..off + n].copy_from_slice(&buf[..n]);
        if trace {
            trace!(offset, n, "write_at");
        }
        if n < buf.len() {
            return Err(Error::ShortWrite { written: n });
        }
        Ok(n)
    }

    /// Moves the cursor. Targets outside `[0, len]` leave it where it was.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let len = self.region()?.len() as i128;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.pos as i128 + delta as i128,
            SeekFrom::End(delta) => len + delta as i128,
        };
        if target < 0 || target > len {
            return Err(Error::InvalidPosition(target));
        }
        self.pos = target as usize;
        if self.trace {
            trace!(pos = self.pos, len, "seek");
        }
        Ok(self.pos as u64)
    }

    /// Clears the region out of the view. The second call reports
    /// `AlreadyClosed`, which callers turn into a no-op.
    pub fn release(&mut self) -> Result<Region> {
        let region = self.region.take().ok_or(Error::AlreadyClosed)?;
        self.pos = 0;
        Ok(region)
    }
}

#[cfg(test)]
fn view_over(data: &mut Vec<u8>, writable: bool) -> View {
    let ptr = data.as_mut_ptr();
    let region = unsafe { Region::from_raw(ptr, data.len(), 0, crate::mapped_region::Kind::Empty) };
    View::new(region, writable, false)
}

#[test]
fn test_sequential_reads_stop_at_end() {
    let mut data = b"0123456789".to_vec();
    let mut view = view_over(&mut data, false);
    let mut buf = [0u8; 4];

    assert_eq!(view.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf, b"0123");
    assert_eq!(view.read(&mut buf).unwrap(), 4);
    assert_eq!(view.read(&mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], b"89");
    assert_eq!(view.position(), 10);

    match view.read(&mut buf) {
        Err(Error::EndOfRegion { read: 0 }) => {}
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(view.position(), 10);
}

#[test]
fn test_read_at_short_read() {
    let mut data = b"0123456789".to_vec();
    let view = view_over(&mut data, false);
    let mut buf = [0u8; 4];

    assert_eq!(view.read_at(&mut buf, 2).unwrap(), 4);
    assert_eq!(&buf, b"2345");
    match view.read_at(&mut buf, 8) {
        Err(Error::EndOfRegion { read: 2 }) => assert_eq!(&buf[..2], b"89"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(view.read_at(&mut buf, 11), Err(Error::InvalidOffset(11))));
    assert_eq!(view.position(), 0);
}

#[test]
fn test_read_only_rejects_writes() {
    let mut data = vec![0u8; 8];
    let mut view = view_over(&mut data, false);
    view.seek(SeekFrom::Start(3)).unwrap();

    assert!(matches!(view.write(b"ab"), Err(Error::NotWritable)));
    assert!(matches!(view.write_at(b"ab", 0), Err(Error::NotWritable)));
    assert!(matches!(view.write_byte(b'a'), Err(Error::NotWritable)));
    assert_eq!(view.position(), 3);
    drop(view);
    assert_eq!(data, vec![0u8; 8]);
}

#[test]
fn test_short_write_reports_partial_count() {
    let mut data = vec![0u8; 6];
    let mut view = view_over(&mut data, true);
    view.seek(SeekFrom::Start(4)).unwrap();

    match view.write(b"wxyz") {
        Err(Error::ShortWrite { written: 2 }) => {}
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(view.position(), 6);
    assert!(matches!(view.write(b"a"), Err(Error::ShortWrite { written: 0 })));
    assert_eq!(view.write(b"").unwrap(), 0);
    assert!(matches!(view.write_at(b"abc", 5), Err(Error::ShortWrite { written: 1 })));
    assert!(matches!(view.write_at(b"abc", 7), Err(Error::InvalidOffset(7))));
    drop(view);
    assert_eq!(&data, b"\0\0\0\0wa");
}

#[test]
fn test_seek_bounds() {
    let mut data = vec![0u8; 10];
    let mut view = view_over(&mut data, true);

    assert_eq!(view.seek(SeekFrom::End(-4)).unwrap(), 6);
    assert_eq!(view.seek(SeekFrom::Current(2)).unwrap(), 8);
    assert_eq!(view.seek(SeekFrom::End(0)).unwrap(), 10);
    assert!(matches!(view.seek(SeekFrom::Current(-11)), Err(Error::InvalidPosition(-1))));
    assert!(matches!(view.seek(SeekFrom::Start(11)), Err(Error::InvalidPosition(11))));
    assert!(matches!(view.seek(SeekFrom::End(1)), Err(Error::InvalidPosition(11))));
    assert_eq!(view.position(), 10);
}

#[test]
fn test_cursor_advances_by_total_written() {
    let mut data = vec![0u8; 32];
    let mut view = view_over(&mut data, true);
    let chunks: [&[u8]; 4] = [b"abc", b"", b"defgh", b"ij"];
    let total: usize = chunks.iter().map(|c| c.len()).sum();

    for chunk in chunks.iter() {
        view.write(chunk).unwrap();
    }
    assert_eq!(view.position(), total as u64);

    view.seek(SeekFrom::Start(0)).unwrap();
    let mut buf = [0u8; 5];
    view.read(&mut buf).unwrap();
    view.read(&mut buf).unwrap();
    assert_eq!(view.position(), 10);
}

#[test]
fn test_release_once() {
    let mut data = vec![0u8; 4];
    let mut view = view_over(&mut data, true);

    assert!(view.release().is_ok());
    assert!(view.is_closed());
    assert!(matches!(view.release(), Err(Error::AlreadyClosed)));
    assert!(matches!(view.read(&mut [0u8; 1]), Err(Error::InvalidArgument(_))));
    assert!(matches!(view.write(b"a"), Err(Error::InvalidArgument(_))));
    assert!(matches!(view.seek(SeekFrom::Start(0)), Err(Error::InvalidArgument(_))));
    assert_eq!(view.len(), 0);
}
