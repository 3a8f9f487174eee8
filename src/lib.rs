//! Memory-mapped files and shared memory segments behind one byte-cursor
//! interface.
//!
//! ```no_run
//! use std::io::SeekFrom;
//! use mapmem::{MapFile, Segment, SegmentId};
//!
//! let mut file = MapFile::options().read_write().create(true).size(64).open("data.bin")?;
//! file.write_at(b"hello", 0)?;
//! file.sync()?;
//!
//! let mut seg = Segment::open(SegmentId::AUTO, 4096)?;
//! seg.write(b"shared")?;
//! let mut peer = Segment::attach(seg.id())?;
//! peer.seek(SeekFrom::Start(0))?;
//! # Ok::<(), mapmem::Error>(())
//! ```

#[macro_use]
extern crate bitflags;

extern crate libc;

mod err;
pub use self::err::{Error, Result};

mod flags;
pub use self::flags::{Protection, Sharing};

mod config;
pub use self::config::{Config, DEBUG_ENV};

mod key;
pub use self::key::{KeySource, RandomKeys, SegmentId};

#[cfg_attr(not(windows), allow(dead_code))]
mod registry;

mod mapped_region;
pub use self::mapped_region::{Mapper, Region, SegmentHandle};

mod view;

mod map_file;
pub use self::map_file::{FileOptions, MapFile};

mod segment;
pub use self::segment::{Segment, SegmentOptions};
