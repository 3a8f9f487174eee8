//! Access intents. Each backend resolves these to native constants through
//! its own table and refuses the combinations it cannot express.

/// How a region may be accessed once mapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protection {
    ReadOnly,
    /// Mapped read-write at the OS level; neither backend can express a
    /// write-only view portably.
    WriteOnly,
    ReadWrite,
    ReadExecute,
    /// Writes stay in this process and never reach the backing object.
    CopyOnWrite,
}

/// Whether writes through a mapping are visible to other mappers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Sharing {
    Shared,
    Private,
}

impl Protection {
    pub fn writable(&self) -> bool {
        match *self {
            Protection::WriteOnly | Protection::ReadWrite | Protection::CopyOnWrite => true,
            Protection::ReadOnly | Protection::ReadExecute => false,
        }
    }

    /// Whether the backing file has to be opened with write access.
    pub(crate) fn needs_write_handle(&self) -> bool {
        match *self {
            Protection::WriteOnly | Protection::ReadWrite => true,
            Protection::ReadOnly | Protection::ReadExecute | Protection::CopyOnWrite => false,
        }
    }

    /// The sharing mode a file mapping gets when the caller does not pick one.
    pub fn default_sharing(&self) -> Sharing {
        match *self {
            Protection::CopyOnWrite => Sharing::Private,
            _ => Sharing::Shared,
        }
    }
}

impl Default for Protection {
    fn default() -> Self {
        Protection::ReadOnly
    }
}

#[test]
fn test_writable() {
    assert!(!Protection::ReadOnly.writable());
    assert!(!Protection::ReadExecute.writable());
    assert!(Protection::WriteOnly.writable());
    assert!(Protection::ReadWrite.writable());
    assert!(Protection::CopyOnWrite.writable());
}

#[test]
fn test_copy_on_write_never_needs_write_handle() {
    assert!(!Protection::CopyOnWrite.needs_write_handle());
    assert_eq!(Protection::CopyOnWrite.default_sharing(), Sharing::Private);
    assert_eq!(Protection::ReadWrite.default_sharing(), Sharing::Shared);
}
