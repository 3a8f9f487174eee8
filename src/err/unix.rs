use std::io;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct ErrCode(i32);

impl ErrCode {
    pub fn last_error() -> Self {
        ErrCode(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

impl From<ErrCode> for io::Error {
    fn from(ec: ErrCode) -> Self {
        io::Error::from_raw_os_error(ec.0)
    }
}

pub const FILE_EXISTS: ErrCode = ErrCode(libc::EEXIST);
pub const NO_SUCH_FILE_OR_DIRECTORY: ErrCode = ErrCode(libc::ENOENT);
pub const INVALID_ARGUMENT: ErrCode = ErrCode(libc::EINVAL);
pub const IDENTIFIER_REMOVED: ErrCode = ErrCode(libc::EIDRM);

#[test]
fn test_errcode_into_io_error() {
    let err: io::Error = FILE_EXISTS.into();
    assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    let err: io::Error = NO_SUCH_FILE_OR_DIRECTORY.into();
    assert_eq!(err.kind(), io::ErrorKind::NotFound);
}

#[test]
fn test_last_error() {
    let ret = unsafe { libc::close(-1) };
    assert_eq!(ret, -1);
    assert_eq!(ErrCode::last_error(), ErrCode(libc::EBADF));
}
