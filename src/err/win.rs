use std::io;

use windows_sys::Win32::Foundation::{GetLastError, ERROR_ALREADY_EXISTS, ERROR_FILE_NOT_FOUND};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct ErrCode(u32);

impl ErrCode {
    pub fn last_error() -> Self {
        ErrCode(unsafe { GetLastError() })
    }
}

impl From<ErrCode> for io::Error {
    fn from(ec: ErrCode) -> Self {
        io::Error::from_raw_os_error(ec.0 as i32)
    }
}

pub const ALREADY_EXISTS: ErrCode = ErrCode(ERROR_ALREADY_EXISTS);
pub const FILE_NOT_FOUND: ErrCode = ErrCode(ERROR_FILE_NOT_FOUND);
