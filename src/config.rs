use std::env;

use crate::mapped_region;

/// Environment variable that turns on per-operation trace events.
pub const DEBUG_ENV: &str = "MAPMEM_DEBUG";

const DEFAULT_KEY_ATTEMPTS: u32 = 8;

/// Settings resolved once and handed to a [`Mapper`](crate::Mapper).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    page_size: usize,
    granularity: usize,
    key_attempts: u32,
    debug: bool,
}

impl Config {
    /// Queries the OS for its page size and allocation granularity and
    /// reads `MAPMEM_DEBUG`.
    pub fn from_env() -> Self {
        let (page_size, granularity) = mapped_region::system_page_size();
        Config {
            page_size,
            granularity,
            key_attempts: DEFAULT_KEY_ATTEMPTS,
            debug: env::var_os(DEBUG_ENV).map_or(false, |v| !v.is_empty()),
        }
    }

    /// Rounded up to the next power of two.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        let page_size = page_size.max(1).next_power_of_two();
        self.page_size = page_size;
        if self.granularity < page_size {
            self.granularity = page_size;
        }
        self
    }

    pub fn with_key_attempts(mut self, attempts: u32) -> Self {
        self.key_attempts = attempts.max(1);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Size of a fresh segment when the caller asks for zero bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Alignment required of file offsets handed to the OS. Equal to the
    /// page size on POSIX; the allocation granularity on Windows.
    pub fn granularity(&self) -> usize {
        self.granularity
    }

    pub fn key_attempts(&self) -> u32 {
        self.key_attempts
    }

    pub fn debug(&self) -> bool {
        self.debug
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::from_env()
    }
}

#[test]
fn test_from_env_page_size() {
    let config = Config::from_env();
    assert!(config.page_size().is_power_of_two());
    assert!(config.granularity() >= config.page_size());
    assert_eq!(config.key_attempts(), DEFAULT_KEY_ATTEMPTS);
}

#[test]
fn test_overrides() {
    let config = Config::from_env()
        .with_page_size(1 << 16)
        .with_key_attempts(0)
        .with_debug(true);
    assert_eq!(config.page_size(), 1 << 16);
    assert!(config.granularity() >= 1 << 16);
    assert_eq!(config.key_attempts(), 1);
    assert!(config.debug());
}

#[test]
fn test_page_size_rounds_up() {
    let config = Config::from_env().with_page_size(5000);
    assert_eq!(config.page_size(), 8192);
    assert!(config.granularity() >= 8192);
    assert_eq!(Config::from_env().with_page_size(0).page_size(), 1);
    assert_eq!(Config::from_env().with_page_size(4096).page_size(), 4096);
}
