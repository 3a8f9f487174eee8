use std::fmt;

use rand::Rng;

/// Process-external name of a shared segment.
///
/// `SegmentId::AUTO` asks [`Segment::open`](crate::Segment::open) to create a
/// fresh segment under a newly drawn id; any other value attaches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(i64);

impl SegmentId {
    pub const AUTO: SegmentId = SegmentId(0);

    pub fn new(raw: i64) -> Self {
        SegmentId(raw)
    }

    pub fn as_raw(&self) -> i64 {
        self.0
    }

    pub fn is_auto(&self) -> bool {
        *self == SegmentId::AUTO
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for SegmentId {
    fn from(raw: i64) -> Self {
        SegmentId(raw)
    }
}

/// Produces candidate ids for new segments.
pub trait KeySource {
    /// Returns an id in `1..=max`. Must never return `SegmentId::AUTO`.
    fn next_key(&mut self, max: i64) -> SegmentId;
}

/// Uniformly random ids from the thread-local generator.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomKeys;

impl KeySource for RandomKeys {
    fn next_key(&mut self, max: i64) -> SegmentId {
        SegmentId(rand::thread_rng().gen_range(1..=max.max(1)))
    }
}

impl<F> KeySource for F
    where F: FnMut(i64) -> SegmentId
{
    fn next_key(&mut self, max: i64) -> SegmentId {
        self(max)
    }
}

#[test]
fn test_random_keys_never_auto() {
    let mut keys = RandomKeys;
    for _ in 0..10_000 {
        let id = keys.next_key(3);
        assert!(!id.is_auto());
        assert!((1..=3).contains(&id.as_raw()));
    }
}

#[test]
fn test_closure_source() {
    let mut next = 41;
    let mut keys = |_max: i64| {
        next += 1;
        SegmentId::new(next)
    };
    assert_eq!(keys.next_key(i64::MAX), SegmentId::new(42));
    assert_eq!(keys.next_key(i64::MAX), SegmentId::new(43));
}
