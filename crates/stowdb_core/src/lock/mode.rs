//! Lock modes.

use std::fmt;

/// Access mode of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    /// Shared access. Any number of readers may hold it together.
    Read,
    /// Exclusive access.
    Write,
}

impl LockMode {
    /// Whether two different transactions may hold these modes at once.
    #[must_use]
    pub const fn compatible_with(self, other: Self) -> bool {
        matches!((self, other), (Self::Read, Self::Read))
    }

    /// Whether holding `self` already satisfies a request for `requested`.
    #[must_use]
    pub const fn covers(self, requested: Self) -> bool {
        matches!((self, requested), (Self::Write, _) | (Self::Read, Self::Read))
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_readers_share() {
        assert!(LockMode::Read.compatible_with(LockMode::Read));
        assert!(!LockMode::Read.compatible_with(LockMode::Write));
        assert!(!LockMode::Write.compatible_with(LockMode::Read));
        assert!(!LockMode::Write.compatible_with(LockMode::Write));
    }

    #[test]
    fn write_covers_read() {
        assert!(LockMode::Write.covers(LockMode::Read));
        assert!(LockMode::Write.covers(LockMode::Write));
        assert!(LockMode::Read.covers(LockMode::Read));
        assert!(!LockMode::Read.covers(LockMode::Write));
        assert!(LockMode::Read < LockMode::Write);
    }
}
