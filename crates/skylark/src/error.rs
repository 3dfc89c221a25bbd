use core::{error::Error, fmt::Display};

/// Errors surfaced by futex operations, named after the POSIX codes guest
/// code expects.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// The value at the address no longer matches the expectation.
    Again = 11,
    /// A bitset variant was invoked with an empty bitset.
    Inval = 22,
    /// Unrecognized operation, or a flag invalid for the operation.
    NoSys = 38,
    /// The wait deadline passed before a matching wake arrived.
    TimedOut = 110,
}

impl Errno {
    /// The negative return code handed back across the dispatcher boundary.
    pub fn as_return_code(self) -> isize {
        -(self as i32 as isize)
    }
}

impl Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Errno::Again => "EAGAIN",
            Errno::Inval => "EINVAL",
            Errno::NoSys => "ENOSYS",
            Errno::TimedOut => "ETIMEDOUT",
        };
        write!(f, "{}", name)
    }
}

impl Error for Errno {}

pub type OpResult = Result<usize, Errno>;
