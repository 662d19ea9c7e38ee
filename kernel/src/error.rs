// Kernel error numbers. Negative values of these codes are what crosses the
// syscall boundary in a0; inside the kernel everything is Result-based.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(i32)]
pub enum Error {
    #[error("invalid argument")]
    Inval = 1,
    #[error("device or resource busy")]
    Busy = 2,
    #[error("operation not supported")]
    NotSup = 3,
    #[error("I/O error")]
    Io = 4,
    #[error("bad format")]
    BadFmt = 5,
    #[error("no such file or directory")]
    NoEnt = 6,
    #[error("permission denied")]
    Access = 7,
    #[error("file descriptor in bad state")]
    BadFd = 8,
    #[error("too many open files")]
    MFile = 9,
    #[error("too many processes")]
    MProc = 10,
    #[error("too many threads")]
    MThr = 11,
    #[error("no child process")]
    Child = 12,
    #[error("out of memory")]
    NoMem = 13,
    #[error("broken pipe")]
    Pipe = 14,
    #[error("object exists")]
    Exists = 15,
    #[error("no free data blocks")]
    NoDataBlks = 16,
    #[error("no free inode blocks")]
    NoInodeBlks = 17,
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// The negative integer form returned to user code.
    pub fn code(self) -> i64 {
        -(self as i32 as i64)
    }
}

/// Flattens a syscall handler result into the a0 register convention.
pub fn sysret(r: Result<i64>) -> i64 {
    match r {
        Ok(v) => v,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn codes_are_negative_errnos() {
        assert_eq!(Error::Inval.code(), -1);
        assert_eq!(Error::NoEnt.code(), -6);
        assert_eq!(Error::NoInodeBlks.code(), -17);
        assert_eq!(sysret(Ok(42)), 42);
        assert_eq!(sysret(Err(Error::Busy)), -2);
    }

    #[test]
    fn display_matches_the_errno_names() {
        assert_eq!(Error::Pipe.to_string(), "broken pipe");
        assert_eq!(Error::Access.to_string(), "permission denied");
        assert_eq!(Error::NoDataBlks.to_string(), "no free data blocks");
    }
}
