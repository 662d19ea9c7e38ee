// Uniform I/O. Every open file, device endpoint, or pipe end is an
// Arc<dyn Uio>; duplicating a descriptor clones the Arc and the backing
// endpoint tears down when the last clone drops.

use alloc::sync::Arc;

use crate::error::{Error, Result};

pub const FCNTL_GETEND: i32 = 0; // arg returns size in bytes
pub const FCNTL_SETEND: i32 = 1; // arg holds new size, zero-filled growth
pub const FCNTL_GETPOS: i32 = 2; // arg returns current position
pub const FCNTL_SETPOS: i32 = 3; // arg holds new position

pub trait Uio: Send + Sync {
    fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::NotSup)
    }

    fn write(&self, _buf: &[u8]) -> Result<usize> {
        Err(Error::NotSup)
    }

    fn cntl(&self, _op: i32, _arg: &mut u64) -> Result<()> {
        Err(Error::NotSup)
    }
}

pub type UioRef = Arc<dyn Uio>;

/// Accepts all writes, returns EOF on read.
pub struct NullUio;

impl NullUio {
    pub fn open() -> UioRef {
        Arc::new(NullUio)
    }
}

impl Uio for NullUio {
    fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        Ok(buf.len())
    }
}
