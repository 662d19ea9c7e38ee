// Block storage interface. Positions are byte offsets and must be multiples
// of the block size; fetch and store report bytes transferred, and a short
// transfer is the caller's problem to treat as an I/O error.

use crate::error::Result;

pub trait Storage: Send + Sync {
    fn blksz(&self) -> usize;

    /// Total capacity in bytes.
    fn size(&self) -> u64;

    fn fetch(&self, pos: u64, buf: &mut [u8]) -> Result<usize>;

    fn store(&self, pos: u64, buf: &[u8]) -> Result<usize>;
}
