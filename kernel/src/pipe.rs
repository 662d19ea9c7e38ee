// Unidirectional pipe: a one-page ring buffer with a uio endpoint on each
// side. Readers sleep while the pipe is empty and a writer exists; writers
// sleep while it is full and a reader exists. Closing an end wakes the peer
// so it can observe the closed state; the channel itself lives until the
// last reference (including any blocked caller's) goes away.

use core::cell::UnsafeCell;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::intr::{disable_interrupts, restore_interrupts};
use crate::thread::Condition;
use crate::uio::{Uio, UioRef};

const PIPE_CAPACITY: usize = 4096;

struct PipeState {
    storage: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    used: usize,
    reader_alive: bool,
    writer_alive: bool,
}

struct PipeChan {
    readable: Condition,
    writable: Condition,
    state: UnsafeCell<PipeState>,
}

unsafe impl Sync for PipeChan {}
unsafe impl Send for PipeChan {}

impl PipeChan {
    #[allow(clippy::mut_from_ref)]
    unsafe fn state(&self) -> &mut PipeState {
        &mut *self.state.get()
    }
}

struct PipeWriter(Arc<PipeChan>);
struct PipeReader(Arc<PipeChan>);

/// Returns the (writer, reader) endpoints of a fresh pipe.
pub fn create_pipe() -> (UioRef, UioRef) {
    let chan = Arc::new(PipeChan {
        readable: Condition::new("pipe.readable"),
        writable: Condition::new("pipe.writable"),
        state: UnsafeCell::new(PipeState {
            storage: vec![0; PIPE_CAPACITY],
            read_pos: 0,
            write_pos: 0,
            used: 0,
            reader_alive: true,
            writer_alive: true,
        }),
    });
    (
        Arc::new(PipeWriter(chan.clone())),
        Arc::new(PipeReader(chan)),
    )
}

impl Uio for PipeReader {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let chan = &*self.0;
        let mut copied = 0;

        let pie = disable_interrupts();
        loop {
            let st = unsafe { chan.state() };
            if st.used == 0 {
                if !st.writer_alive {
                    // EOF, or whatever partial progress was made.
                    restore_interrupts(pie);
                    return Ok(copied);
                }
                chan.readable.wait();
                continue;
            }

            while st.used > 0 && copied < buf.len() {
                let chunk = (buf.len() - copied)
                    .min(st.used)
                    .min(PIPE_CAPACITY - st.read_pos);
                buf[copied..copied + chunk]
                    .copy_from_slice(&st.storage[st.read_pos..st.read_pos + chunk]);
                st.read_pos = (st.read_pos + chunk) % PIPE_CAPACITY;
                st.used -= chunk;
                copied += chunk;
            }
            chan.writable.broadcast();
            restore_interrupts(pie);
            return Ok(copied);
        }
    }
}

impl Uio for PipeWriter {
    fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let chan = &*self.0;
        let mut transferred = 0;

        let pie = disable_interrupts();
        while transferred < buf.len() {
            let st = unsafe { chan.state() };
            if !st.reader_alive {
                restore_interrupts(pie);
                return if transferred > 0 {
                    Ok(transferred)
                } else {
                    Err(Error::Pipe)
                };
            }
            if st.used == PIPE_CAPACITY {
                chan.writable.wait();
                continue;
            }

            let chunk = (buf.len() - transferred)
                .min(PIPE_CAPACITY - st.used)
                .min(PIPE_CAPACITY - st.write_pos);
            st.storage[st.write_pos..st.write_pos + chunk]
                .copy_from_slice(&buf[transferred..transferred + chunk]);
            st.write_pos = (st.write_pos + chunk) % PIPE_CAPACITY;
            st.used += chunk;
            transferred += chunk;

            chan.readable.broadcast();
        }
        restore_interrupts(pie);
        Ok(transferred)
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let pie = disable_interrupts();
        unsafe { self.0.state().writer_alive = false };
        self.0.readable.broadcast();
        restore_interrupts(pie);
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let pie = disable_interrupts();
        unsafe { self.0.state().reader_alive = false };
        self.0.writable.broadcast();
        restore_interrupts(pie);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single-threaded coverage: the blocking paths need the scheduler, but
    // the transfer, EOF and broken-pipe rules do not.

    #[test]
    fn write_then_read_then_eof() {
        let _g = crate::test_guard();
        let (w, r) = create_pipe();
        assert_eq!(w.write(b"abc"), Ok(3));
        drop(w);

        let mut buf = [0u8; 16];
        assert_eq!(r.read(&mut buf), Ok(3));
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(r.read(&mut buf), Ok(0));
    }

    #[test]
    fn writer_without_reader_sees_broken_pipe() {
        let _g = crate::test_guard();
        let (w, r) = create_pipe();
        drop(r);
        assert_eq!(w.write(b"abc"), Err(Error::Pipe));
    }

    #[test]
    fn ring_wraps_across_many_transfers() {
        let _g = crate::test_guard();
        let (w, r) = create_pipe();
        let chunk: Vec<u8> = (0..100u8).collect();
        let mut buf = [0u8; 100];
        // Push the ring through several wraps of the page-sized buffer.
        for _ in 0..200 {
            assert_eq!(w.write(&chunk), Ok(100));
            assert_eq!(r.read(&mut buf), Ok(100));
            assert_eq!(&buf[..], &chunk[..]);
        }
    }

    #[test]
    fn reads_are_not_supported_on_the_write_end() {
        let _g = crate::test_guard();
        let (w, r) = create_pipe();
        let mut buf = [0u8; 4];
        assert_eq!(w.read(&mut buf), Err(Error::NotSup));
        assert_eq!(r.write(b"x"), Err(Error::NotSup));
    }
}
