// ELF64 loader. Validates the header, maps each PT_LOAD segment into the
// active memory space, copies the file bytes in, zeroes the remainder, and
// tightens the permissions to what the program headers ask for.

use crate::error::{Error, Result};
use crate::memlayout::{UMEM_END_VMA, UMEM_START_VMA};
use crate::riscv::PAGE_SIZE;
use crate::uio::{UioRef, FCNTL_SETPOS};
use crate::vm::{alloc_and_map_range, set_range_flags, MapFlags};

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;

const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_RISCV: u16 = 243;

const PT_LOAD: u32 = 1;
const PF_X: u32 = 0x1;
const PF_W: u32 = 0x2;
const PF_R: u32 = 0x4;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

// Segment loads go through bounded reads.
const MAX_READ_SIZE: usize = 16 * 1024;

struct Ehdr {
    ident: [u8; 16],
    e_type: u16,
    machine: u16,
    entry: u64,
    phoff: u64,
    phentsize: u16,
    phnum: u16,
}

impl Ehdr {
    fn parse(b: &[u8; EHDR_SIZE]) -> Ehdr {
        Ehdr {
            ident: b[0..16].try_into().unwrap(),
            e_type: u16::from_le_bytes(b[16..18].try_into().unwrap()),
            machine: u16::from_le_bytes(b[18..20].try_into().unwrap()),
            entry: u64::from_le_bytes(b[24..32].try_into().unwrap()),
            phoff: u64::from_le_bytes(b[32..40].try_into().unwrap()),
            phentsize: u16::from_le_bytes(b[54..56].try_into().unwrap()),
            phnum: u16::from_le_bytes(b[56..58].try_into().unwrap()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.ident[0..4] != [0x7f, b'E', b'L', b'F'] {
            return Err(Error::BadFmt);
        }
        if self.ident[EI_CLASS] != ELFCLASS64
            || self.ident[EI_DATA] != ELFDATA2LSB
            || self.ident[EI_VERSION] != EV_CURRENT
        {
            return Err(Error::BadFmt);
        }
        if self.machine != EM_RISCV || self.e_type != ET_EXEC {
            return Err(Error::BadFmt);
        }
        if self.phoff == 0 || self.phnum == 0 || (self.phentsize as usize) < PHDR_SIZE {
            return Err(Error::BadFmt);
        }
        Ok(())
    }
}

struct Phdr {
    p_type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
}

impl Phdr {
    fn parse(b: &[u8; PHDR_SIZE]) -> Phdr {
        Phdr {
            p_type: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            flags: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            offset: u64::from_le_bytes(b[8..16].try_into().unwrap()),
            vaddr: u64::from_le_bytes(b[16..24].try_into().unwrap()),
            filesz: u64::from_le_bytes(b[32..40].try_into().unwrap()),
            memsz: u64::from_le_bytes(b[40..48].try_into().unwrap()),
        }
    }
}

fn seek(exe: &UioRef, pos: u64) -> Result<()> {
    let mut arg = pos;
    exe.cntl(FCNTL_SETPOS, &mut arg).map_err(|_| Error::Io)
}

fn read_exact(exe: &UioRef, buf: &mut [u8]) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = exe.read(&mut buf[done..])?;
        if n == 0 {
            return Err(Error::Io);
        }
        done += n;
    }
    Ok(())
}

/// Loads the executable into the active memory space and returns its entry
/// address.
pub fn elf_load(exe: &UioRef) -> Result<usize> {
    seek(exe, 0)?;
    let mut hdr = [0u8; EHDR_SIZE];
    read_exact(exe, &mut hdr)?;
    let ehdr = Ehdr::parse(&hdr);
    ehdr.validate()?;

    let stack_start = (UMEM_END_VMA - PAGE_SIZE) as u64;
    let mut loaded_any = false;

    for i in 0..ehdr.phnum as u64 {
        seek(exe, ehdr.phoff + i * ehdr.phentsize as u64)?;
        let mut phb = [0u8; PHDR_SIZE];
        read_exact(exe, &mut phb)?;
        let ph = Phdr::parse(&phb);

        if ph.p_type != PT_LOAD {
            continue;
        }
        loaded_any = true;

        let end = ph.vaddr.checked_add(ph.memsz).ok_or(Error::BadFmt)?;
        if ph.vaddr < UMEM_START_VMA as u64 || end > UMEM_END_VMA as u64 || end > stack_start {
            return Err(Error::BadFmt);
        }
        if ph.filesz > ph.memsz {
            return Err(Error::BadFmt);
        }

        // Map writable for the copy-in, tighten afterwards.
        let seg_start = ph.vaddr as usize & !(PAGE_SIZE - 1);
        let map_size = (ph.vaddr as usize - seg_start) + ph.memsz as usize;
        alloc_and_map_range(
            seg_start,
            map_size,
            MapFlags::R | MapFlags::W | MapFlags::U,
        );

        seek(exe, ph.offset)?;
        let mut copied = 0usize;
        while copied < ph.filesz as usize {
            let chunk = (ph.filesz as usize - copied).min(MAX_READ_SIZE);
            let dst = unsafe {
                core::slice::from_raw_parts_mut((ph.vaddr as usize + copied) as *mut u8, chunk)
            };
            read_exact(exe, dst)?;
            copied += chunk;
        }

        if ph.memsz > ph.filesz {
            unsafe {
                core::ptr::write_bytes(
                    (ph.vaddr + ph.filesz) as *mut u8,
                    0,
                    (ph.memsz - ph.filesz) as usize,
                );
            }
        }

        let mut perms = MapFlags::U;
        if ph.flags & PF_R != 0 {
            perms |= MapFlags::R;
        }
        if ph.flags & PF_W != 0 {
            perms |= MapFlags::W;
        }
        if ph.flags & PF_X != 0 {
            perms |= MapFlags::X;
        }
        let rounded = (map_size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        set_range_flags(seg_start, rounded, perms);
    }

    if !loaded_any {
        return Err(Error::BadFmt);
    }
    let entry = ehdr.entry as usize;
    if !(UMEM_START_VMA..UMEM_END_VMA).contains(&entry) {
        return Err(Error::BadFmt);
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::cell::UnsafeCell;

    // Memory-backed executable image, enough uio surface for the loader.
    struct MemUio {
        data: alloc::vec::Vec<u8>,
        pos: UnsafeCell<usize>,
    }
    unsafe impl Sync for MemUio {}
    unsafe impl Send for MemUio {}

    impl crate::uio::Uio for MemUio {
        fn read(&self, buf: &mut [u8]) -> crate::error::Result<usize> {
            let pos = unsafe { &mut *self.pos.get() };
            if *pos >= self.data.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.data.len() - *pos);
            buf[..n].copy_from_slice(&self.data[*pos..*pos + n]);
            *pos += n;
            Ok(n)
        }

        fn cntl(&self, op: i32, arg: &mut u64) -> crate::error::Result<()> {
            if op == FCNTL_SETPOS {
                unsafe { *self.pos.get() = *arg as usize };
                Ok(())
            } else {
                Err(Error::NotSup)
            }
        }
    }

    fn uio_of(data: alloc::vec::Vec<u8>) -> UioRef {
        Arc::new(MemUio {
            data,
            pos: UnsafeCell::new(0),
        })
    }

    fn minimal_header() -> [u8; EHDR_SIZE] {
        let mut h = [0u8; EHDR_SIZE];
        h[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        h[EI_CLASS] = ELFCLASS64;
        h[EI_DATA] = ELFDATA2LSB;
        h[EI_VERSION] = EV_CURRENT;
        h[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        h[18..20].copy_from_slice(&EM_RISCV.to_le_bytes());
        h[32..40].copy_from_slice(&64u64.to_le_bytes()); // phoff
        h[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        h[56..58].copy_from_slice(&1u16.to_le_bytes()); // phnum
        h
    }

    #[test]
    fn bad_magic_and_class_are_rejected() {
        let _g = crate::test_guard();
        let mut h = minimal_header();
        h[0] = 0x7e;
        assert_eq!(elf_load(&uio_of(h.to_vec())), Err(Error::BadFmt));

        let mut h = minimal_header();
        h[EI_CLASS] = 1; // 32-bit
        assert_eq!(elf_load(&uio_of(h.to_vec())), Err(Error::BadFmt));

        let mut h = minimal_header();
        h[18..20].copy_from_slice(&62u16.to_le_bytes()); // not RISC-V
        assert_eq!(elf_load(&uio_of(h.to_vec())), Err(Error::BadFmt));
    }

    #[test]
    fn missing_program_headers_are_rejected() {
        let _g = crate::test_guard();
        let mut h = minimal_header();
        h[56..58].copy_from_slice(&0u16.to_le_bytes());
        assert_eq!(elf_load(&uio_of(h.to_vec())), Err(Error::BadFmt));
    }

    #[test]
    fn out_of_window_segment_is_rejected() {
        let _g = crate::test_guard();
        let mut img = minimal_header().to_vec();
        let mut ph = [0u8; PHDR_SIZE];
        ph[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        ph[4..8].copy_from_slice(&(PF_R | PF_X).to_le_bytes());
        // vaddr below the user window.
        ph[16..24].copy_from_slice(&0x1000u64.to_le_bytes());
        ph[32..40].copy_from_slice(&8u64.to_le_bytes());
        ph[40..48].copy_from_slice(&8u64.to_le_bytes());
        img.extend_from_slice(&ph);
        assert_eq!(elf_load(&uio_of(img)), Err(Error::BadFmt));
    }

    #[test]
    fn truncated_image_is_an_io_error() {
        let _g = crate::test_guard();
        let h = minimal_header();
        assert_eq!(elf_load(&uio_of(h[..32].to_vec())), Err(Error::Io));
    }
}
