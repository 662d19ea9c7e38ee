// virtio-blk over the qemu MMIO transport: the boot storage device. One
// 8-entry queue, one request in flight at a time, completion signalled from
// the external-interrupt path.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{fence, Ordering};

use alloc::sync::Arc;

use crate::error::{Error, Result};
use crate::intr::enable_intr_source;
use crate::kalloc::alloc_phys_page;
use crate::memlayout::{VIRTIO0, VIRTIO0_IRQ};
use crate::riscv::PAGE_SIZE;
use crate::storage::Storage;
use crate::thread::{Condition, Lock};

pub const VIRTIO_BLKSZ: usize = 512;

const NUM: usize = 8; // queue depth, must be a power of two

// MMIO register offsets.
const MMIO_MAGIC_VALUE: usize = 0x000;
const MMIO_VERSION: usize = 0x004;
const MMIO_DEVICE_ID: usize = 0x008;
const MMIO_VENDOR_ID: usize = 0x00c;
const MMIO_DEVICE_FEATURES: usize = 0x010;
const MMIO_DRIVER_FEATURES: usize = 0x020;
const MMIO_QUEUE_SEL: usize = 0x030;
const MMIO_QUEUE_NUM_MAX: usize = 0x034;
const MMIO_QUEUE_NUM: usize = 0x038;
const MMIO_QUEUE_READY: usize = 0x044;
const MMIO_QUEUE_NOTIFY: usize = 0x050;
const MMIO_INTERRUPT_STATUS: usize = 0x060;
const MMIO_INTERRUPT_ACK: usize = 0x064;
const MMIO_STATUS: usize = 0x070;
const MMIO_QUEUE_DESC_LOW: usize = 0x080;
const MMIO_QUEUE_DESC_HIGH: usize = 0x084;
const MMIO_DRIVER_DESC_LOW: usize = 0x090;
const MMIO_DRIVER_DESC_HIGH: usize = 0x094;
const MMIO_DEVICE_DESC_LOW: usize = 0x0a0;
const MMIO_DEVICE_DESC_HIGH: usize = 0x0a4;
const MMIO_CONFIG: usize = 0x100;

// Status register bits.
const CONFIG_S_ACKNOWLEDGE: u32 = 1;
const CONFIG_S_DRIVER: u32 = 2;
const CONFIG_S_DRIVER_OK: u32 = 4;
const CONFIG_S_FEATURES_OK: u32 = 8;

// Device feature bits we refuse.
const BLK_F_RO: u32 = 5;
const BLK_F_SCSI: u32 = 7;
const BLK_F_CONFIG_WCE: u32 = 11;
const BLK_F_MQ: u32 = 12;
const F_ANY_LAYOUT: u32 = 27;
const RING_F_INDIRECT_DESC: u32 = 28;
const RING_F_EVENT_IDX: u32 = 29;

const VRING_DESC_F_NEXT: u16 = 1;
const VRING_DESC_F_WRITE: u16 = 2;

const BLK_T_IN: u32 = 0;
const BLK_T_OUT: u32 = 1;

#[repr(C)]
struct VirtqDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

#[repr(C)]
struct VirtqAvail {
    flags: u16,
    idx: u16,
    ring: [u16; NUM],
}

#[repr(C)]
struct VirtqUsedElem {
    id: u32,
    len: u32,
}

#[repr(C)]
struct VirtqUsed {
    flags: u16,
    idx: u16,
    ring: [VirtqUsedElem; NUM],
}

#[repr(C)]
struct BlkReq {
    type_: u32,
    reserved: u32,
    sector: u64,
}

struct DiskState {
    desc: *mut VirtqDesc,
    avail: *mut VirtqAvail,
    used: *mut VirtqUsed,
    used_idx: u16,
    req: BlkReq,
    status: u8,
    done: bool,
    capacity_bytes: u64,
}

pub struct VirtioDisk {
    lock: Lock,
    completed: Condition,
    state: UnsafeCell<DiskState>,
}

unsafe impl Sync for VirtioDisk {}
unsafe impl Send for VirtioDisk {}

fn reg_read(r: usize) -> u32 {
    unsafe { ptr::read_volatile((VIRTIO0 + r) as *const u32) }
}

fn reg_write(r: usize, v: u32) {
    unsafe { ptr::write_volatile((VIRTIO0 + r) as *mut u32, v) };
}

impl VirtioDisk {
    /// Probes and initializes the device, hooks its interrupt, and returns
    /// it as a storage endpoint.
    pub fn attach() -> Result<Arc<VirtioDisk>> {
        if reg_read(MMIO_MAGIC_VALUE) != 0x7472_6976
            || reg_read(MMIO_VERSION) != 2
            || reg_read(MMIO_DEVICE_ID) != 2
            || reg_read(MMIO_VENDOR_ID) != 0x554d_4551
        {
            return Err(Error::NoEnt);
        }

        let mut status = 0;
        reg_write(MMIO_STATUS, status); // reset
        status |= CONFIG_S_ACKNOWLEDGE;
        reg_write(MMIO_STATUS, status);
        status |= CONFIG_S_DRIVER;
        reg_write(MMIO_STATUS, status);

        let mut features = reg_read(MMIO_DEVICE_FEATURES);
        features &= !(1 << BLK_F_RO);
        features &= !(1 << BLK_F_SCSI);
        features &= !(1 << BLK_F_CONFIG_WCE);
        features &= !(1 << BLK_F_MQ);
        features &= !(1 << F_ANY_LAYOUT);
        features &= !(1 << RING_F_EVENT_IDX);
        features &= !(1 << RING_F_INDIRECT_DESC);
        reg_write(MMIO_DRIVER_FEATURES, features);

        status |= CONFIG_S_FEATURES_OK;
        reg_write(MMIO_STATUS, status);
        if reg_read(MMIO_STATUS) & CONFIG_S_FEATURES_OK == 0 {
            return Err(Error::Io);
        }

        reg_write(MMIO_QUEUE_SEL, 0);
        if reg_read(MMIO_QUEUE_READY) != 0 {
            return Err(Error::Busy);
        }
        let max = reg_read(MMIO_QUEUE_NUM_MAX);
        if (max as usize) < NUM {
            return Err(Error::Io);
        }

        let desc = alloc_phys_page();
        let avail = alloc_phys_page();
        let used = alloc_phys_page();
        unsafe {
            ptr::write_bytes(desc, 0, PAGE_SIZE);
            ptr::write_bytes(avail, 0, PAGE_SIZE);
            ptr::write_bytes(used, 0, PAGE_SIZE);
        }

        reg_write(MMIO_QUEUE_NUM, NUM as u32);
        reg_write(MMIO_QUEUE_DESC_LOW, desc as usize as u32);
        reg_write(MMIO_QUEUE_DESC_HIGH, (desc as usize >> 32) as u32);
        reg_write(MMIO_DRIVER_DESC_LOW, avail as usize as u32);
        reg_write(MMIO_DRIVER_DESC_HIGH, (avail as usize >> 32) as u32);
        reg_write(MMIO_DEVICE_DESC_LOW, used as usize as u32);
        reg_write(MMIO_DEVICE_DESC_HIGH, (used as usize >> 32) as u32);
        reg_write(MMIO_QUEUE_READY, 1);

        status |= CONFIG_S_DRIVER_OK;
        reg_write(MMIO_STATUS, status);

        // First config field of virtio-blk is the capacity in sectors.
        let capacity_sectors = unsafe { ptr::read_volatile((VIRTIO0 + MMIO_CONFIG) as *const u64) };

        let disk = Arc::new(VirtioDisk {
            lock: Lock::new(),
            completed: Condition::new("vioblk.completed"),
            state: UnsafeCell::new(DiskState {
                desc: desc as *mut VirtqDesc,
                avail: avail as *mut VirtqAvail,
                used: used as *mut VirtqUsed,
                used_idx: 0,
                req: BlkReq {
                    type_: 0,
                    reserved: 0,
                    sector: 0,
                },
                status: 0xff,
                done: false,
                capacity_bytes: capacity_sectors * VIRTIO_BLKSZ as u64,
            }),
        });

        let aux = Arc::as_ptr(&disk) as *mut ();
        enable_intr_source(VIRTIO0_IRQ, 1, virtio_isr, aux);

        log::info!(
            "vioblk: {} KiB",
            capacity_sectors * VIRTIO_BLKSZ as u64 / 1024
        );
        Ok(disk)
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn state(&self) -> &mut DiskState {
        &mut *self.state.get()
    }

    // One three-descriptor request: header, payload, status byte. Holds the
    // device lock for the duration and sleeps until the ISR reports the
    // used-ring entry.
    fn transfer(&self, pos: u64, buf: *mut u8, len: usize, write: bool) -> Result<usize> {
        if pos % VIRTIO_BLKSZ as u64 != 0 || len % VIRTIO_BLKSZ != 0 {
            return Err(Error::Inval);
        }
        if len == 0 {
            return Ok(0);
        }

        self.lock.acquire();
        let st = unsafe { self.state() };

        if pos >= st.capacity_bytes {
            self.lock.release();
            return Ok(0);
        }
        let len = len.min((st.capacity_bytes - pos) as usize);

        st.req = BlkReq {
            type_: if write { BLK_T_OUT } else { BLK_T_IN },
            reserved: 0,
            sector: pos / VIRTIO_BLKSZ as u64,
        };
        st.status = 0xff;
        st.done = false;

        unsafe {
            let desc = st.desc;
            (*desc.add(0)) = VirtqDesc {
                addr: &st.req as *const BlkReq as u64,
                len: core::mem::size_of::<BlkReq>() as u32,
                flags: VRING_DESC_F_NEXT,
                next: 1,
            };
            (*desc.add(1)) = VirtqDesc {
                addr: buf as u64,
                len: len as u32,
                flags: if write {
                    VRING_DESC_F_NEXT
                } else {
                    VRING_DESC_F_NEXT | VRING_DESC_F_WRITE
                },
                next: 2,
            };
            (*desc.add(2)) = VirtqDesc {
                addr: &st.status as *const u8 as u64,
                len: 1,
                flags: VRING_DESC_F_WRITE,
                next: 0,
            };

            let avail = &mut *st.avail;
            avail.ring[avail.idx as usize % NUM] = 0;
            // Publish the descriptor chain before the index, and the index
            // before the doorbell.
            fence(Ordering::SeqCst);
            avail.idx = avail.idx.wrapping_add(1);
            fence(Ordering::SeqCst);
            reg_write(MMIO_QUEUE_NOTIFY, 0);
        }

        while !unsafe { self.state() }.done {
            self.completed.wait();
        }

        let ok = unsafe { self.state() }.status == 0;
        self.lock.release();
        if ok {
            Ok(len)
        } else {
            Err(Error::Io)
        }
    }

    fn handle_interrupt(&self) {
        reg_write(MMIO_INTERRUPT_ACK, reg_read(MMIO_INTERRUPT_STATUS) & 0x3);
        fence(Ordering::SeqCst);
        let st = unsafe { self.state() };
        let used = unsafe { &*st.used };
        while st.used_idx != used.idx {
            st.used_idx = st.used_idx.wrapping_add(1);
            st.done = true;
        }
        self.completed.broadcast();
    }
}

fn virtio_isr(_srcno: u32, aux: *mut ()) {
    let disk = unsafe { &*(aux as *const VirtioDisk) };
    disk.handle_interrupt();
}

impl Storage for VirtioDisk {
    fn blksz(&self) -> usize {
        VIRTIO_BLKSZ
    }

    fn size(&self) -> u64 {
        unsafe { self.state() }.capacity_bytes
    }

    fn fetch(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.transfer(pos, buf.as_mut_ptr(), buf.len(), false)
    }

    fn store(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        self.transfer(pos, buf.as_ptr() as *mut u8, buf.len(), true)
    }
}
