// Sv39 virtual memory.
//
// Three page-table levels, 512 entries each. A memory space is named by an
// mtag, the encoded satp value (mode | asid | root ppn). The main space's
// root and the kernel's first-megapage tables are statically allocated; all
// other tables and per-process pages come from the page pool. Global entries
// are shared between spaces and never own their frames.

use core::ptr;

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::kalloc::{alloc_phys_page, alloc_phys_pages, free_phys_page};
use crate::riscv::{
    csrr_satp, csrrw_satp, csrw_satp, sfence_vma, PAGE_ORDER, PAGE_SIZE, SATP_ASID_SHIFT,
    SATP_MODE_SHIFT, SATP_MODE_SV39, SATP_PPN_MASK,
};
use crate::trap::TrapFrame;

pub const PTE_CNT: usize = 512;
pub const MEGA_SIZE: usize = PTE_CNT * PAGE_SIZE;
pub const GIGA_SIZE: usize = PTE_CNT * MEGA_SIZE;
const ROOT_LEVEL: usize = 2;

// Raw PTE flag bits. V, A and D are internal; callers express permissions
// through MapFlags.
const PTE_V: u64 = 1 << 0;
const PTE_A: u64 = 1 << 6;
const PTE_D: u64 = 1 << 7;

bitflags! {
    /// Permission bits accepted by the mapping and validation interfaces.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u64 {
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
    }
}

pub type MTag = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(u64);

impl Pte {
    pub const fn zero() -> Self {
        Pte(0)
    }

    /// A leaf entry: A, D and V set plus the caller's permission bits.
    fn leaf(pp: usize, flags: MapFlags) -> Self {
        Pte((pagenum(pp) as u64) << 10 | flags.bits() | PTE_A | PTE_D | PTE_V)
    }

    /// A pointer to a next-level table; only G may accompany V.
    fn table(pt: usize, g: MapFlags) -> Self {
        Pte((pagenum(pt) as u64) << 10 | (g & MapFlags::G).bits() | PTE_V)
    }

    pub fn is_valid(self) -> bool {
        self.0 & PTE_V != 0
    }

    pub fn is_leaf(self) -> bool {
        self.0 & (MapFlags::R | MapFlags::W | MapFlags::X).bits() != 0
    }

    pub fn is_global(self) -> bool {
        self.0 & MapFlags::G.bits() != 0
    }

    pub fn pa(self) -> usize {
        ((self.0 >> 10) as usize & ((1 << 44) - 1)) << PAGE_ORDER
    }

    pub fn perms(self) -> MapFlags {
        MapFlags::from_bits_truncate(self.0)
    }

    /// Overwrites R/W/X/U/G, preserving V, A, D and the frame number.
    fn adjust_perms(&mut self, flags: MapFlags) {
        self.0 = (self.0 & !MapFlags::all().bits()) | (flags & MapFlags::all()).bits();
    }
}

#[repr(C, align(4096))]
pub struct PageTable(pub [Pte; PTE_CNT]);

impl PageTable {
    pub const fn empty() -> Self {
        PageTable([Pte::zero(); PTE_CNT])
    }
}

// Statically allocated tables for the main space: the root, and the two
// levels that break the first megapage of RAM into 4 KiB pages.
#[link_section = ".bss.pagetable"]
static mut MAIN_PT2: PageTable = PageTable::empty();
#[link_section = ".bss.pagetable"]
static mut MAIN_PT1_RAM: PageTable = PageTable::empty();
#[link_section = ".bss.pagetable"]
static mut MAIN_PT0_RAM: PageTable = PageTable::empty();

static mut MAIN_MTAG: MTag = 0;

pub static mut MEMORY_INITIALIZED: bool = false;

fn pagenum(p: usize) -> usize {
    p >> PAGE_ORDER
}

fn pageptr(n: usize) -> usize {
    n << PAGE_ORDER
}

fn vpn(vma: usize) -> usize {
    vma >> PAGE_ORDER
}

fn pt_index(level: usize, vpn: usize) -> usize {
    (vpn >> (9 * level)) & (PTE_CNT - 1)
}

/// Address bits 63:38 must be all 0 or all 1.
pub fn wellformed(vma: usize) -> bool {
    let bits = (vma as isize) >> 38;
    bits == 0 || bits == -1
}

fn ptab_to_mtag(root: *const PageTable, asid: usize) -> MTag {
    ((SATP_MODE_SV39 << SATP_MODE_SHIFT) as usize)
        | (asid << SATP_ASID_SHIFT as usize)
        | pagenum(root as usize)
}

fn mtag_to_ptab(mtag: MTag) -> *mut PageTable {
    pageptr(mtag & SATP_PPN_MASK as usize) as *mut PageTable
}

fn active_space_ptab() -> *mut PageTable {
    mtag_to_ptab(csrr_satp() as usize)
}

fn pte_child(pte: Pte) -> *mut PageTable {
    pte.pa() as *mut PageTable
}

fn alloc_table() -> *mut PageTable {
    let pp = alloc_phys_page();
    unsafe { ptr::write_bytes(pp, 0, PAGE_SIZE) };
    pp as *mut PageTable
}

// Table-walk primitives. All of them take an explicit root so that spaces
// other than the active one can be manipulated (and so they can be exercised
// in isolation).

/// Returns the PTE that maps vpn, stopping early at leaves. None if any
/// level on the path is invalid.
pub fn ptab_fetch(root: *mut PageTable, vpn: usize) -> Option<*mut Pte> {
    let mut tab = root;
    for level in (0..=ROOT_LEVEL).rev() {
        let pte = unsafe { &mut (*tab).0[pt_index(level, vpn)] as *mut Pte };
        let cur = unsafe { *pte };
        if !cur.is_valid() {
            return None;
        }
        if cur.is_leaf() || level == 0 {
            return Some(pte);
        }
        tab = pte_child(cur);
    }
    None
}

/// Installs a 4 KiB leaf for vpn, allocating intermediate tables as needed.
/// Replacing an existing non-global leaf frees its frame; finding a leaf at
/// an intermediate level, or a table where the leaf belongs, is fatal.
pub fn ptab_insert(root: *mut PageTable, vpn: usize, pp: *mut u8, flags: MapFlags) {
    let mut tab = root;
    for level in (1..=ROOT_LEVEL).rev() {
        let pte = unsafe { &mut (*tab).0[pt_index(level, vpn)] };
        if !pte.is_valid() {
            let child = alloc_table();
            *pte = Pte::table(child as usize, MapFlags::empty());
            tab = child;
        } else {
            if pte.is_leaf() {
                panic!("ptab_insert: leaf at level {}", level);
            }
            tab = pte_child(*pte);
        }
    }

    let leaf = unsafe { &mut (*tab).0[pt_index(0, vpn)] };
    if leaf.is_valid() {
        if !leaf.is_leaf() {
            panic!("ptab_insert: table entry at level 0");
        }
        if !leaf.is_global() {
            free_phys_page(leaf.pa() as *mut u8);
        }
    }
    *leaf = Pte::leaf(pp as usize, flags);
}

enum Removed {
    Nothing,
    Some,
    SomeAndEmpty,
}

fn ptab_remove_at(tab: *mut PageTable, level: usize, vpn: usize, pp_out: &mut *mut u8) -> Removed {
    let pte = unsafe { &mut (*tab).0[pt_index(level, vpn)] };
    if !pte.is_valid() {
        return Removed::Nothing;
    }

    if pte.is_leaf() || level == 0 {
        if !pte.is_leaf() {
            return Removed::Nothing;
        }
        *pp_out = pte.pa() as *mut u8;
        *pte = Pte::zero();
    } else {
        let child = pte_child(*pte);
        match ptab_remove_at(child, level - 1, vpn, pp_out) {
            Removed::Nothing => return Removed::Nothing,
            Removed::SomeAndEmpty => {
                free_phys_page(child as *mut u8);
                *pte = Pte::zero();
            }
            Removed::Some => {}
        }
    }

    for e in unsafe { &(*tab).0 } {
        if e.is_valid() {
            return Removed::Some;
        }
    }
    Removed::SomeAndEmpty
}

/// Unmaps vpn and returns the frame that was mapped there (null if none).
/// Child tables left empty by the removal are freed.
pub fn ptab_remove(root: *mut PageTable, vpn: usize) -> *mut u8 {
    let mut pp: *mut u8 = ptr::null_mut();
    // The root itself is never freed here, so the emptiness result is moot.
    let _ = ptab_remove_at(root, ROOT_LEVEL, vpn, &mut pp);
    pp
}

/// Rewrites the R/W/X/U/G bits of an existing leaf mapping. Missing or
/// non-leaf mappings are left alone.
pub fn ptab_adjust(root: *mut PageTable, vpn: usize, flags: MapFlags) {
    if let Some(pte) = ptab_fetch(root, vpn) {
        let cur = unsafe { *pte };
        if cur.is_leaf() {
            unsafe { (*pte).adjust_perms(flags) };
        }
    }
}

/// Deep copy of a space: global entries are shared verbatim, non-global
/// leaves get a fresh frame with the contents copied, non-global tables
/// recurse.
pub fn ptab_clone(root: *mut PageTable) -> *mut PageTable {
    let new_root = alloc_table();
    for i in 0..PTE_CNT {
        let cur = unsafe { (*root).0[i] };
        if !cur.is_valid() {
            continue;
        }
        let new = if cur.is_global() {
            cur
        } else if cur.is_leaf() {
            let page = alloc_phys_page();
            unsafe { ptr::copy_nonoverlapping(cur.pa() as *const u8, page, PAGE_SIZE) };
            Pte::leaf(page as usize, cur.perms())
        } else {
            let child = ptab_clone(pte_child(cur));
            Pte::table(child as usize, cur.perms() & MapFlags::G)
        };
        unsafe { (*new_root).0[i] = new };
    }
    new_root
}

/// Frees every non-global frame and table reachable from root, clearing the
/// entries. The root itself survives.
pub fn ptab_reset(root: *mut PageTable) {
    for i in 0..PTE_CNT {
        let cur = unsafe { (*root).0[i] };
        if !cur.is_valid() || cur.is_global() {
            continue;
        }
        if cur.is_leaf() {
            free_phys_page(cur.pa() as *mut u8);
        } else {
            let child = pte_child(cur);
            ptab_reset(child);
            free_phys_page(child as *mut u8);
        }
        unsafe { (*root).0[i] = Pte::zero() };
    }
}

/// ptab_reset plus freeing the root table.
pub fn ptab_discard(root: *mut PageTable) {
    ptab_reset(root);
    free_phys_page(root as *mut u8);
}

// Public memory-space interface, all operating on the active space.

pub fn active_mspace() -> MTag {
    csrr_satp() as MTag
}

pub fn switch_mspace(mtag: MTag) -> MTag {
    let prev = csrrw_satp(mtag as u64);
    sfence_vma();
    prev as MTag
}

pub fn main_mspace() -> MTag {
    unsafe { MAIN_MTAG }
}

pub fn clone_active_mspace() -> MTag {
    ptab_to_mtag(ptab_clone(active_space_ptab()), 0)
}

pub fn reset_active_mspace() {
    ptab_reset(active_space_ptab());
    sfence_vma();
}

/// Switches back to the main space and tears down the previously active one.
pub fn discard_active_mspace() -> MTag {
    let root = active_space_ptab();
    let main = unsafe { ptr::addr_of_mut!(MAIN_PT2) };
    if root != main {
        ptab_discard(root);
    }
    csrw_satp(unsafe { MAIN_MTAG } as u64);
    sfence_vma();
    unsafe { MAIN_MTAG }
}

pub fn map_page(vma: usize, pp: *mut u8, flags: MapFlags) -> *mut u8 {
    assert!(vma % PAGE_SIZE == 0);
    assert!(pp as usize % PAGE_SIZE == 0 && !pp.is_null());
    assert!(wellformed(vma));
    ptab_insert(active_space_ptab(), vpn(vma), pp, flags);
    vma as *mut u8
}

pub fn map_range(vma: usize, size: usize, pp: *mut u8, flags: MapFlags) -> *mut u8 {
    if size == 0 {
        return vma as *mut u8;
    }
    assert!(vma % PAGE_SIZE == 0);
    assert!(wellformed(vma) && wellformed(vma + size - 1));
    let pages = (size + PAGE_SIZE - 1) >> PAGE_ORDER;
    for i in 0..pages {
        map_page(vma + i * PAGE_SIZE, unsafe { pp.add(i * PAGE_SIZE) }, flags);
    }
    vma as *mut u8
}

/// Allocates backing pages and maps them at vma. Size rounds up to pages.
pub fn alloc_and_map_range(vma: usize, size: usize, flags: MapFlags) -> *mut u8 {
    if size == 0 {
        return vma as *mut u8;
    }
    let pages = (size + PAGE_SIZE - 1) >> PAGE_ORDER;
    let pp = alloc_phys_pages(pages);
    map_range(vma, size, pp, flags)
}

pub fn set_range_flags(vp: usize, size: usize, flags: MapFlags) {
    if size == 0 {
        return;
    }
    assert!(vp % PAGE_SIZE == 0);
    assert!(wellformed(vp) && wellformed(vp + size - 1));
    let root = active_space_ptab();
    let pages = (size + PAGE_SIZE - 1) >> PAGE_ORDER;
    for i in 0..pages {
        ptab_adjust(root, vpn(vp) + i, flags);
    }
    sfence_vma();
}

pub fn unmap_and_free_range(vp: usize, size: usize) {
    if size == 0 {
        return;
    }
    assert!(vp % PAGE_SIZE == 0);
    assert!(wellformed(vp) && wellformed(vp + size - 1));
    let root = active_space_ptab();
    let pages = (size + PAGE_SIZE - 1) >> PAGE_ORDER;
    for i in 0..pages {
        let pp = ptab_remove(root, vpn(vp) + i);
        if !pp.is_null() {
            free_phys_page(pp);
        }
    }
    sfence_vma();
}

// Validation of pointers handed in from user mode. Every page in the range
// must be mapped by a valid leaf carrying all requested permission bits.

fn check_page(root: *mut PageTable, addr: usize, flags: MapFlags) -> Result<()> {
    let pte = ptab_fetch(root, vpn(addr)).ok_or(Error::Access)?;
    let cur = unsafe { *pte };
    if !cur.is_valid() || !cur.is_leaf() || !cur.perms().contains(flags) {
        return Err(Error::Access);
    }
    Ok(())
}

pub fn validate_vptr_in(root: *mut PageTable, vp: usize, len: usize, flags: MapFlags) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let end = vp.checked_add(len).ok_or(Error::Inval)?;
    if !wellformed(vp) || !wellformed(end - 1) {
        return Err(Error::Inval);
    }
    for n in vpn(vp)..=vpn(end - 1) {
        check_page(root, n << PAGE_ORDER, flags)?;
    }
    Ok(())
}

pub fn validate_vptr(vp: usize, len: usize, flags: MapFlags) -> Result<()> {
    validate_vptr_in(active_space_ptab(), vp, len, flags)
}

/// Walks the string page by page, validating each page before reading any
/// byte on it. Returns the string length, NUL excluded.
pub fn validate_vstr_in(root: *mut PageTable, vs: usize, flags: MapFlags) -> Result<usize> {
    if vs == 0 || !wellformed(vs) {
        return Err(Error::Inval);
    }
    let mut addr = vs;
    loop {
        check_page(root, addr, flags)?;
        let page_end = (addr & !(PAGE_SIZE - 1)) + PAGE_SIZE;
        while addr < page_end {
            let b = unsafe { *(addr as *const u8) };
            if b == 0 {
                return Ok(addr - vs);
            }
            addr += 1;
        }
        if addr == 0 || !wellformed(addr) {
            return Err(Error::Inval);
        }
    }
}

pub fn validate_vstr(vs: usize, flags: MapFlags) -> Result<usize> {
    validate_vstr_in(active_space_ptab(), vs, flags)
}

/// U-mode load/store/instruction page faults are not handled: there is no
/// demand paging. Returning false terminates the faulting process.
pub fn handle_umode_page_fault(_tfr: &TrapFrame, _vma: usize) -> bool {
    false
}

// Boot-time construction of the main space:
//
//         0 to RAM_START            RW gigapages (MMIO region)
// RAM_START to _kimg_end            RX/R/RW pages following the image layout
// _kimg_end to RAM_START+MEGA_SIZE  RW pages (heap, start of page pool)
// RAM_START+MEGA_SIZE to RAM_END    RW megapages (page pool)
#[cfg(target_arch = "riscv64")]
pub fn memory_init() {
    use crate::memlayout::{HEAP_SIZE, RAM_END, RAM_START};
    use crate::riscv::{csrrs_sstatus, SSTATUS_SUM};

    extern "C" {
        static _kimg_start: u8;
        static _kimg_text_start: u8;
        static _kimg_text_end: u8;
        static _kimg_rodata_start: u8;
        static _kimg_rodata_end: u8;
        static _kimg_data_start: u8;
        static _kimg_end: u8;
    }

    let text_start = unsafe { ptr::addr_of!(_kimg_text_start) as usize };
    let text_end = unsafe { ptr::addr_of!(_kimg_text_end) as usize };
    let rodata_start = unsafe { ptr::addr_of!(_kimg_rodata_start) as usize };
    let rodata_end = unsafe { ptr::addr_of!(_kimg_rodata_end) as usize };
    let data_start = unsafe { ptr::addr_of!(_kimg_data_start) as usize };
    let kimg_end = unsafe { ptr::addr_of!(_kimg_end) as usize };

    assert_eq!(unsafe { ptr::addr_of!(_kimg_start) as usize }, RAM_START);
    assert!(kimg_end - RAM_START <= MEGA_SIZE, "kernel exceeds one megapage");

    let pt2 = unsafe { ptr::addr_of_mut!(MAIN_PT2) };
    let pt1 = unsafe { ptr::addr_of_mut!(MAIN_PT1_RAM) };
    let pt0 = unsafe { ptr::addr_of_mut!(MAIN_PT0_RAM) };
    let rwg = MapFlags::R | MapFlags::W | MapFlags::G;

    unsafe {
        // Identity-map the MMIO space below RAM as gigapages.
        let mut pma = 0;
        while pma < RAM_START {
            (*pt2).0[pt_index(2, vpn(pma))] = Pte::leaf(pma, rwg);
            pma += GIGA_SIZE;
        }

        // The RAM gigarange gets a subtable, and its first megapage another,
        // so the image can be mapped with per-region permissions.
        (*pt2).0[pt_index(2, vpn(RAM_START))] = Pte::table(pt1 as usize, MapFlags::G);
        (*pt1).0[pt_index(1, vpn(RAM_START))] = Pte::table(pt0 as usize, MapFlags::G);

        let mut pp = text_start;
        while pp < text_end {
            (*pt0).0[pt_index(0, vpn(pp))] = Pte::leaf(pp, MapFlags::R | MapFlags::X | MapFlags::G);
            pp += PAGE_SIZE;
        }
        let mut pp = rodata_start;
        while pp < rodata_end {
            (*pt0).0[pt_index(0, vpn(pp))] = Pte::leaf(pp, MapFlags::R | MapFlags::G);
            pp += PAGE_SIZE;
        }
        let mut pp = data_start;
        while pp < RAM_START + MEGA_SIZE {
            (*pt0).0[pt_index(0, vpn(pp))] = Pte::leaf(pp, rwg);
            pp += PAGE_SIZE;
        }

        // Remaining RAM as RW megapages.
        let mut pp = RAM_START + MEGA_SIZE;
        while pp < RAM_END {
            (*pt1).0[pt_index(1, vpn(pp))] = Pte::leaf(pp, rwg);
            pp += MEGA_SIZE;
        }

        MAIN_MTAG = ptab_to_mtag(pt2, 0);
        csrw_satp(MAIN_MTAG as u64);
        sfence_vma();
    }

    // Byte heap directly after the image, then the page pool to the end of
    // RAM.
    let heap_start = (kimg_end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    heap::heap_init(heap_start, HEAP_SIZE);
    unsafe {
        (*ptr::addr_of_mut!(crate::kalloc::PAGE_POOL)).init(heap_start + HEAP_SIZE, RAM_END);
    }

    // Let S mode touch U pages; validation stays explicit.
    csrrs_sstatus(SSTATUS_SUM);

    unsafe { MEMORY_INITIALIZED = true };

    log::info!(
        "memory: heap {:#x}..{:#x}, page pool {:#x}..{:#x} ({} pages)",
        heap_start,
        heap_start + HEAP_SIZE,
        heap_start + HEAP_SIZE,
        RAM_END,
        crate::kalloc::free_phys_page_count()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalloc::free_phys_page_count;
    use std::alloc::{alloc_zeroed, Layout};

    // These tests drive the table-walk primitives against a synthetic pool.
    // They serialize on the crate test guard because the pool is global.

    fn seed_pool(pages: usize) -> usize {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let base = unsafe { alloc_zeroed(layout) as usize };
        unsafe { (*ptr::addr_of_mut!(crate::kalloc::PAGE_POOL)).init(base, base + pages * PAGE_SIZE) };
        base
    }

    const VA: usize = 0x4000_0000; // an unremarkable canonical user address

    #[test]
    fn insert_fetch_remove_round_trip() {
        let _g = crate::test_guard();
        seed_pool(64);
        let root = alloc_table();

        let page = alloc_phys_page();
        let flags = MapFlags::R | MapFlags::W | MapFlags::U;
        ptab_insert(root, vpn(VA), page, flags);

        let pte = ptab_fetch(root, vpn(VA)).expect("mapped");
        let cur = unsafe { *pte };
        assert!(cur.is_valid() && cur.is_leaf());
        assert_eq!(cur.pa(), page as usize);
        assert_eq!(cur.perms(), flags);

        // An address one page over is not mapped.
        assert!(ptab_fetch(root, vpn(VA + PAGE_SIZE)).is_none());

        let removed = ptab_remove(root, vpn(VA));
        assert_eq!(removed, page);
        assert!(ptab_fetch(root, vpn(VA)).is_none());
    }

    #[test]
    fn remove_collapses_empty_tables() {
        let _g = crate::test_guard();
        seed_pool(64);
        let root = alloc_table();
        let before = free_phys_page_count();

        let page = alloc_phys_page();
        ptab_insert(root, vpn(VA), page, MapFlags::R | MapFlags::U);
        // One frame plus two intermediate tables were consumed.
        assert_eq!(free_phys_page_count(), before - 3);

        let pp = ptab_remove(root, vpn(VA));
        free_phys_page(pp);
        // Frame and both intermediate tables are back.
        assert_eq!(free_phys_page_count(), before);
    }

    #[test]
    fn adjust_overwrites_only_permission_bits() {
        let _g = crate::test_guard();
        seed_pool(64);
        let root = alloc_table();
        let page = alloc_phys_page();
        ptab_insert(root, vpn(VA), page, MapFlags::R | MapFlags::W | MapFlags::U);

        ptab_adjust(root, vpn(VA), MapFlags::R | MapFlags::X | MapFlags::U);
        let cur = unsafe { *ptab_fetch(root, vpn(VA)).unwrap() };
        assert!(cur.is_valid() && cur.is_leaf());
        assert_eq!(cur.perms(), MapFlags::R | MapFlags::X | MapFlags::U);
        assert_eq!(cur.pa(), page as usize);
    }

    #[test]
    fn clone_then_discard_preserves_page_count() {
        let _g = crate::test_guard();
        seed_pool(128);
        let root = alloc_table();
        for i in 0..3 {
            let page = alloc_phys_page();
            unsafe { ptr::write_bytes(page, 0xa0 + i as u8, PAGE_SIZE) };
            ptab_insert(root, vpn(VA + i * PAGE_SIZE), page, MapFlags::R | MapFlags::W | MapFlags::U);
        }
        let before = free_phys_page_count();

        let cloned = ptab_clone(root);
        // The clone's frames hold copies of the originals.
        let orig = unsafe { *ptab_fetch(root, vpn(VA)).unwrap() };
        let copy = unsafe { *ptab_fetch(cloned, vpn(VA)).unwrap() };
        assert_ne!(orig.pa(), copy.pa());
        let a = unsafe { core::slice::from_raw_parts(orig.pa() as *const u8, PAGE_SIZE) };
        let b = unsafe { core::slice::from_raw_parts(copy.pa() as *const u8, PAGE_SIZE) };
        assert_eq!(a, b);

        ptab_discard(cloned);
        assert_eq!(free_phys_page_count(), before);
    }

    #[test]
    fn clone_shares_global_entries() {
        let _g = crate::test_guard();
        seed_pool(64);
        let root = alloc_table();
        let page = alloc_phys_page();
        // A global leaf installed directly at the root level, as the kernel
        // does for large shared regions.
        unsafe {
            (*root).0[pt_index(2, vpn(VA))] = Pte::leaf(page as usize, MapFlags::R | MapFlags::W | MapFlags::G);
        }
        let before = free_phys_page_count();
        let cloned = ptab_clone(root);
        // Only the new root table was allocated; the global leaf is shared.
        assert_eq!(free_phys_page_count(), before - 1);
        let a = unsafe { (*root).0[pt_index(2, vpn(VA))] };
        let b = unsafe { (*cloned).0[pt_index(2, vpn(VA))] };
        assert_eq!(a, b);

        // Reset must leave the global entry alone.
        ptab_reset(cloned);
        let b = unsafe { (*cloned).0[pt_index(2, vpn(VA))] };
        assert!(b.is_valid() && b.is_global());
    }

    #[test]
    fn validate_vptr_checks_every_page_and_flag() {
        let _g = crate::test_guard();
        seed_pool(64);
        let root = alloc_table();
        let ru = MapFlags::R | MapFlags::U;
        for i in 0..2 {
            let page = alloc_phys_page();
            ptab_insert(root, vpn(VA + i * PAGE_SIZE), page, ru);
        }

        assert_eq!(validate_vptr_in(root, VA, 2 * PAGE_SIZE, ru), Ok(()));
        assert_eq!(validate_vptr_in(root, VA + 100, PAGE_SIZE, ru), Ok(()));
        // Third page is unmapped.
        assert_eq!(
            validate_vptr_in(root, VA, 3 * PAGE_SIZE, ru),
            Err(Error::Access)
        );
        // Write permission was never granted.
        assert_eq!(
            validate_vptr_in(root, VA, 8, ru | MapFlags::W),
            Err(Error::Access)
        );
        // Empty ranges pass, overflowing ones do not.
        assert_eq!(validate_vptr_in(root, VA, 0, ru), Ok(()));
        assert_eq!(
            validate_vptr_in(root, usize::MAX - 4, 16, ru),
            Err(Error::Inval)
        );
        // Non-canonical addresses are invalid-argument, not access.
        assert_eq!(
            validate_vptr_in(root, 1 << 40, 8, ru),
            Err(Error::Inval)
        );
    }

    #[test]
    fn validate_vstr_rejects_bad_pointers() {
        let _g = crate::test_guard();
        seed_pool(64);
        let root = alloc_table();
        assert_eq!(
            validate_vstr_in(root, 0, MapFlags::U | MapFlags::R),
            Err(Error::Inval)
        );
        assert_eq!(
            validate_vstr_in(root, 1 << 40, MapFlags::U | MapFlags::R),
            Err(Error::Inval)
        );
        // Unmapped string pointer fails the page check before any read.
        assert_eq!(
            validate_vstr_in(root, VA, MapFlags::U | MapFlags::R),
            Err(Error::Access)
        );
    }
}
