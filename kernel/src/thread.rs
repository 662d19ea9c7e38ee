// Threads, conditions and locks.
//
// A fixed arena of at most NTHR thread records, indexed by TID; slot 0 is the
// main thread and the last slot the idle thread. The slot in THRTAB is the
// only owning reference to a record. Wait lists and lock owners hold TIDs.
// The running thread's record is addressed by the tp register; everything
// here is uniprocessor code whose critical sections are interrupt-disable
// windows.

use core::cell::UnsafeCell;
use core::ptr;

use alloc::boxed::Box;

use crate::error::{Error, Result};
use crate::intr::{disable_interrupts, restore_interrupts};
use crate::kalloc::{alloc_phys_pages, free_phys_pages};
use crate::proc::Process;
use crate::riscv::{wfi, PAGE_SIZE};
use crate::see::{halt_failure, halt_success};
use crate::vm::switch_mspace;

pub const NTHR: usize = 16;
const MAIN_TID: usize = 0;
const IDLE_TID: usize = NTHR - 1;

// Rust burns kernel stack faster than the C this design grew out of, so
// spawned threads get two pages instead of one.
pub const STACK_PAGES: usize = 2;
const STACK_SIZE: usize = STACK_PAGES * PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninit,
    Waiting,
    Running,
    Ready,
    Exited,
}

/// Callee-saved register file, enough for a voluntary switch. On startup the
/// s registers double as the argument block: s0..s7 carry the entry
/// arguments and s8 the entry point.
#[repr(C)]
pub struct Context {
    s: [u64; 12],
    ra: u64,
    sp: u64,
}

impl Context {
    const fn zeroed() -> Self {
        Context { s: [0; 12], ra: 0, sp: 0 }
    }
}

/// Lives at the very top of every kernel stack. The trap vector recovers the
/// running thread (and kernel gp) from here on entry from U mode.
#[repr(C)]
pub struct StackAnchor {
    pub ktp: *mut Thread,
    pub kgp: u64,
}

#[repr(C)]
pub struct Thread {
    ctx: Context, // must be first (_thread_swtch)
    id: usize,
    state: State,
    name: &'static str,
    stack_anchor: *mut StackAnchor,
    stack_lowest: *mut u8,
    proc: *mut Process,
    parent: usize,
    list_next: Option<usize>,
    wait_cond: *const Condition,
    lock_list: *const Lock,
    pub child_exit: Condition,
}

impl Thread {
    const fn statically(id: usize, name: &'static str, state: State, cond: &'static str) -> Self {
        Thread {
            ctx: Context::zeroed(),
            id,
            state,
            name,
            stack_anchor: ptr::null_mut(),
            stack_lowest: ptr::null_mut(),
            proc: ptr::null_mut(),
            parent: MAIN_TID,
            list_next: None,
            wait_cond: ptr::null(),
            lock_list: ptr::null(),
            child_exit: Condition::new(cond),
        }
    }
}

static mut MAIN_THREAD: Thread =
    Thread::statically(MAIN_TID, "main", State::Running, "main.child-exit");
static mut IDLE_THREAD: Thread =
    Thread::statically(IDLE_TID, "idle", State::Ready, "idle.child-exit");

#[repr(align(16))]
struct IdleStack([u8; STACK_SIZE]);
static mut IDLE_STACK: IdleStack = IdleStack([0; STACK_SIZE]);

static mut THRTAB: [*mut Thread; NTHR] = [ptr::null_mut(); NTHR];

static mut READY_LIST: ThreadList = ThreadList::new();

pub static mut THRMGR_INITIALIZED: bool = false;

#[cfg(target_arch = "riscv64")]
core::arch::global_asm!(
    r#"
        # a0 = thread to run; returns the thread switched away from.
        # The context sits at offset 0 of the thread record.
        .globl _thread_swtch
_thread_swtch:
        sd   s0, 0(tp)
        sd   s1, 8(tp)
        sd   s2, 16(tp)
        sd   s3, 24(tp)
        sd   s4, 32(tp)
        sd   s5, 40(tp)
        sd   s6, 48(tp)
        sd   s7, 56(tp)
        sd   s8, 64(tp)
        sd   s9, 72(tp)
        sd   s10, 80(tp)
        sd   s11, 88(tp)
        sd   ra, 96(tp)
        sd   sp, 104(tp)
        mv   t0, tp
        mv   tp, a0
        ld   s0, 0(tp)
        ld   s1, 8(tp)
        ld   s2, 16(tp)
        ld   s3, 24(tp)
        ld   s4, 32(tp)
        ld   s5, 40(tp)
        ld   s6, 48(tp)
        ld   s7, 56(tp)
        ld   s8, 64(tp)
        ld   s9, 72(tp)
        ld   s10, 80(tp)
        ld   s11, 88(tp)
        ld   ra, 96(tp)
        ld   sp, 104(tp)
        mv   a0, t0
        ret

        # First activation of a spawned thread: forward the saved argument
        # block to the entry function, and exit if it ever returns.
        .globl _thread_startup
_thread_startup:
        mv   a0, s0
        mv   a1, s1
        mv   a2, s2
        mv   a3, s3
        mv   a4, s4
        mv   a5, s5
        mv   a6, s6
        mv   a7, s7
        jalr s8
        call running_thread_exit
"#
);

#[cfg(target_arch = "riscv64")]
extern "C" {
    fn _thread_swtch(next: *mut Thread) -> *mut Thread;
    fn _thread_startup();
}

#[cfg(not(target_arch = "riscv64"))]
#[allow(non_snake_case)]
unsafe extern "C" fn _thread_swtch(_next: *mut Thread) -> *mut Thread {
    unreachable!()
}

#[cfg(not(target_arch = "riscv64"))]
#[allow(non_snake_case)]
unsafe extern "C" fn _thread_startup() {
    unreachable!()
}

#[cfg(target_arch = "riscv64")]
pub fn current_thread() -> *mut Thread {
    let tp: *mut Thread;
    unsafe { core::arch::asm!("mv {}, tp", out(reg) tp) };
    tp
}

// Host builds have no dedicated thread pointer; the main thread stands in so
// locks taken by the testable cores resolve an owner.
#[cfg(not(target_arch = "riscv64"))]
pub fn current_thread() -> *mut Thread {
    unsafe { ptr::addr_of_mut!(MAIN_THREAD) }
}

#[cfg(target_arch = "riscv64")]
fn set_running_thread(thr: *mut Thread) {
    unsafe { core::arch::asm!("mv tp, {}", in(reg) thr) };
}

pub fn running_thread() -> usize {
    unsafe { (*current_thread()).id }
}

pub fn running_thread_name() -> &'static str {
    unsafe { (*current_thread()).name }
}

fn thr(tid: usize) -> *mut Thread {
    unsafe { (*ptr::addr_of!(THRTAB))[tid] }
}

// FIFO list threaded through the records' list_next fields. Not interrupt
// safe; callers mask around every use.

struct ThreadList {
    head: Option<usize>,
    tail: Option<usize>,
}

impl ThreadList {
    const fn new() -> Self {
        ThreadList { head: None, tail: None }
    }

    fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    fn push(&mut self, tid: usize) {
        unsafe { (*thr(tid)).list_next = None };
        match self.tail {
            Some(t) => unsafe { (*thr(t)).list_next = Some(tid) },
            None => self.head = Some(tid),
        }
        self.tail = Some(tid);
    }

    fn pop(&mut self) -> Option<usize> {
        let tid = self.head?;
        self.head = unsafe { (*thr(tid)).list_next.take() };
        if self.head.is_none() {
            self.tail = None;
        }
        Some(tid)
    }
}

/// Mesa-semantics condition variable: broadcast readies every waiter, and
/// waiters recheck their predicate.
pub struct Condition {
    name: &'static str,
    wait_list: UnsafeCell<ThreadList>,
}

unsafe impl Sync for Condition {}
unsafe impl Send for Condition {}

impl Condition {
    pub const fn new(name: &'static str) -> Self {
        Condition {
            name,
            wait_list: UnsafeCell::new(ThreadList::new()),
        }
    }

    pub fn wait(&self) {
        let t = current_thread();
        unsafe {
            assert!((*t).state == State::Running, "wait from non-running thread");
            let pie = disable_interrupts();
            (*t).state = State::Waiting;
            (*t).wait_cond = self as *const Condition;
            (*self.wait_list.get()).push((*t).id);
            restore_interrupts(pie);
        }
        log::trace!("<{}> waits on {}", unsafe { (*t).name }, self.name);
        running_thread_suspend();
    }

    pub fn broadcast(&self) {
        let pie = disable_interrupts();
        unsafe {
            while let Some(tid) = (*self.wait_list.get()).pop() {
                (*thr(tid)).state = State::Ready;
                (*thr(tid)).wait_cond = ptr::null();
                (*ptr::addr_of_mut!(READY_LIST)).push(tid);
            }
        }
        restore_interrupts(pie);
    }
}

struct LockInner {
    owner: Option<usize>,
    cnt: usize,
    next: *const Lock,
}

/// Recursive lock. The owner re-acquires by bumping the count; everyone else
/// waits on the release condition until the owner field clears. Held locks
/// chain into the owning thread's lock list.
pub struct Lock {
    release: Condition,
    inner: UnsafeCell<LockInner>,
}

unsafe impl Sync for Lock {}
unsafe impl Send for Lock {}

impl Lock {
    pub const fn new() -> Self {
        Lock {
            release: Condition::new("lock.release"),
            inner: UnsafeCell::new(LockInner {
                owner: None,
                cnt: 0,
                next: ptr::null(),
            }),
        }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn inner(&self) -> &mut LockInner {
        &mut *self.inner.get()
    }

    pub fn acquire(&self) {
        let me = running_thread();
        unsafe {
            let inner = self.inner();
            if inner.owner == Some(me) {
                inner.cnt += 1;
                return;
            }
            while self.inner().owner.is_some() {
                self.release.wait();
            }
            let t = current_thread();
            let inner = self.inner();
            inner.owner = Some(me);
            inner.cnt = 1;
            inner.next = (*t).lock_list;
            (*t).lock_list = self as *const Lock;
        }
    }

    pub fn release(&self) {
        unsafe {
            let inner = self.inner();
            assert!(inner.owner == Some(running_thread()), "release of unowned lock");
            assert!(inner.cnt != 0);
            inner.cnt -= 1;
            if inner.cnt == 0 {
                self.release_completely();
            }
        }
    }

    unsafe fn release_completely(&self) {
        self.release.broadcast();
        let t = current_thread();
        let me = self as *const Lock;
        let mut hptr: *mut *const Lock = ptr::addr_of_mut!((*t).lock_list);
        loop {
            let cur = *hptr;
            assert!(!cur.is_null(), "held lock missing from lock list");
            if cur == me {
                *hptr = (*cur).inner().next;
                break;
            }
            hptr = ptr::addr_of_mut!((*cur).inner().next);
        }
        let inner = self.inner();
        inner.owner = None;
        inner.next = ptr::null();
    }
}

impl Default for Lock {
    fn default() -> Self {
        Lock::new()
    }
}

pub fn thrmgr_init() {
    #[cfg(target_arch = "riscv64")]
    {
        extern "C" {
            static mut _main_stack_lowest: u8;
            static mut _main_stack_anchor: StackAnchor;
        }
        unsafe {
            let main = ptr::addr_of_mut!(MAIN_THREAD);
            (*main).stack_anchor = ptr::addr_of_mut!(_main_stack_anchor);
            (*main).stack_lowest = ptr::addr_of_mut!(_main_stack_lowest);
            (*(*main).stack_anchor).ktp = main;

            let idle = ptr::addr_of_mut!(IDLE_THREAD);
            let stack = ptr::addr_of_mut!(IDLE_STACK) as *mut u8;
            let anchor = stack.add(STACK_SIZE).sub(core::mem::size_of::<StackAnchor>())
                as *mut StackAnchor;
            (*anchor).ktp = idle;
            (*anchor).kgp = 0;
            (*idle).stack_anchor = anchor;
            (*idle).stack_lowest = stack;
            (*idle).ctx.sp = anchor as u64;
            (*idle).ctx.ra = _thread_startup as usize as u64;
            (*idle).ctx.s[8] = idle_thread_func as usize as u64;

            THRTAB[MAIN_TID] = main;
            THRTAB[IDLE_TID] = idle;
            (*ptr::addr_of_mut!(READY_LIST)).push(IDLE_TID);
            set_running_thread(main);
        }
    }
    #[cfg(not(target_arch = "riscv64"))]
    unsafe {
        THRTAB[MAIN_TID] = ptr::addr_of_mut!(MAIN_THREAD);
        THRTAB[IDLE_TID] = ptr::addr_of_mut!(IDLE_THREAD);
    }
    unsafe { THRMGR_INITIALIZED = true };
}

pub type ThreadEntry = unsafe extern "C" fn(u64, u64);

/// Creates a thread running entry with up to eight argument words and puts
/// it on the ready list. Returns its TID.
pub fn spawn_thread(name: &'static str, entry: ThreadEntry, args: &[u64]) -> Result<usize> {
    assert!(args.len() <= 8);

    let mut tid = 0;
    loop {
        tid += 1;
        if tid == NTHR {
            return Err(Error::MThr);
        }
        if thr(tid).is_null() {
            break;
        }
    }

    let me = current_thread();
    let mut record = Box::new(Thread::statically(tid, name, State::Ready, "child-exit"));
    let stack = alloc_phys_pages(STACK_PAGES);
    let anchor = unsafe {
        stack.add(STACK_SIZE).sub(core::mem::size_of::<StackAnchor>()) as *mut StackAnchor
    };

    record.stack_lowest = stack;
    record.stack_anchor = anchor;
    record.parent = unsafe { (*me).id };
    record.proc = unsafe { (*me).proc };
    record.ctx.sp = anchor as u64;
    record.ctx.ra = _thread_startup as usize as u64;
    for (i, a) in args.iter().enumerate() {
        record.ctx.s[i] = *a;
    }
    record.ctx.s[8] = entry as usize as u64;

    let raw = Box::into_raw(record);
    unsafe {
        (*anchor).ktp = raw;
        (*anchor).kgp = 0;
        THRTAB[tid] = raw;
        let pie = disable_interrupts();
        (*ptr::addr_of_mut!(READY_LIST)).push(tid);
        restore_interrupts(pie);
    }

    log::debug!("spawned <{}:{}>", name, tid);
    Ok(tid)
}

/// Marks the running thread exited, wakes its parent, and schedules away.
/// Never returns; the successor frees this thread's stack.
#[no_mangle]
pub extern "C" fn running_thread_exit() -> ! {
    let t = current_thread();
    unsafe {
        if (*t).id == MAIN_TID {
            halt_success();
        }
        (*t).state = State::Exited;
        (*thr((*t).parent)).child_exit.broadcast();
    }
    running_thread_suspend();
    halt_failure();
}

pub fn running_thread_yield() {
    running_thread_suspend();
}

/// Waits for a child to exit and reclaims its slot. tid 0 means any child.
pub fn thread_join(tid: usize) -> Result<usize> {
    let me = running_thread();

    if tid != 0 {
        if tid >= NTHR {
            return Err(Error::Inval);
        }
        let child = thr(tid);
        if child.is_null() || unsafe { (*child).parent } != me {
            return Err(Error::Inval);
        }
        unsafe {
            while (*child).state != State::Exited {
                (*thr(me)).child_exit.wait();
            }
        }
        thread_reclaim(tid);
        return Ok(tid);
    }

    let mut has_child = false;
    for ctid in 1..NTHR {
        let c = thr(ctid);
        if !c.is_null() && unsafe { (*c).parent } == me {
            has_child = true;
            if unsafe { (*c).state } == State::Exited {
                thread_reclaim(ctid);
                return Ok(ctid);
            }
        }
    }
    if !has_child {
        return Err(Error::Inval);
    }

    loop {
        unsafe { (*thr(me)).child_exit.wait() };
        for ctid in 1..NTHR {
            let c = thr(ctid);
            if !c.is_null()
                && unsafe { (*c).parent } == me
                && unsafe { (*c).state } == State::Exited
            {
                thread_reclaim(ctid);
                return Ok(ctid);
            }
        }
    }
}

/// Releases a reclaimed thread's slot and record; its children are handed to
/// its parent.
fn thread_reclaim(tid: usize) {
    assert!(tid != MAIN_TID && tid < NTHR);
    let t = thr(tid);
    assert!(!t.is_null() && unsafe { (*t).state } == State::Exited);
    unsafe {
        for ctid in 1..NTHR {
            let c = thr(ctid);
            if !c.is_null() && (*c).parent == tid {
                (*c).parent = (*t).parent;
            }
        }
        THRTAB[tid] = ptr::null_mut();
        drop(Box::from_raw(t));
    }
}

pub fn thread_process(tid: usize) -> *mut Process {
    let t = thr(tid);
    assert!(!t.is_null());
    unsafe { (*t).proc }
}

pub fn running_thread_process() -> *mut Process {
    unsafe { (*current_thread()).proc }
}

pub fn thread_set_process(tid: usize, proc: *mut Process) {
    let t = thr(tid);
    assert!(!t.is_null());
    unsafe { (*t).proc = proc };
}

/// Top of the running thread's kernel stack (the anchor address). The trap
/// frame region sits immediately below it.
pub fn running_thread_stack_base() -> *mut u8 {
    unsafe { (*current_thread()).stack_anchor as *mut u8 }
}

/// Parks the running thread and resumes the next READY one (idle if none).
/// Returns when this thread is scheduled again.
fn running_thread_suspend() {
    let t = current_thread();
    let pie = disable_interrupts();
    unsafe {
        if (*t).state == State::Running {
            (*t).state = State::Ready;
            (*ptr::addr_of_mut!(READY_LIST)).push((*t).id);
        }
        let next_tid = (*ptr::addr_of_mut!(READY_LIST)).pop().unwrap_or(IDLE_TID);
        let next = thr(next_tid);
        (*next).state = State::Running;
        if !(*next).proc.is_null() {
            switch_mspace((*(*next).proc).mtag);
        }
        restore_interrupts(pie);

        let prev = _thread_swtch(next);

        // The dying thread cannot free its own stack; its successor does.
        if (*prev).state == State::Exited && !(*prev).stack_lowest.is_null() {
            free_phys_pages((*prev).stack_lowest, STACK_PAGES);
            (*prev).stack_lowest = ptr::null_mut();
        }
    }
}

pub fn ready_list_empty() -> bool {
    unsafe { (*ptr::addr_of!(READY_LIST)).is_empty() }
}

unsafe extern "C" fn idle_thread_func(_a0: u64, _a1: u64) {
    // Sleep with wfi when nothing is runnable. Interrupts must be off while
    // rechecking the list, or an ISR could ready a thread between the check
    // and the wfi.
    loop {
        while !ready_list_empty() {
            running_thread_yield();
        }
        disable_interrupts();
        if ready_list_empty() {
            wfi();
        }
        crate::intr::enable_interrupts();
    }
}
