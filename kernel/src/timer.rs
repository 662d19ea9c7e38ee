// Timer core: the sorted sleep list of alarms and the preemption tick, both
// multiplexed onto the one comparator.

use core::ptr;

use crate::intr::{disable_interrupts, restore_interrupts};
use crate::memlayout::TIMER_FREQ;
use crate::riscv::{csrw_stimecmp, rdtime};
use crate::thread::Condition;

// One preemption event every 10 ms.
const PREEMPTION_INTERVAL: u64 = TIMER_FREQ / 100;

static mut SLEEP_LIST: *mut Alarm = ptr::null_mut();
static mut NEXT_PREEMPTION_TICK: u64 = 0;
static mut PREEMPTION_PENDING: bool = false;

pub static mut TIMER_INITIALIZED: bool = false;

/// A waitable deadline on the hardware time counter. Sleeps advance twake
/// relative to the previous wake, so periodic sleepers absorb lateness
/// unless they reset the base.
pub struct Alarm {
    cond: Condition,
    twake: u64,
    next: *mut Alarm,
}

impl Alarm {
    pub fn new(name: &'static str) -> Self {
        Alarm {
            cond: Condition::new(name),
            twake: rdtime(),
            next: ptr::null_mut(),
        }
    }

    /// Rebases the alarm so the next sleep is relative to now.
    pub fn reset(&mut self) {
        self.twake = rdtime();
    }

    /// Sleeps until twake + tcnt ticks, saturating at the counter maximum.
    /// Deadlines already in the past return immediately.
    pub fn sleep(&mut self, tcnt: u64) {
        let now = rdtime();
        self.twake = self.twake.saturating_add(tcnt);
        if self.twake < now {
            return;
        }

        // Interrupts stay off until the thread is on the condition's wait
        // list; otherwise the tick could fire in between, pull the alarm off
        // the sleep list, and broadcast to nobody.
        let pie = disable_interrupts();
        unsafe {
            let target = self.twake;
            let al = self as *mut Alarm;
            let head = *ptr::addr_of!(SLEEP_LIST);
            if head.is_null() || target < (*head).twake {
                (*al).next = head;
                SLEEP_LIST = al;
            } else {
                let mut cur = head;
                while !(*cur).next.is_null() && (*(*cur).next).twake <= target {
                    cur = (*cur).next;
                }
                (*al).next = (*cur).next;
                (*cur).next = al;
            }
            program_next_stimecmp();
        }
        self.cond.wait();
        restore_interrupts(pie);
    }

    pub fn sleep_sec(&mut self, sec: u64) {
        self.sleep(sec * TIMER_FREQ);
    }

    pub fn sleep_ms(&mut self, ms: u64) {
        self.sleep(ms * (TIMER_FREQ / 1000));
    }

    pub fn sleep_us(&mut self, us: u64) {
        self.sleep(us * (TIMER_FREQ / 1_000_000));
    }
}

pub fn sleep_sec(sec: u64) {
    sleep_ms(sec * 1000);
}

pub fn sleep_ms(ms: u64) {
    sleep_us(ms * 1000);
}

pub fn sleep_us(us: u64) {
    let mut al = Alarm::new("sleep");
    al.sleep_us(us);
}

pub fn timer_init() {
    unsafe {
        NEXT_PREEMPTION_TICK = rdtime() + PREEMPTION_INTERVAL;
        csrw_stimecmp(NEXT_PREEMPTION_TICK);
        TIMER_INITIALIZED = true;
    }
}

/// Timer leg of interrupt dispatch: wake every alarm at or past its
/// deadline, account the preemption tick, reprogram the comparator.
pub fn handle_timer_interrupt() {
    let now = rdtime();
    unsafe {
        while !SLEEP_LIST.is_null() && (*SLEEP_LIST).twake <= now {
            let head = SLEEP_LIST;
            SLEEP_LIST = (*head).next;
            (*head).next = ptr::null_mut();
            (*head).cond.broadcast();
        }

        if NEXT_PREEMPTION_TICK != 0 && now >= NEXT_PREEMPTION_TICK {
            NEXT_PREEMPTION_TICK += PREEMPTION_INTERVAL;
            while NEXT_PREEMPTION_TICK <= now {
                NEXT_PREEMPTION_TICK += PREEMPTION_INTERVAL;
            }
            PREEMPTION_PENDING = true;
        }

        program_next_stimecmp();
    }
}

/// Consumes the pending preemption flag so one tick causes one yield.
pub fn take_preemption_flag() -> bool {
    unsafe {
        let pending = PREEMPTION_PENDING;
        PREEMPTION_PENDING = false;
        pending
    }
}

/// Programs the comparator to the earlier of the first sleeper and the next
/// preemption event.
fn program_next_stimecmp() {
    unsafe {
        let mut next = u64::MAX;
        if !SLEEP_LIST.is_null() && (*SLEEP_LIST).twake < next {
            next = (*SLEEP_LIST).twake;
        }
        if NEXT_PREEMPTION_TICK != 0 && NEXT_PREEMPTION_TICK < next {
            next = NEXT_PREEMPTION_TICK;
        }
        csrw_stimecmp(next);
    }
}
