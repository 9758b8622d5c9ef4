//! Fixed-slot task table and cooperative round-robin scheduler.
//!
//! Grounded on `original_source/fusion_os/gecko/scheduler.c`'s
//! `tasks[MAX_TASKS]` slot table and `select_next_task`, restructured per
//! the redesign note: slots are linked by index instead of raw pointers, so
//! the ready/blocked/sleeping queues are plain intrusive lists over a fixed
//! array rather than a pointer graph.
#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicU64, Ordering};
use heapless::String as HString;
use spin::Mutex;
use talon_log::{log, Level};

pub const MAX_TASKS: usize = 256;
pub const DEFAULT_TIME_SLICE: u32 = 50;
pub const MIN_TIME_SLICE: u32 = 10;
pub const MAX_TIME_SLICE: u32 = 1000;
const MAX_NAME_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    TableFull,
    NotFound,
    InvalidTimeSlice,
    AlreadyStarted,
    NotStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Terminated,
    Ready,
    Running,
    Blocked,
    Sleeping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Fifo,
    RoundRobin,
}

#[derive(Debug, Clone, Copy, Default)]
struct Links {
    next: Option<usize>,
    prev: Option<usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Ready,
    Blocked,
    Sleeping,
}

/// Task control block. `entry` is metadata only here — nothing in this
/// crate actually calls it; real execution begins when the boot glue
/// performs the first `context_switch` onto the task's stack.
#[derive(Clone)]
pub struct Tcb {
    pub id: u64,
    pub name: HString<MAX_NAME_LEN>,
    pub state: TaskState,
    pub priority: Priority,
    pub policy: Policy,
    pub time_slice: u32,
    pub time_remaining: u32,
    pub stack_pointer: u64,
    pub stack_base: u64,
    pub stack_size: u64,
    pub creation_time: u64,
    pub last_scheduled_time: u64,
    pub total_cpu_time: u64,
    pub wake_tick: u64,
    pub entry: Option<fn()>,
    ready: Links,
    blocked: Links,
    sleeping: Links,
}

impl Tcb {
    const fn empty() -> Self {
        Tcb {
            id: 0,
            name: HString::new(),
            state: TaskState::Terminated,
            priority: Priority::Normal,
            policy: Policy::RoundRobin,
            time_slice: DEFAULT_TIME_SLICE,
            time_remaining: DEFAULT_TIME_SLICE,
            stack_pointer: 0,
            stack_base: 0,
            stack_size: 0,
            creation_time: 0,
            last_scheduled_time: 0,
            total_cpu_time: 0,
            wake_tick: 0,
            entry: None,
            ready: Links { next: None, prev: None },
            blocked: Links { next: None, prev: None },
            sleeping: Links { next: None, prev: None },
        }
    }

    fn links(&self, kind: ListKind) -> &Links {
        match kind {
            ListKind::Ready => &self.ready,
            ListKind::Blocked => &self.blocked,
            ListKind::Sleeping => &self.sleeping,
        }
    }

    fn links_mut(&mut self, kind: ListKind) -> &mut Links {
        match kind {
            ListKind::Ready => &mut self.ready,
            ListKind::Blocked => &mut self.blocked,
            ListKind::Sleeping => &mut self.sleeping,
        }
    }
}

#[derive(Default)]
struct TaskList {
    head: Option<usize>,
    tail: Option<usize>,
}

impl TaskList {
    fn push_back(&mut self, tasks: &mut [Tcb; MAX_TASKS], kind: ListKind, idx: usize) {
        tasks[idx].links_mut(kind).prev = self.tail;
        tasks[idx].links_mut(kind).next = None;
        if let Some(t) = self.tail {
            tasks[t].links_mut(kind).next = Some(idx);
        } else {
            self.head = Some(idx);
        }
        self.tail = Some(idx);
    }

    fn push_front(&mut self, tasks: &mut [Tcb; MAX_TASKS], kind: ListKind, idx: usize) {
        tasks[idx].links_mut(kind).next = self.head;
        tasks[idx].links_mut(kind).prev = None;
        if let Some(h) = self.head {
            tasks[h].links_mut(kind).prev = Some(idx);
        } else {
            self.tail = Some(idx);
        }
        self.head = Some(idx);
    }

    fn pop_front(&mut self, tasks: &mut [Tcb; MAX_TASKS], kind: ListKind) -> Option<usize> {
        let idx = self.head?;
        self.remove(tasks, kind, idx);
        Some(idx)
    }

    fn remove(&mut self, tasks: &mut [Tcb; MAX_TASKS], kind: ListKind, idx: usize) {
        let (prev, next) = {
            let l = tasks[idx].links(kind);
            (l.prev, l.next)
        };
        match prev {
            Some(p) => tasks[p].links_mut(kind).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => tasks[n].links_mut(kind).prev = prev,
            None => self.tail = prev,
        }
        let l = tasks[idx].links_mut(kind);
        l.next = None;
        l.prev = None;
    }
}

struct Scheduler {
    tasks: [Tcb; MAX_TASKS],
    ready: TaskList,
    blocked: TaskList,
    sleeping: TaskList,
    current: Option<usize>,
    idle: Option<usize>,
    started: bool,
    now: u64,
}

impl Scheduler {
    fn new() -> Self {
        const EMPTY: Tcb = Tcb::empty();
        Scheduler {
            tasks: [EMPTY; MAX_TASKS],
            ready: TaskList::default(),
            blocked: TaskList::default(),
            sleeping: TaskList::default(),
            current: None,
            idle: None,
            started: false,
            now: 0,
        }
    }

    fn free_slot(&self) -> Option<usize> {
        self.tasks.iter().position(|t| t.state == TaskState::Terminated)
    }

    fn spawn(
        &mut self,
        id: u64,
        name: &str,
        priority: Priority,
        policy: Policy,
        stack_base: u64,
        stack_size: u64,
        entry: Option<fn()>,
    ) -> Result<usize, SchedError> {
        let idx = self.free_slot().ok_or(SchedError::TableFull)?;
        let tcb = &mut self.tasks[idx];
        *tcb = Tcb::empty();
        tcb.id = id;
        let _ = tcb.name.push_str(&name[..name.len().min(MAX_NAME_LEN)]);
        tcb.state = TaskState::Ready;
        tcb.priority = priority;
        tcb.policy = policy;
        tcb.time_slice = DEFAULT_TIME_SLICE;
        tcb.time_remaining = DEFAULT_TIME_SLICE;
        tcb.stack_base = stack_base;
        tcb.stack_pointer = stack_base + stack_size;
        tcb.stack_size = stack_size;
        tcb.creation_time = self.now;
        tcb.entry = entry;
        self.ready.push_back(&mut self.tasks, ListKind::Ready, idx);
        Ok(idx)
    }

    fn select_next(&mut self) -> Option<usize> {
        if let Some(idx) = self.ready.pop_front(&mut self.tasks, ListKind::Ready) {
            return Some(idx);
        }
        if let Some(cur) = self.current {
            if self.tasks[cur].state == TaskState::Running {
                return Some(cur);
            }
        }
        self.idle
    }

    /// Pick the next runnable slot and, if it differs from `current`,
    /// perform the accounting swap and invoke the context-switch primitive.
    fn schedule(&mut self) {
        let next = match self.select_next() {
            Some(n) => n,
            None => return,
        };
        if Some(next) == self.current {
            return;
        }

        if let Some(cur) = self.current {
            let elapsed = self.now.saturating_sub(self.tasks[cur].last_scheduled_time);
            self.tasks[cur].total_cpu_time += elapsed;
            if self.tasks[cur].state == TaskState::Running {
                self.tasks[cur].state = TaskState::Ready;
                match self.tasks[cur].policy {
                    Policy::RoundRobin => self.ready.push_back(&mut self.tasks, ListKind::Ready, cur),
                    Policy::Fifo => self.ready.push_front(&mut self.tasks, ListKind::Ready, cur),
                }
            }
        }

        self.tasks[next].state = TaskState::Running;
        self.tasks[next].time_remaining = self.tasks[next].time_slice;
        self.tasks[next].last_scheduled_time = self.now;
        let old = self.current;
        self.current = Some(next);

        let old_sp = old.map(|o| &mut self.tasks[o].stack_pointer as *mut u64);
        let new_sp = self.tasks[next].stack_pointer;
        if let Some(old_sp) = old_sp {
            unsafe { context_switch(old_sp, new_sp) };
        }
    }
}

lazy_static::lazy_static! {
    static ref SCHED: Mutex<Scheduler> = Mutex::new(Scheduler::new());
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

fn fresh_id() -> u64 {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

fn idle_entry() {
    loop {
        core::hint::spin_loop();
    }
}

/// Resets the task table. Idempotent; real boot calls this once before
/// any `create_task`.
pub fn init() {
    let mut s = SCHED.lock();
    *s = Scheduler::new();
    log!(Level::Info, "sched", "task table initialized, {} slots", MAX_TASKS);
}

/// Creates the idle task and marks the scheduler started, then selects the
/// first ready task (or idle, if none) as the running one. Calling this
/// twice is a no-op that returns `AlreadyStarted`.
pub fn start() -> Result<(), SchedError> {
    let mut s = SCHED.lock();
    if s.started {
        return Err(SchedError::AlreadyStarted);
    }
    let idle_stack = talon_vmm::alloc_kernel_memory(16 * 1024).unwrap_or(0);
    let idx = s.spawn(fresh_id(), "idle", Priority::Low, Policy::RoundRobin, idle_stack, 16 * 1024, Some(idle_entry))?;
    // the idle task never sits in the ready list: it is the fallback select()
    // returns when nothing else is runnable.
    s.ready.remove(&mut s.tasks, ListKind::Ready, idx);
    s.idle = Some(idx);

    let first = s.select_next().ok_or(SchedError::NotFound)?;
    s.tasks[first].state = TaskState::Running;
    s.tasks[first].time_remaining = s.tasks[first].time_slice;
    s.tasks[first].last_scheduled_time = s.now;
    s.current = Some(first);
    s.started = true;
    log!(Level::Info, "sched", "scheduler started, first task id {}", s.tasks[first].id);
    Ok(())
}

pub fn create_task(name: &str, priority: Priority, policy: Policy, stack_size: u64, entry: fn()) -> Result<u64, SchedError> {
    let stack_base = talon_vmm::alloc_kernel_memory(stack_size).ok_or(SchedError::TableFull)?;
    let mut s = SCHED.lock();
    let id = fresh_id();
    let idx = s.spawn(id, name, priority, policy, stack_base, stack_size, Some(entry))?;
    log!(Level::Debug, "sched", "created task '{}' id {} slot {}", name, id, idx);
    Ok(s.tasks[idx].id)
}

pub fn create_thread(stack_base: u64, stack_size: u64, entry: fn()) -> Result<u64, SchedError> {
    let mut s = SCHED.lock();
    let id = fresh_id();
    let idx = s.spawn(id, "thread", Priority::Normal, Policy::RoundRobin, stack_base, stack_size, Some(entry))?;
    Ok(s.tasks[idx].id)
}

fn index_of(s: &Scheduler, id: u64) -> Option<usize> {
    s.tasks.iter().position(|t| t.id == id && t.state != TaskState::Terminated)
}

/// Cooperative yield: relinquish the CPU and let the scheduler pick the
/// next runnable task.
pub fn yield_now() {
    let mut s = SCHED.lock();
    if let Some(cur) = s.current {
        s.tasks[cur].time_remaining = 0;
    }
    s.schedule();
}

pub fn block(id: u64) -> Result<(), SchedError> {
    let mut s = SCHED.lock();
    let idx = index_of(&s, id).ok_or(SchedError::NotFound)?;
    if s.tasks[idx].state == TaskState::Ready {
        s.ready.remove(&mut s.tasks, ListKind::Ready, idx);
    }
    s.tasks[idx].state = TaskState::Blocked;
    s.blocked.push_back(&mut s.tasks, ListKind::Blocked, idx);
    if s.current == Some(idx) {
        s.schedule();
    }
    Ok(())
}

pub fn unblock(id: u64) -> Result<(), SchedError> {
    let mut s = SCHED.lock();
    let idx = index_of(&s, id).ok_or(SchedError::NotFound)?;
    if s.tasks[idx].state != TaskState::Blocked {
        return Err(SchedError::NotFound);
    }
    s.blocked.remove(&mut s.tasks, ListKind::Blocked, idx);
    s.tasks[idx].state = TaskState::Ready;
    s.ready.push_back(&mut s.tasks, ListKind::Ready, idx);
    Ok(())
}

/// Suspends the current task until `tick_now() + ticks`. A real boot wakes
/// sleepers from the timer ISR by calling [`tick`]; this crate only tracks
/// the wake deadline.
pub fn sleep(ticks: u64) -> Result<(), SchedError> {
    let mut s = SCHED.lock();
    let idx = s.current.ok_or(SchedError::NotStarted)?;
    if s.tasks[idx].state == TaskState::Ready {
        s.ready.remove(&mut s.tasks, ListKind::Ready, idx);
    }
    s.tasks[idx].state = TaskState::Sleeping;
    s.tasks[idx].wake_tick = s.now + ticks;
    s.sleeping.push_back(&mut s.tasks, ListKind::Sleeping, idx);
    s.schedule();
    Ok(())
}

/// Advances the scheduler's notion of time by one tick, waking any sleeper
/// whose deadline has passed.
pub fn tick() {
    let mut s = SCHED.lock();
    s.now += 1;
    let now = s.now;
    let mut woken = heapless::Vec::<usize, MAX_TASKS>::new();
    let mut cursor = s.sleeping.head;
    while let Some(idx) = cursor {
        cursor = s.tasks[idx].sleeping.next;
        if s.tasks[idx].wake_tick <= now {
            let _ = woken.push(idx);
        }
    }
    for idx in woken {
        s.sleeping.remove(&mut s.tasks, ListKind::Sleeping, idx);
        s.tasks[idx].state = TaskState::Ready;
        s.ready.push_back(&mut s.tasks, ListKind::Ready, idx);
    }
}

pub fn terminate(id: u64) -> Result<(), SchedError> {
    let mut s = SCHED.lock();
    let idx = index_of(&s, id).ok_or(SchedError::NotFound)?;
    match s.tasks[idx].state {
        TaskState::Ready => s.ready.remove(&mut s.tasks, ListKind::Ready, idx),
        TaskState::Blocked => s.blocked.remove(&mut s.tasks, ListKind::Blocked, idx),
        TaskState::Sleeping => s.sleeping.remove(&mut s.tasks, ListKind::Sleeping, idx),
        _ => {}
    }
    s.tasks[idx].state = TaskState::Terminated;
    if s.current == Some(idx) {
        s.current = None;
        s.schedule();
    }
    Ok(())
}

pub fn set_priority(id: u64, priority: Priority) -> Result<(), SchedError> {
    let mut s = SCHED.lock();
    let idx = index_of(&s, id).ok_or(SchedError::NotFound)?;
    s.tasks[idx].priority = priority;
    Ok(())
}

pub fn get_priority(id: u64) -> Result<Priority, SchedError> {
    let s = SCHED.lock();
    let idx = index_of(&s, id).ok_or(SchedError::NotFound)?;
    Ok(s.tasks[idx].priority)
}

pub fn current_task() -> Option<u64> {
    let s = SCHED.lock();
    s.current.map(|idx| s.tasks[idx].id)
}

pub fn task_count() -> usize {
    let s = SCHED.lock();
    s.tasks.iter().filter(|t| t.state != TaskState::Terminated).count()
}

pub fn set_time_slice(id: u64, slice: u32) -> Result<(), SchedError> {
    if slice < MIN_TIME_SLICE || slice > MAX_TIME_SLICE {
        return Err(SchedError::InvalidTimeSlice);
    }
    let mut s = SCHED.lock();
    let idx = index_of(&s, id).ok_or(SchedError::NotFound)?;
    s.tasks[idx].time_slice = slice;
    Ok(())
}

/// Real register-save/restore context switch. The new stack pointer is
/// loaded last so a fault mid-switch leaves the old task's state intact.
#[cfg(all(not(test), target_arch = "x86_64"))]
unsafe fn context_switch(old_sp: *mut u64, new_sp: u64) {
    core::arch::asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        in("rdi") old_sp,
        in("rsi") new_sp,
    );
}

/// Hosted stand-in: real register/stack swapping would corrupt the test
/// process's own stack, since slot stack pointers here are not real
/// kernel stacks. Tests only assert on scheduler bookkeeping.
#[cfg(any(test, not(target_arch = "x86_64")))]
unsafe fn context_switch(old_sp: *mut u64, new_sp: u64) {
    unsafe {
        *old_sp = *old_sp;
    }
    let _ = new_sp;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() {}

    fn fresh() {
        init();
    }

    #[test]
    fn scenario_3_round_robin_order() {
        fresh();
        create_task("A", Priority::Normal, Policy::RoundRobin, 4096, noop).unwrap();
        create_task("B", Priority::Normal, Policy::RoundRobin, 4096, noop).unwrap();
        create_task("C", Priority::Normal, Policy::RoundRobin, 4096, noop).unwrap();
        start().unwrap();

        let mut order = heapless::Vec::<heapless::String<8>, 8>::new();
        let name_of = |id: u64| -> heapless::String<8> {
            let s = SCHED.lock();
            let idx = s.tasks.iter().position(|t| t.id == id).unwrap();
            s.tasks[idx].name.clone()
        };
        order.push(name_of(current_task().unwrap())).unwrap();
        for _ in 0..4 {
            yield_now();
            order.push(name_of(current_task().unwrap())).unwrap();
        }
        let names: heapless::Vec<&str, 8> = order.iter().map(|s| s.as_str()).collect();
        assert_eq!(names.as_slice(), ["A", "B", "C", "A", "B"]);
    }

    #[test]
    fn table_full_rejected() {
        fresh();
        for i in 0..(MAX_TASKS - 1) {
            let name = if i % 2 == 0 { "t" } else { "u" };
            create_task(name, Priority::Normal, Policy::RoundRobin, 4096, noop).unwrap();
        }
        start().unwrap();
        let err = create_task("overflow", Priority::Normal, Policy::RoundRobin, 4096, noop).unwrap_err();
        assert_eq!(err, SchedError::TableFull);
    }

    #[test]
    fn double_start_rejected() {
        fresh();
        create_task("A", Priority::Normal, Policy::RoundRobin, 4096, noop).unwrap();
        start().unwrap();
        assert_eq!(start().unwrap_err(), SchedError::AlreadyStarted);
    }

    #[test]
    fn block_then_unblock_reenters_ready() {
        fresh();
        let a = create_task("A", Priority::Normal, Policy::RoundRobin, 4096, noop).unwrap();
        create_task("B", Priority::Normal, Policy::RoundRobin, 4096, noop).unwrap();
        start().unwrap();
        block(a).unwrap();
        unblock(a).unwrap();
        let s = SCHED.lock();
        let idx = s.tasks.iter().position(|t| t.id == a).unwrap();
        assert_eq!(s.tasks[idx].state, TaskState::Ready);
    }

    #[test]
    fn sleep_wakes_after_ticks() {
        fresh();
        create_task("A", Priority::Normal, Policy::RoundRobin, 4096, noop).unwrap();
        start().unwrap();
        let cur = current_task().unwrap();
        sleep(3).unwrap();
        for _ in 0..3 {
            tick();
        }
        let s = SCHED.lock();
        let idx = s.tasks.iter().position(|t| t.id == cur).unwrap();
        assert_eq!(s.tasks[idx].state, TaskState::Ready);
    }
}
