//! Bounded message queues and a service name registry.
//!
//! Grounded on `original_source/fusion_os/gecko/ipc.c`'s `create_message`
//! payload-size check and its `system_message_queue`/`MAX_SERVICES` pair,
//! and on `ipc.h`'s message-type/flag constants (`IPC_MESSAGE_DATA` etc,
//! `IPC_BLOCKING`/`IPC_NONBLOCKING`/`IPC_URGENT`). Queues themselves are
//! heap-backed (`alloc::collections::VecDeque`, matching `talon_log`'s
//! ring) rather than a giant fixed buffer per slot — a `[Queue; MAX_QUEUES]`
//! sized for the worst case would cost tens of megabytes of static storage
//! per queue table.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use spin::Mutex;
use talon_log::{log, Level};

pub const MAX_PAYLOAD_BYTES: usize = 1024;
pub const SYSTEM_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_SERVICE_QUEUE_CAPACITY: usize = 64;
pub const MAX_QUEUES: usize = 64;
pub const MAX_SERVICES: usize = 64;
pub const MAX_SERVICE_NAME_LEN: usize = 63;
pub const SYSTEM_QUEUE_ID: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    PayloadTooLarge,
    ZeroLengthPayload,
    QueueFull,
    QueueEmpty,
    QueueNotFound,
    TooManyQueues,
    TooManyServices,
    ServiceNotFound,
    DuplicateService,
    NameTooLong,
    BufferTooSmall,
    Timeout,
}

/// `message_type` tag from `ipc.h`'s `IPC_MESSAGE_*` constants. Carried as
/// a plain `u32` at the wire boundary but exposed here as an enum so
/// callers in this crate's own API don't have to remember magic numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Data,
    System,
    Terminal,
    Service,
    Custom(u32),
}

impl MessageType {
    fn to_wire(self) -> u32 {
        match self {
            MessageType::Data => 0x01,
            MessageType::System => 0x02,
            MessageType::Terminal => 0x03,
            MessageType::Service => 0x04,
            MessageType::Custom(v) => v,
        }
    }

    fn from_wire(v: u32) -> Self {
        match v {
            0x01 => MessageType::Data,
            0x02 => MessageType::System,
            0x03 => MessageType::Terminal,
            0x04 => MessageType::Service,
            other => MessageType::Custom(other),
        }
    }
}

/// `message_flags` from `ipc.h`. `Blocking`/`NonBlocking` describe sender
/// intent at the protocol level; this crate's `send` never itself blocks
/// (the spec gives blocking semantics to `receive`'s timeout, not to
/// `send`), so the flag is recorded on the message and otherwise inert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageFlags {
    #[default]
    Blocking,
    NonBlocking,
    Urgent,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub sender: u64,
    pub payload: Vec<u8>,
    pub msg_type: MessageType,
    pub flags: MessageFlags,
    pub timestamp: u64,
}

struct Queue {
    id: u64,
    capacity: usize,
    messages: VecDeque<Message>,
}

struct Service {
    name: String,
    queue_id: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub len: usize,
    pub capacity: usize,
}

struct IpcState {
    queues: [Option<Queue>; MAX_QUEUES],
    services: Vec<Service>,
    next_queue_id: u64,
}

impl IpcState {
    fn new() -> Self {
        const NONE: Option<Queue> = None;
        IpcState { queues: [NONE; MAX_QUEUES], services: Vec::new(), next_queue_id: SYSTEM_QUEUE_ID }
    }

    fn free_slot(&self) -> Option<usize> {
        self.queues.iter().position(|q| q.is_none())
    }

    fn slot_of(&self, id: u64) -> Option<usize> {
        self.queues.iter().position(|q| q.as_ref().map(|q| q.id) == Some(id))
    }

    fn create(&mut self, capacity: usize) -> Result<u64, IpcError> {
        let capacity = capacity.min(SYSTEM_QUEUE_CAPACITY);
        let slot = self.free_slot().ok_or(IpcError::TooManyQueues)?;
        let id = self.next_queue_id;
        self.next_queue_id += 1;
        self.queues[slot] = Some(Queue { id, capacity, messages: VecDeque::new() });
        Ok(id)
    }
}

lazy_static::lazy_static! {
    static ref IPC: Mutex<IpcState> = Mutex::new(IpcState::new());
}

/// Resets all queues and services, then creates the reserved system queue
/// at [`SYSTEM_QUEUE_ID`] with capacity [`SYSTEM_QUEUE_CAPACITY`].
pub fn init() {
    let mut s = IPC.lock();
    *s = IpcState::new();
    let id = s.create(SYSTEM_QUEUE_CAPACITY).expect("fresh table always has room for queue 0");
    debug_assert_eq!(id, SYSTEM_QUEUE_ID);
    log!(Level::Info, "ipc", "system queue initialized, capacity {}", SYSTEM_QUEUE_CAPACITY);
}

pub fn create_queue(capacity: usize) -> Result<u64, IpcError> {
    let mut s = IPC.lock();
    let id = s.create(capacity)?;
    log!(Level::Debug, "ipc", "created queue {} capacity {}", id, capacity);
    Ok(id)
}

/// Drains and frees `id`'s messages, then the queue slot itself. The
/// system queue may not be destroyed.
pub fn destroy_queue(id: u64) -> Result<(), IpcError> {
    if id == SYSTEM_QUEUE_ID {
        return Err(IpcError::QueueNotFound);
    }
    let mut s = IPC.lock();
    let slot = s.slot_of(id).ok_or(IpcError::QueueNotFound)?;
    s.queues[slot] = None;
    s.services.retain(|svc| svc.queue_id != id);
    Ok(())
}

/// `dest = None` targets the system queue, matching "if dest is null,
/// targets the system queue" in spec §4.E.
pub fn send(
    dest: Option<u64>,
    sender: u64,
    payload: &[u8],
    msg_type: MessageType,
    flags: MessageFlags,
) -> Result<(), IpcError> {
    if payload.is_empty() {
        return Err(IpcError::ZeroLengthPayload);
    }
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(IpcError::PayloadTooLarge);
    }
    let queue_id = dest.unwrap_or(SYSTEM_QUEUE_ID);
    let mut s = IPC.lock();
    let slot = s.slot_of(queue_id).ok_or(IpcError::QueueNotFound)?;
    let queue = s.queues[slot].as_mut().unwrap();
    if queue.messages.len() >= queue.capacity {
        return Err(IpcError::QueueFull);
    }
    queue.messages.push_back(Message {
        sender,
        payload: payload.to_vec(),
        msg_type,
        flags,
        timestamp: talon_log::LOGGER.uptime_ticks(),
    });
    Ok(())
}

/// Pops the head message, if any, without waiting.
fn try_receive(queue_id: u64) -> Result<Message, IpcError> {
    let mut s = IPC.lock();
    let slot = s.slot_of(queue_id).ok_or(IpcError::QueueNotFound)?;
    let queue = s.queues[slot].as_mut().unwrap();
    queue.messages.pop_front().ok_or(IpcError::QueueEmpty)
}

/// A function capable of yielding the CPU while waiting for a message.
/// `talon_sched::yield_now` is the expected real implementation; tests
/// pass a no-op. Kept as an injected callback so this crate never has to
/// depend on the scheduler crate directly (it is the dependent, not a
/// dependency, in the spec's component order — IPC comes before the
/// filesystem layers that use it, and nothing requires it to know about
/// task internals).
pub trait Waiter {
    fn yield_now(&self);
    fn ticks_elapsed(&self, since: u64) -> u64;
}

/// `src = None` receives from the system queue. Waits up to `timeout_ms`
/// ticks (one tick is treated as one millisecond, per the uptime-tick
/// convention documented on [`talon_log::Logger::tick`]) if the queue is
/// empty, yielding each iteration via `waiter`. Copies the payload into
/// `buffer`, returning its length and type tag on success.
pub fn receive(
    src: Option<u64>,
    buffer: &mut [u8],
    timeout_ms: u64,
    waiter: &dyn Waiter,
) -> Result<(usize, MessageType), IpcError> {
    let queue_id = src.unwrap_or(SYSTEM_QUEUE_ID);
    let start = talon_log::LOGGER.uptime_ticks();
    loop {
        match try_receive(queue_id) {
            Ok(msg) => {
                if msg.payload.len() > buffer.len() {
                    return Err(IpcError::BufferTooSmall);
                }
                buffer[..msg.payload.len()].copy_from_slice(&msg.payload);
                return Ok((msg.payload.len(), msg.msg_type));
            }
            Err(IpcError::QueueEmpty) => {
                if waiter.ticks_elapsed(start) >= timeout_ms {
                    return Err(IpcError::Timeout);
                }
                waiter.yield_now();
            }
            Err(e) => return Err(e),
        }
    }
}

/// Non-waiting variant for callers that already know a message is present
/// or want to poll explicitly (used by [`Waiter`]-free unit tests).
pub fn receive_now(src: Option<u64>, buffer: &mut [u8]) -> Result<(usize, MessageType), IpcError> {
    let queue_id = src.unwrap_or(SYSTEM_QUEUE_ID);
    let msg = try_receive(queue_id)?;
    if msg.payload.len() > buffer.len() {
        return Err(IpcError::BufferTooSmall);
    }
    buffer[..msg.payload.len()].copy_from_slice(&msg.payload);
    Ok((msg.payload.len(), msg.msg_type))
}

pub fn queue_stats(queue_id: u64) -> Result<QueueStats, IpcError> {
    let s = IPC.lock();
    let slot = s.slot_of(queue_id).ok_or(IpcError::QueueNotFound)?;
    let queue = s.queues[slot].as_ref().unwrap();
    Ok(QueueStats { len: queue.messages.len(), capacity: queue.capacity })
}

pub fn register_service(name: &str) -> Result<u64, IpcError> {
    if name.len() > MAX_SERVICE_NAME_LEN {
        return Err(IpcError::NameTooLong);
    }
    let mut s = IPC.lock();
    if s.services.iter().any(|svc| svc.name == name) {
        return Err(IpcError::DuplicateService);
    }
    if s.services.len() >= MAX_SERVICES {
        return Err(IpcError::TooManyServices);
    }
    let queue_id = s.create(DEFAULT_SERVICE_QUEUE_CAPACITY)?;
    s.services.push(Service { name: name.to_string(), queue_id });
    log!(Level::Debug, "ipc", "registered service '{}' -> queue {}", name, queue_id);
    Ok(queue_id)
}

pub fn lookup_service(name: &str) -> Result<u64, IpcError> {
    let s = IPC.lock();
    s.services.iter().find(|svc| svc.name == name).map(|svc| svc.queue_id).ok_or(IpcError::ServiceNotFound)
}

pub fn unregister_service(name: &str) -> Result<(), IpcError> {
    let queue_id = {
        let mut s = IPC.lock();
        let idx = s.services.iter().position(|svc| svc.name == name).ok_or(IpcError::ServiceNotFound)?;
        s.services.remove(idx).queue_id
    };
    destroy_queue(queue_id)
}

/// Sends `payload` to the system queue and to every registered service's
/// queue. A queue that is full is skipped, not treated as a hard failure;
/// returns the count of queues the message was actually enqueued to.
pub fn broadcast(sender: u64, payload: &[u8], msg_type: MessageType) -> Result<usize, IpcError> {
    if payload.is_empty() {
        return Err(IpcError::ZeroLengthPayload);
    }
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(IpcError::PayloadTooLarge);
    }
    let targets: Vec<u64> = {
        let s = IPC.lock();
        core::iter::once(SYSTEM_QUEUE_ID).chain(s.services.iter().map(|svc| svc.queue_id)).collect()
    };
    let mut delivered = 0;
    for queue_id in targets {
        match send(Some(queue_id), sender, payload, msg_type, MessageFlags::NonBlocking) {
            Ok(()) => delivered += 1,
            Err(_) => log!(Level::Warning, "ipc", "broadcast skipped full/missing queue {}", queue_id),
        }
    }
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoWait;
    impl Waiter for NoWait {
        fn yield_now(&self) {}
        fn ticks_elapsed(&self, _since: u64) -> u64 {
            u64::MAX
        }
    }

    #[test]
    fn system_queue_exists_after_init() {
        init();
        let stats = queue_stats(SYSTEM_QUEUE_ID).unwrap();
        assert_eq!(stats.capacity, SYSTEM_QUEUE_CAPACITY);
        assert_eq!(stats.len, 0);
    }

    #[test]
    fn zero_length_payload_rejected() {
        init();
        assert_eq!(
            send(None, 1, b"", MessageType::Data, MessageFlags::Blocking).unwrap_err(),
            IpcError::ZeroLengthPayload
        );
    }

    #[test]
    fn send_then_receive_round_trips() {
        init();
        let q = create_queue(4).unwrap();
        send(Some(q), 1, b"hello", MessageType::Data, MessageFlags::Blocking).unwrap();
        let mut buf = [0u8; 16];
        let (len, ty) = receive_now(Some(q), &mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(ty, MessageType::Data);
        assert_eq!(receive_now(Some(q), &mut buf).unwrap_err(), IpcError::QueueEmpty);
    }

    #[test]
    fn oversized_payload_rejected() {
        init();
        let q = create_queue(4).unwrap();
        let big = vec![0u8; MAX_PAYLOAD_BYTES + 1];
        assert_eq!(
            send(Some(q), 1, &big, MessageType::Data, MessageFlags::Blocking).unwrap_err(),
            IpcError::PayloadTooLarge
        );
    }

    #[test]
    fn full_queue_rejects_further_sends() {
        init();
        let q = create_queue(2).unwrap();
        send(Some(q), 1, b"a", MessageType::Data, MessageFlags::Blocking).unwrap();
        send(Some(q), 1, b"b", MessageType::Data, MessageFlags::Blocking).unwrap();
        assert_eq!(
            send(Some(q), 1, b"c", MessageType::Data, MessageFlags::Blocking).unwrap_err(),
            IpcError::QueueFull
        );
    }

    #[test]
    fn scenario_4_echo_roundtrip() {
        init();
        let q = register_service("echo").unwrap();
        send(Some(q), 1, b"hi", MessageType::Service, MessageFlags::Blocking).unwrap();
        let mut buf = [0u8; 8];
        let (len, ty) = receive(Some(q), &mut buf, 10, &NoWait).unwrap();
        assert_eq!(&buf[..len], b"hi");
        assert_eq!(ty, MessageType::Service);
        assert_eq!(queue_stats(q).unwrap().len, 0);
    }

    #[test]
    fn receive_times_out_without_consuming() {
        init();
        let q = create_queue(4).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(receive(Some(q), &mut buf, 0, &NoWait).unwrap_err(), IpcError::Timeout);
    }

    #[test]
    fn service_registry_round_trips_and_rejects_duplicates() {
        init();
        let q = register_service("fsd").unwrap();
        assert_eq!(lookup_service("fsd").unwrap(), q);
        assert_eq!(register_service("fsd").unwrap_err(), IpcError::DuplicateService);
        unregister_service("fsd").unwrap();
        assert_eq!(lookup_service("fsd").unwrap_err(), IpcError::ServiceNotFound);
    }

    #[test]
    fn broadcast_delivers_to_system_and_every_registered_service() {
        init();
        let q1 = register_service("a").unwrap();
        let q2 = register_service("b").unwrap();
        let delivered = broadcast(0, b"ping", MessageType::System).unwrap();
        assert_eq!(delivered, 3); // system + a + b
        let mut buf = [0u8; 8];
        assert_eq!(&buf[..receive_now(Some(q1), &mut buf).unwrap().0], b"ping");
        assert_eq!(&buf[..receive_now(Some(q2), &mut buf).unwrap().0], b"ping");
        assert_eq!(&buf[..receive_now(None, &mut buf).unwrap().0], b"ping");
    }
}
