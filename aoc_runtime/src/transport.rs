// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading and writing services.
//!
//! Each direction of a service is a single-producer single-consumer queue
//! in DRAM: the producer advances `tx`, the consumer advances `rx`. In
//! message mode the counters count messages and each slot is a length word
//! followed by the payload; in ring mode there is one slot used as a byte
//! ring and the counters count bytes.
//!
//! Counters wrap at the largest multiple of the queue's capacity that fits
//! in 32 bits, so the slot or byte position a counter names stays
//! continuous across the wrap. For power-of-two capacities that is plain
//! `u32` wrapping.
//!
//! Callers may block. A blocked caller sets the blocked bit for its
//! direction and sleeps on that direction's condition variable; the
//! supervisor wakes it when the device rings the host doorbell, and every
//! waiter is woken when the service dies.

use crate::memory::{MemoryError, Region};
use crate::registry::ServiceDriver;
use crate::service::{Channel, Direction, Mode, ServiceDescriptor};
use crate::util::lock;
use crate::Aoc;
use log::trace;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TransportError {
    #[error("no service named {0:?}")]
    NoSuchService(String),

    #[error("service has no {0} direction")]
    NoSuchDirection(Direction),

    #[error("{len} bytes exceed the {max}-byte slot")]
    TooLarge { len: usize, max: usize },

    #[error("operation would block")]
    WouldBlock,

    #[error("timed out")]
    TimedOut,

    #[error("the co-processor is not running")]
    DeviceGone,

    /// The device wrote a message longer than its slot.
    #[error("device wrote a {len}-byte message into a {max}-byte slot")]
    Malformed { len: usize, max: usize },

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// How long a read or write may wait.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Wait {
    NonBlocking,
    Forever,
    Timeout(Duration),
}

impl Wait {
    fn deadline(self) -> Option<Instant> {
        match self {
            Wait::Timeout(d) => Instant::now().checked_add(d),
            _ => None,
        }
    }
}

// =============================================================================
// Queue operations on shared memory
// =============================================================================

impl Channel {
    fn counters(&self, dram: &Region) -> Result<(u32, u32), MemoryError> {
        Ok((dram.read_u32(self.tx_at)?, dram.read_u32(self.rx_at)?))
    }

    /// Number of queued messages (message mode) or bytes (ring mode).
    pub fn pending(&self, dram: &Region) -> Result<u32, MemoryError> {
        let (tx, rx) = self.counters(dram)?;
        Ok(self.distance(tx, rx))
    }

    /// Where counters wrap: the largest multiple of the capacity that fits
    /// in 32 bits.
    pub fn counter_modulus(&self) -> u64 {
        let unit = u64::from(self.capacity().max(1));
        (1u64 << 32) / unit * unit
    }

    fn advance(&self, counter: u32, by: u32) -> u32 {
        let m = self.counter_modulus();
        ((u64::from(counter) % m + u64::from(by)) % m) as u32
    }

    fn distance(&self, tx: u32, rx: u32) -> u32 {
        let m = self.counter_modulus();
        ((u64::from(tx) % m + m - u64::from(rx) % m) % m) as u32
    }

    /// Position a counter names within the queue: a slot in message mode, a
    /// byte offset in ring mode.
    fn position(&self, counter: u32) -> usize {
        (u64::from(counter) % self.counter_modulus() % u64::from(self.capacity().max(1))) as usize
    }

    fn capacity(&self) -> u32 {
        match self.mode {
            Mode::Message => self.slot_count,
            Mode::Ring => self.slot_size,
        }
    }

    pub fn can_read(&self, dram: &Region) -> Result<bool, MemoryError> {
        Ok(self.pending(dram)? > 0)
    }

    pub fn can_write(&self, dram: &Region) -> Result<bool, MemoryError> {
        Ok(self.pending(dram)? < self.capacity())
    }

    /// Room for a `len`-byte write.
    fn has_room(&self, dram: &Region, len: usize) -> Result<bool, MemoryError> {
        let pending = self.pending(dram)?;
        Ok(match self.mode {
            Mode::Message => pending < self.slot_count,
            Mode::Ring => (self.slot_size.saturating_sub(pending)) as usize >= len,
        })
    }

    fn message_at(&self, counter: u32) -> usize {
        self.data_at + self.position(counter) * self.slot_stride()
    }

    /// Consume from the queue into `buf`. The caller has checked there is
    /// something to read.
    pub fn consume(&self, dram: &Region, buf: &mut [u8]) -> Result<usize, TransportError> {
        let (tx, rx) = self.counters(dram)?;
        match self.mode {
            Mode::Message => {
                let at = self.message_at(rx);
                let len = dram.read_u32(at)? as usize;
                if len > self.slot_size as usize {
                    return Err(TransportError::Malformed {
                        len,
                        max: self.slot_size as usize,
                    });
                }
                if len > buf.len() {
                    return Err(TransportError::TooLarge { len, max: buf.len() });
                }
                dram.read(at + 4, &mut buf[..len])?;
                dram.write_u32(self.rx_at, self.advance(rx, 1))?;
                Ok(len)
            }
            Mode::Ring => {
                let cap = self.slot_size as usize;
                let n = (self.distance(tx, rx) as usize).min(cap).min(buf.len());
                let start = self.position(rx);
                let first = n.min(cap - start);
                dram.read(self.data_at + start, &mut buf[..first])?;
                dram.read(self.data_at, &mut buf[first..n])?;
                dram.write_u32(self.rx_at, self.advance(rx, n as u32))?;
                Ok(n)
            }
        }
    }

    /// Append `data`. The caller has checked there is room.
    pub fn produce(&self, dram: &Region, data: &[u8]) -> Result<(), MemoryError> {
        let tx = dram.read_u32(self.tx_at)?;
        match self.mode {
            Mode::Message => {
                let at = self.message_at(tx);
                dram.write_u32(at, data.len() as u32)?;
                dram.write(at + 4, data)?;
                dram.write_u32(self.tx_at, self.advance(tx, 1))
            }
            Mode::Ring => {
                let cap = self.slot_size as usize;
                let start = self.position(tx);
                let first = data.len().min(cap - start);
                dram.write(self.data_at + start, &data[..first])?;
                dram.write(self.data_at, &data[first..])?;
                dram.write_u32(self.tx_at, self.advance(tx, data.len() as u32))
            }
        }
    }

    /// Largest single write this direction accepts.
    pub fn max_write(&self) -> usize {
        self.slot_size as usize
    }
}

// =============================================================================
// Per-service runtime state
// =============================================================================

#[derive(Debug, Default)]
struct WaitState {
    dead: bool,
    blocked: [bool; 2],
}

/// Runtime state of one online service. Lives exactly as long as the
/// service table it came from.
pub(crate) struct Service {
    descriptor: ServiceDescriptor,
    driver: Option<Arc<dyn ServiceDriver>>,
    wait: Mutex<WaitState>,
    queues: [Condvar; 2],
}

impl Service {
    pub(crate) fn new(descriptor: ServiceDescriptor, driver: Option<Arc<dyn ServiceDriver>>) -> Service {
        Service {
            descriptor,
            driver,
            wait: Mutex::new(WaitState::default()),
            queues: [Condvar::new(), Condvar::new()],
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub(crate) fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub(crate) fn driver(&self) -> Option<&Arc<dyn ServiceDriver>> {
        self.driver.as_ref()
    }

    /// Mark dead and wake everyone.
    pub(crate) fn kill(&self) {
        let mut state = lock(&self.wait);
        state.dead = true;
        state.blocked = [false; 2];
        for queue in &self.queues {
            queue.notify_all();
        }
    }

    /// Wake waiters on `direction` if any are blocked.
    pub(crate) fn wake(&self, direction: Direction) {
        let mut state = lock(&self.wait);
        if state.blocked[direction as usize] {
            trace!("waking {direction} waiters of {:?}", self.descriptor.name);
            state.blocked[direction as usize] = false;
            self.queues[direction as usize].notify_all();
        }
    }

    fn sleep<'a>(
        &'a self,
        mut state: MutexGuard<'a, WaitState>,
        direction: Direction,
        wait: Wait,
        deadline: Option<Instant>,
    ) -> Result<MutexGuard<'a, WaitState>, TransportError> {
        let queue = &self.queues[direction as usize];
        match (wait, deadline) {
            (Wait::NonBlocking, _) => Err(TransportError::WouldBlock),
            (Wait::Timeout(_), Some(deadline)) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(TransportError::TimedOut);
                }
                state.blocked[direction as usize] = true;
                let (state, _) = queue
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                Ok(state)
            }
            // Forever, or a timeout too long to represent.
            _ => {
                state.blocked[direction as usize] = true;
                Ok(queue.wait(state).unwrap_or_else(PoisonError::into_inner))
            }
        }
    }
}

// =============================================================================
// Public Interface
// =============================================================================

/// A caller's handle on a named service.
///
/// Handles stay valid objects across restarts, but once the service table
/// they came from is torn down every call fails with
/// [`TransportError::DeviceGone`]. Look the service up again once the
/// device is back online.
pub struct ServiceHandle<'a> {
    aoc: &'a Aoc,
    service: Arc<Service>,
}

/// Counts one in-flight transport operation.
struct InFlight<'a>(&'a Aoc);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Aoc {
    /// Look up an online service by name.
    pub fn service(&self, name: &str) -> Result<ServiceHandle<'_>, TransportError> {
        let table = lock(&self.table);
        if table.state != crate::LifecycleState::Online {
            return Err(TransportError::DeviceGone);
        }
        let service = table
            .find(name)
            .ok_or_else(|| TransportError::NoSuchService(name.to_string()))?;
        Ok(ServiceHandle {
            aoc: self,
            service: service.clone(),
        })
    }

    /// Descriptors of every online service, in table order.
    pub fn services(&self) -> Vec<ServiceDescriptor> {
        lock(&self.table)
            .services
            .iter()
            .map(|s| s.descriptor().clone())
            .collect()
    }

    fn begin_op(&self) -> Result<InFlight<'_>, TransportError> {
        let table = lock(&self.table);
        if table.state != crate::LifecycleState::Online {
            return Err(TransportError::DeviceGone);
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(InFlight(self))
    }

    fn is_online(&self) -> bool {
        self.state.load() == crate::LifecycleState::Online
    }
}

impl ServiceHandle<'_> {
    pub fn name(&self) -> &str {
        self.service.name()
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        self.service.descriptor()
    }

    fn channel(&self, direction: Direction) -> Result<&Channel, TransportError> {
        let channel = self.service.descriptor().channel(direction);
        if channel.is_configured() {
            Ok(channel)
        } else {
            Err(TransportError::NoSuchDirection(direction))
        }
    }

    fn check_alive(&self, dead: bool) -> Result<(), TransportError> {
        if dead || !self.aoc.is_online() {
            Err(TransportError::DeviceGone)
        } else {
            Ok(())
        }
    }

    /// Whether a read would find data.
    pub fn can_read(&self) -> Result<bool, TransportError> {
        let _op = self.aoc.begin_op()?;
        let channel = self.channel(Direction::DeviceToHost)?;
        self.check_alive(lock(&self.service.wait).dead)?;
        Ok(channel.can_read(self.aoc.memory.dram())?)
    }

    /// Whether a write would find room.
    pub fn can_write(&self) -> Result<bool, TransportError> {
        let _op = self.aoc.begin_op()?;
        let channel = self.channel(Direction::HostToDevice)?;
        self.check_alive(lock(&self.service.wait).dead)?;
        Ok(channel.can_write(self.aoc.memory.dram())?)
    }

    /// Read one message, or up to `buf.len()` bytes of a ring.
    ///
    /// A message larger than `buf` fails with [`TransportError::TooLarge`]
    /// and stays queued.
    pub fn read(&self, buf: &mut [u8], wait: Wait) -> Result<usize, TransportError> {
        let _op = self.aoc.begin_op()?;
        let channel = self.channel(Direction::DeviceToHost)?;
        let dram = self.aoc.memory.dram();
        let deadline = wait.deadline();

        let mut state = lock(&self.service.wait);
        loop {
            self.check_alive(state.dead)?;
            if channel.can_read(dram)? {
                break;
            }
            state = self.service.sleep(state, Direction::DeviceToHost, wait, deadline)?;
        }

        let was_full = !channel.can_write(dram)?;
        let n = channel.consume(dram, buf)?;
        drop(state);

        if was_full {
            self.aoc
                .platform
                .signal_device(self.service.descriptor().index, Direction::DeviceToHost);
        }
        Ok(n)
    }

    /// Queue `data` for the device, waiting for room as `wait` allows.
    pub fn write(&self, data: &[u8], wait: Wait) -> Result<usize, TransportError> {
        let _op = self.aoc.begin_op()?;
        let channel = self.channel(Direction::HostToDevice)?;
        if data.len() > channel.max_write() {
            return Err(TransportError::TooLarge {
                len: data.len(),
                max: channel.max_write(),
            });
        }
        let dram = self.aoc.memory.dram();
        let deadline = wait.deadline();

        let mut state = lock(&self.service.wait);
        loop {
            self.check_alive(state.dead)?;
            if channel.has_room(dram, data.len())? {
                break;
            }
            state = self.service.sleep(state, Direction::HostToDevice, wait, deadline)?;
        }
        channel.produce(dram, data)?;
        drop(state);

        if !self.service.descriptor().is_push() {
            self.aoc
                .platform
                .signal_device(self.service.descriptor().index, Direction::HostToDevice);
        }
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{flags, TableWriter};

    fn setup(ring: bool) -> (Region, ServiceDescriptor) {
        let dram = Region::new("dram", 0, 0, 0x2000);
        let (d2h, h2d) = if ring { ((16, 1), (16, 1)) } else { ((8, 3), (8, 3)) };
        TableWriter::new()
            .service("svc", flags(ring, ring, false), d2h, h2d)
            .write(&dram, 0)
            .unwrap();
        let mut services = crate::service::scan(&dram, 0).unwrap().unwrap();
        (dram, services.remove(0))
    }

    #[test]
    fn message_queue_fills_and_drains_in_order() {
        let (dram, svc) = setup(false);
        let h2d = svc.h2d;
        assert!(!h2d.can_read(&dram).unwrap());
        assert!(h2d.can_write(&dram).unwrap());

        for (i, msg) in [&b"one"[..], b"two", b"three"].iter().enumerate() {
            h2d.produce(&dram, msg).unwrap();
            assert!(h2d.can_read(&dram).unwrap());
            assert_eq!(h2d.can_write(&dram).unwrap(), i < 2);
        }

        let mut buf = [0u8; 8];
        for expected in [&b"one"[..], b"two", b"three"] {
            let n = h2d.consume(&dram, &mut buf).unwrap();
            assert_eq!(&buf[..n], expected);
        }
        assert!(!h2d.can_read(&dram).unwrap());
    }

    #[test]
    fn too_large_message_stays_queued() {
        let (dram, svc) = setup(false);
        let d2h = svc.d2h;
        d2h.produce(&dram, b"12345678").unwrap();

        let mut small = [0u8; 4];
        assert_eq!(
            d2h.consume(&dram, &mut small),
            Err(TransportError::TooLarge { len: 8, max: 4 })
        );
        let mut buf = [0u8; 8];
        assert_eq!(d2h.consume(&dram, &mut buf).unwrap(), 8);
    }

    #[test]
    fn malformed_length_is_reported() {
        let (dram, svc) = setup(false);
        let d2h = svc.d2h;
        d2h.produce(&dram, b"hi").unwrap();
        dram.write_u32(d2h.data_at, 9).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(
            d2h.consume(&dram, &mut buf),
            Err(TransportError::Malformed { len: 9, max: 8 })
        );
    }

    #[test]
    fn ring_wraps() {
        let (dram, svc) = setup(true);
        let ring = svc.d2h;
        let mut buf = [0u8; 16];

        ring.produce(&dram, b"0123456789").unwrap();
        assert_eq!(ring.consume(&dram, &mut buf[..6]).unwrap(), 6);
        assert_eq!(&buf[..6], b"012345");

        // 4 bytes pending, 12 free; this write wraps around the end.
        assert!(ring.has_room(&dram, 12).unwrap());
        assert!(!ring.has_room(&dram, 13).unwrap());
        ring.produce(&dram, b"abcdefghijkl").unwrap();
        assert!(!ring.can_write(&dram).unwrap());

        assert_eq!(ring.consume(&dram, &mut buf).unwrap(), 16);
        assert_eq!(&buf, b"6789abcdefghijkl");
    }

    #[test]
    fn counters_wrap_around() {
        let (dram, svc) = setup(true);
        let ring = svc.d2h;
        assert_eq!(ring.counter_modulus(), 1 << 32);
        dram.write_u32(ring.tx_at, u32::MAX).unwrap();
        dram.write_u32(ring.rx_at, u32::MAX).unwrap();
        ring.produce(&dram, b"xy").unwrap();
        assert_eq!(dram.read_u32(ring.tx_at).unwrap(), 1);
        assert_eq!(ring.pending(&dram).unwrap(), 2);

        let mut buf = [0u8; 8];
        assert_eq!(ring.consume(&dram, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"xy");
    }

    #[test]
    fn three_slot_queue_stays_in_order_across_the_wrap() {
        let (dram, svc) = setup(false);
        let d2h = svc.d2h;
        let last = (d2h.counter_modulus() - 1) as u32;
        assert_eq!(last, u32::MAX - 1);
        dram.write_u32(d2h.tx_at, last).unwrap();
        dram.write_u32(d2h.rx_at, last).unwrap();

        d2h.produce(&dram, b"first").unwrap();
        d2h.produce(&dram, b"second").unwrap();
        assert_eq!(dram.read_u32(d2h.tx_at).unwrap(), 1);
        assert_eq!(d2h.pending(&dram).unwrap(), 2);
        assert!(d2h.can_write(&dram).unwrap());

        let mut buf = [0u8; 8];
        let n = d2h.consume(&dram, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"first");
        let n = d2h.consume(&dram, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"second");
        assert_eq!(dram.read_u32(d2h.rx_at).unwrap(), 1);
        assert!(!d2h.can_read(&dram).unwrap());
    }
}
