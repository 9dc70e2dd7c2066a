// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod common;

use aoc_runtime::service::{flags, TableWriter};
use aoc_runtime::{Direction, LifecycleState, Milestone, TransportError, Wait};
use common::*;
use std::thread;
use std::time::Duration;

fn message_service() -> TableWriter {
    TableWriter::new()
        .service("audio", flags(false, false, false), (8, 3), (8, 3))
        .service("sensors", flags(true, true, true), (16, 1), (16, 1))
        .service("log", flags(true, false, false), (64, 1), (0, 0))
}

#[test]
fn lookup_needs_an_online_device() {
    let h = Harness::new(config().finalize());
    assert_eq!(h.aoc.service("audio").err(), Some(TransportError::DeviceGone));

    h.bring_online(message_service());
    assert_eq!(h.aoc.services().len(), 3);
    assert_eq!(h.aoc.service("audio").unwrap().descriptor().index, 0);
    assert_eq!(
        h.aoc.service("video").err(),
        Some(TransportError::NoSuchService("video".into()))
    );
    assert_eq!(h.aoc.read_attribute("services").unwrap(), "audio,sensors,log");
}

#[test]
fn readiness_tracks_the_queues() {
    let h = Harness::new(config().finalize());
    h.bring_online(message_service());
    let audio = h.aoc.service("audio").unwrap();
    let desc = audio.descriptor().clone();

    assert!(!audio.can_read().unwrap());
    assert!(audio.can_write().unwrap());

    for msg in [&b"a"[..], b"bb", b"ccc"] {
        desc.d2h.produce(h.dram(), msg).unwrap();
        assert!(audio.can_read().unwrap());
    }
    for _ in 0..3 {
        audio.write(b"x", Wait::NonBlocking).unwrap();
    }
    assert!(!audio.can_write().unwrap());
    assert_eq!(
        audio.write(b"x", Wait::NonBlocking),
        Err(TransportError::WouldBlock)
    );

    let mut buf = [0u8; 8];
    for expected in [&b"a"[..], b"bb", b"ccc"] {
        let n = audio.read(&mut buf, Wait::NonBlocking).unwrap();
        assert_eq!(&buf[..n], expected);
    }
    assert!(!audio.can_read().unwrap());

    let n = desc.h2d.consume(h.dram(), &mut buf).unwrap();
    assert_eq!(&buf[..n], b"x");
    assert!(audio.can_write().unwrap());
}

#[test]
fn doorbells_follow_queue_activity() {
    let h = Harness::new(config().finalize());
    h.bring_online(message_service());
    let audio = h.aoc.service("audio").unwrap();
    let desc = audio.descriptor().clone();

    audio.write(b"hello", Wait::NonBlocking).unwrap();
    assert_eq!(h.device.doorbells(), [(0, Direction::HostToDevice)]);

    // Only a read that frees a full queue tells the device.
    desc.d2h.produce(h.dram(), b"1").unwrap();
    let mut buf = [0u8; 8];
    audio.read(&mut buf, Wait::NonBlocking).unwrap();
    assert_eq!(h.device.doorbells().len(), 1);

    for _ in 0..3 {
        desc.d2h.produce(h.dram(), b"2").unwrap();
    }
    audio.read(&mut buf, Wait::NonBlocking).unwrap();
    assert_eq!(h.device.doorbells()[1], (0, Direction::DeviceToHost));
}

#[test]
fn push_rings_skip_the_doorbell() {
    let h = Harness::new(config().finalize());
    h.bring_online(message_service());
    let sensors = h.aoc.service("sensors").unwrap();
    assert!(sensors.descriptor().is_push());

    assert_eq!(sensors.write(b"0123456789", Wait::NonBlocking), Ok(10));
    assert!(h.device.doorbells().is_empty());

    // Six bytes of room left in the ring.
    assert_eq!(
        sensors.write(b"0123456", Wait::NonBlocking),
        Err(TransportError::WouldBlock)
    );
    assert_eq!(sensors.write(b"012345", Wait::NonBlocking), Ok(6));
}

#[test]
fn ring_reads_return_what_is_there() {
    let h = Harness::new(config().finalize());
    h.bring_online(message_service());
    let log = h.aoc.service("log").unwrap();
    let desc = log.descriptor().clone();

    desc.d2h.produce(h.dram(), b"boot ok\n").unwrap();
    desc.d2h.produce(h.dram(), b"idle\n").unwrap();

    let mut buf = [0u8; 10];
    assert_eq!(log.read(&mut buf, Wait::NonBlocking), Ok(10));
    assert_eq!(&buf, b"boot ok\nid");
    assert_eq!(log.read(&mut buf, Wait::NonBlocking), Ok(3));
    assert_eq!(&buf[..3], b"le\n");
}

#[test]
fn argument_errors() {
    let h = Harness::new(config().finalize());
    h.bring_online(message_service());

    let audio = h.aoc.service("audio").unwrap();
    assert_eq!(
        audio.write(&[0; 9], Wait::NonBlocking),
        Err(TransportError::TooLarge { len: 9, max: 8 })
    );

    let log = h.aoc.service("log").unwrap();
    assert_eq!(
        log.write(b"x", Wait::NonBlocking),
        Err(TransportError::NoSuchDirection(Direction::HostToDevice))
    );
    assert_eq!(
        log.can_write(),
        Err(TransportError::NoSuchDirection(Direction::HostToDevice))
    );
}

#[test]
fn oversized_messages_stay_queued() {
    let h = Harness::new(config().finalize());
    h.bring_online(message_service());
    let audio = h.aoc.service("audio").unwrap();
    let desc = audio.descriptor().clone();
    desc.d2h.produce(h.dram(), b"12345678").unwrap();

    let mut small = [0u8; 4];
    assert_eq!(
        audio.read(&mut small, Wait::NonBlocking),
        Err(TransportError::TooLarge { len: 8, max: 4 })
    );
    let mut buf = [0u8; 8];
    assert_eq!(audio.read(&mut buf, Wait::NonBlocking), Ok(8));
}

#[test]
fn reads_time_out() {
    let h = Harness::new(config().finalize());
    h.bring_online(message_service());
    let audio = h.aoc.service("audio").unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(
        audio.read(&mut buf, Wait::NonBlocking),
        Err(TransportError::WouldBlock)
    );
    assert_eq!(
        audio.read(&mut buf, Wait::Timeout(Duration::from_millis(10))),
        Err(TransportError::TimedOut)
    );
}

#[test]
fn doorbell_wakes_a_blocked_reader() {
    let h = Harness::new(config().finalize());
    h.bring_online(message_service());
    let audio = h.aoc.service("audio").unwrap();
    let desc = audio.descriptor().clone();

    thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut buf = [0u8; 8];
            audio
                .read(&mut buf, Wait::Forever)
                .map(|n| buf[..n].to_vec())
        });

        thread::sleep(Duration::from_millis(20));
        desc.d2h.produce(h.dram(), b"wake").unwrap();
        h.aoc.interrupts().doorbell(Some(desc.index));
        h.aoc.poll();

        assert_eq!(reader.join().unwrap(), Ok(b"wake".to_vec()));
    });
}

#[test]
fn doorbell_survives_a_full_event_queue() {
    let h = Harness::new(config().queue_depth(1).finalize());
    h.aoc.boot("test.bin", image()).unwrap();
    h.aoc.poll();
    h.publish(message_service());
    assert_eq!(h.aoc.state(), LifecycleState::Online);

    let audio = h.aoc.service("audio").unwrap();
    let desc = audio.descriptor().clone();

    thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut buf = [0u8; 8];
            audio
                .read(&mut buf, Wait::Forever)
                .map(|n| buf[..n].to_vec())
        });

        thread::sleep(Duration::from_millis(20));
        let irq = h.aoc.interrupts();
        assert!(irq.liveness(Milestone::Heartbeat));
        desc.d2h.produce(h.dram(), b"late").unwrap();
        // No room for the doorbell event itself.
        assert!(!irq.liveness(Milestone::Heartbeat));
        assert!(irq.doorbell(Some(desc.index)));
        h.aoc.poll();

        assert_eq!(reader.join().unwrap(), Ok(b"late".to_vec()));
    });
}

#[test]
fn restart_fails_blocked_callers() {
    let h = Harness::new(config().finalize());
    h.bring_online(message_service());
    let audio = h.aoc.service("audio").unwrap();

    thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut buf = [0u8; 8];
            audio.read(&mut buf, Wait::Forever)
        });

        thread::sleep(Duration::from_millis(20));
        h.aoc.request_reset("test").unwrap();
        h.aoc.poll();

        assert_eq!(reader.join().unwrap(), Err(TransportError::DeviceGone));
    });

    // Stale handles stay dead after the device comes back.
    assert_eq!(h.aoc.state(), LifecycleState::FirmwareLoaded);
    h.publish(message_service());
    assert_eq!(h.aoc.state(), LifecycleState::Online);
    assert_eq!(audio.can_read(), Err(TransportError::DeviceGone));
    assert!(h.aoc.service("audio").unwrap().can_read().is_ok());
}
