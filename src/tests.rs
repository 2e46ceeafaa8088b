// SPDX-FileCopyrightText: 2023 Stefan Hackenberg <mail@stefan-hackenberg.de>
//
// SPDX-License-Identifier: MIT

use std::{cell::RefCell, rc::Rc};

use crate::cache::{Outcome, Resolution};
use crate::config::{Architecture, CacheConfig, SimConfig};
use crate::engine::Simulation;
use crate::leakage::{LeakageModel, LeakageReport};
use crate::memref::{MemoryReference, Operation};
use crate::scheme::IndexScheme;
use crate::trace::{InMemoryTrace, TraceReader};
use crate::{run, simulate_readers};
use rstest::rstest;

#[ctor::ctor]
fn init() {
    env_logger::init();
}

/// Leakage model remembering every observed line address.
struct RecordingLeakage {
    observed: Rc<RefCell<Vec<u64>>>,
}

impl LeakageModel for RecordingLeakage {
    fn observe(&mut self, _set: usize, address: u64) {
        self.observed.borrow_mut().push(address);
    }

    fn finalize(&mut self) -> LeakageReport {
        LeakageReport {
            scheme: IndexScheme::Modulo,
            scheme_name: String::new(),
            line_size: 64,
            set_bits: 0,
            tracked_bits: 0,
            observed: self.observed.borrow().len() as u64,
            footprint: 0,
            sets: Vec::new(),
        }
    }
}

fn instrumented_l1() -> SimConfig {
    SimConfig {
        instrumented_level: 1,
        ..SimConfig::l1_only(CacheConfig::new(32768, 64, 8, 1))
    }
}

fn reads(addresses: &[u64]) -> Box<dyn TraceReader> {
    Box::new(InMemoryTrace::new(
        addresses
            .iter()
            .map(|&a| MemoryReference::new(Operation::Read, a, 8))
            .collect(),
    ))
}

fn recording_sim(config: &SimConfig) -> (Simulation, Rc<RefCell<Vec<u64>>>) {
    let observed = Rc::new(RefCell::new(Vec::new()));
    let sim = Simulation::new(config)
        .unwrap()
        .with_leakage(Box::new(RecordingLeakage {
            observed: observed.clone(),
        }));
    (sim, observed)
}

#[test]
fn test_strict_order_takes_streams_in_turn() {
    let (mut sim, observed) = recording_sim(&instrumented_l1());
    let mut readers = vec![reads(&[0x1000, 0x1040, 0x1080]), reads(&[0x2000, 0x2040])];
    let summary = run(&mut sim, &mut readers, true).unwrap();
    assert_eq!(summary.references, 5);
    assert_eq!(*observed.borrow(), vec![0x40, 0x80, 0x41, 0x81, 0x42]);
}

#[test]
fn test_clock_order_issues_everything() {
    let (mut sim, observed) = recording_sim(&instrumented_l1());
    let mut readers = vec![reads(&[0x1000, 0x1008, 0x1010]), reads(&[0x2000])];
    let summary = run(&mut sim, &mut readers, false).unwrap();
    assert_eq!(summary.references, 4);
    assert_eq!(observed.borrow().len(), 4);
    // both streams start at clock zero, the first one wins the tie
    assert_eq!(observed.borrow()[..2], [0x40, 0x80]);
    assert!(summary.clocks.iter().all(|&clock| clock > 150));
}

#[test]
fn test_bookkeeping_records_are_counted_only() {
    let (mut sim, observed) = recording_sim(&instrumented_l1());
    let trace = vec![
        MemoryReference::new(Operation::Allocate, 0x8000, 0),
        MemoryReference::new(Operation::Read, 0x1000, 4),
        MemoryReference::new(Operation::StackUpdate, 0x7fff0000, 0),
        MemoryReference::new(Operation::Free, 0x8000, 0),
    ];
    let mut readers: Vec<Box<dyn TraceReader>> = vec![Box::new(InMemoryTrace::new(trace))];
    let summary = run(&mut sim, &mut readers, false).unwrap();
    assert_eq!(summary.references, 1);
    assert_eq!(summary.bookkeeping, 3);
    assert_eq!(observed.borrow().len(), 1);
}

#[test]
fn test_instruction_fetches_use_l1i() {
    let config = SimConfig {
        cores: 2,
        ..SimConfig::default()
    };
    let mut sim = Simulation::new(&config).unwrap();
    let mut fetch = MemoryReference::new(Operation::InstructionFetch, 0x40_1000, 4).with_core(1);
    sim.issue(&mut fetch).unwrap();
    assert!(sim.cache(sim.l1i(1).unwrap()).find(0x40_1000).is_some());
    assert!(sim.cache(sim.l1d(1).unwrap()).find(0x40_1000).is_none());
    assert!(sim.cache(sim.l1i(0).unwrap()).find(0x40_1000).is_none());
}

#[test]
fn test_simulation_result() {
    let sim = Simulation::new(&instrumented_l1()).unwrap();
    let trace = vec![
        MemoryReference::new(Operation::Write, 0x1000, 8).with_data(&[1; 8]),
        MemoryReference::new(Operation::Read, 0x1000, 8),
    ];
    let mut readers: Vec<Box<dyn TraceReader>> = vec![Box::new(InMemoryTrace::new(trace))];
    let result = simulate_readers(sim, &mut readers, false).unwrap();
    assert_eq!(result.scheme, IndexScheme::Modulo);
    assert_eq!(result.summary.references, 2);
    assert_eq!(result.leakage.observed, 2);
    assert_eq!(result.leakage.sets_used(), 1);
    assert!(result.stats.contains("L1D[0]"));
}

#[test]
fn test_write_through_keeps_l1_clean() {
    let config = SimConfig {
        l1d: CacheConfig::new(32768, 64, 8, 1)
            .with_write_policy(crate::config::WritePolicy::WriteThrough),
        ..SimConfig::default()
    };
    let mut sim = Simulation::new(&config).unwrap();
    let l1 = sim.l1d(0).unwrap();
    let mut store = MemoryReference::new(Operation::Write, 0x3000, 4).with_data(&[7; 4]);
    sim.issue(&mut store).unwrap();

    let cache = sim.cache(l1);
    let (set, way) = cache.find(0x3000).unwrap();
    assert!(!cache.sets[set].line(way).is_dirty());
    let l2 = sim.caches().iter().find(|c| c.level == 2).unwrap();
    let (set, way) = l2.find(0x3000).unwrap();
    assert!(l2.sets[set].line(way).is_dirty());
    assert_eq!(l2.sets[set].line(way).data[..4], [7; 4]);
    assert_eq!(l2.classification.total(Resolution::Byte, Outcome::Live), 4);
}

#[test]
fn test_no_write_allocate_forwards_store() {
    let config = SimConfig {
        l1d: CacheConfig {
            write_allocate: false,
            ..CacheConfig::new(32768, 64, 8, 1)
        },
        ..SimConfig::default()
    };
    let mut sim = Simulation::new(&config).unwrap();
    let l1 = sim.l1d(0).unwrap();
    let mut store = MemoryReference::new(Operation::Write, 0x3000, 4);
    sim.issue(&mut store).unwrap();
    assert!(sim.cache(l1).find(0x3000).is_none());
    assert_eq!(sim.cache(l1).totals().misses, 1);
    let l2 = sim.caches().iter().find(|c| c.level == 2).unwrap();
    assert!(l2.find(0x3000).is_some());
}

fn timed_read(sim: &mut Simulation, address: u64, time: u64) -> u64 {
    let mut mr = MemoryReference::new(Operation::Read, address, 8);
    mr.time = time;
    sim.issue(&mut mr).unwrap()
}

// 0x2040 sits in bank 1 and 0x1000 in bank 0 of a two bank cache. The read at
// 1000 arrives while the miss of 0x1000 is outstanding until 1151.
#[rstest]
#[case(Architecture::Blocking, 0x2040, 1152, 151, 849)]
#[case(Architecture::HitUnderMiss, 0x2040, 1002, 1, 849)]
#[case(Architecture::HitUnderMiss, 0x1008, 1152, 151, 849)]
#[case(Architecture::Distributed, 0x2040, 1001, 0, 1849)]
fn test_stalls_behind_outstanding_miss(
    #[case] architecture: Architecture,
    #[case] address: u64,
    #[case] done: u64,
    #[case] wait: u64,
    #[case] idle: u64,
) {
    let config = SimConfig::l1_only(CacheConfig {
        architecture,
        banks: 2,
        ..CacheConfig::new(32768, 64, 8, 1)
    });
    let mut sim = Simulation::new(&config).unwrap();
    let l1 = sim.l1d(0).unwrap();

    assert_eq!(timed_read(&mut sim, 0x2040, 0), 151);
    assert_eq!(timed_read(&mut sim, 0x1000, 1000), 1151);
    assert_eq!(timed_read(&mut sim, address, 1000), done);

    let cache = sim.cache(l1);
    assert_eq!(cache.totals().hits, 1);
    assert_eq!(cache.counters.wait_time, wait);
    assert_eq!(cache.counters.idle_time, idle);
}

#[test]
fn test_idle_reference_does_not_wait() {
    let mut sim = Simulation::new(&instrumented_l1()).unwrap();
    let l1 = sim.l1d(0).unwrap();
    let first = timed_read(&mut sim, 0x1000, 0);
    // the bank is free again one access after the miss started
    assert_eq!(timed_read(&mut sim, 0x1008, first + 10), first + 11);
    let cache = sim.cache(l1);
    assert_eq!(cache.counters.wait_time, 0);
    assert_eq!(cache.counters.idle_time, 10);
}
