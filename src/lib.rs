// SPDX-FileCopyrightText: 2023 Stefan Hackenberg <mail@stefan-hackenberg.de>
//
// SPDX-License-Identifier: MIT

//! Trace driven cache hierarchy simulator measuring how much a cache's set
//! index reveals about the addresses mapped onto it.
//!
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod itc;
pub mod leakage;
pub mod memref;
pub mod scheme;
pub mod stats;
pub mod trace;

#[cfg(test)]
mod tests;

use std::path::Path;

use anyhow::Result;
use log::info;

use config::SimConfig;
use engine::Simulation;
use leakage::LeakageReport;
use scheme::IndexScheme;
use trace::{MoolaTextReader, TraceReader};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// References issued to the hierarchy.
    pub references: u64,
    /// Allocation, free and stack records that were only counted.
    pub bookkeeping: u64,
    /// Completion time of the last reference of every stream.
    pub clocks: Vec<u64>,
}

#[derive(Clone, Debug)]
pub struct SimulationResult {
    pub scheme: IndexScheme,
    pub summary: RunSummary,
    pub leakage: LeakageReport,
    pub stats: String,
}

/// Feed every stream of `readers` through `sim` until all are exhausted.
///
/// The next reference comes from the stream whose clock is furthest behind,
/// or from the streams in turn with `strict_order`.
pub fn run(
    sim: &mut Simulation,
    readers: &mut [Box<dyn TraceReader>],
    strict_order: bool,
) -> Result<RunSummary> {
    let mut pending = readers
        .iter_mut()
        .map(|reader| reader.next())
        .collect::<Result<Vec<_>>>()?;
    let mut summary = RunSummary {
        clocks: vec![0; readers.len()],
        ..Default::default()
    };

    let mut turn = 0;
    loop {
        let stream = if strict_order {
            (0..pending.len())
                .map(|k| (turn + k) % pending.len())
                .find(|&i| pending[i].is_some())
        } else {
            pending
                .iter()
                .enumerate()
                .filter(|(_, mr)| mr.is_some())
                .min_by_key(|(i, _)| summary.clocks[*i])
                .map(|(i, _)| i)
        };
        let Some(stream) = stream else {
            break;
        };
        turn = stream + 1;

        if let Some(mut mr) = pending[stream].take() {
            mr.time = summary.clocks[stream];
            if mr.operation.is_bookkeeping() {
                summary.bookkeeping += 1;
            } else {
                summary.clocks[stream] = sim.issue(&mut mr)?;
                summary.references += 1;
            }
        }
        pending[stream] = readers[stream].next()?;
    }
    for reader in readers.iter_mut() {
        reader.close();
    }

    info!(
        "{} references, {} bookkeeping records, finished at {:?}",
        summary.references, summary.bookkeeping, summary.clocks
    );
    Ok(summary)
}

/// Run `sim` over `readers` and collect its figures.
pub fn simulate_readers(
    mut sim: Simulation,
    readers: &mut [Box<dyn TraceReader>],
    strict_order: bool,
) -> Result<SimulationResult> {
    let summary = run(&mut sim, readers, strict_order)?;
    let leakage = sim.finish();
    let mut stats = Vec::new();
    stats::write_stats(&sim, &mut stats)?;
    Ok(SimulationResult {
        scheme: sim.scheme(),
        summary,
        leakage,
        stats: String::from_utf8_lossy(&stats).into_owned(),
    })
}

/// Simulate the hierarchy of `config` over the given trace files.
pub fn simulate<P: AsRef<Path>>(
    config: &SimConfig,
    traces: &[P],
    with_data: bool,
) -> Result<SimulationResult> {
    let sim = Simulation::new(config)?;
    let mut readers = traces
        .iter()
        .map(|path| {
            MoolaTextReader::open(path, with_data).map(|r| Box::new(r) as Box<dyn TraceReader>)
        })
        .collect::<Result<Vec<_>>>()?;
    simulate_readers(sim, &mut readers, config.strict_order)
}
