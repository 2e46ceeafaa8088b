// SPDX-FileCopyrightText: 2023 Stefan Hackenberg <mail@stefan-hackenberg.de>
//
// SPDX-License-Identifier: MIT

//! Per cache counter dump.

use std::io::{self, Write};

use thousands::Separable;

use crate::{
    cache::{Cache, Outcome, Resolution},
    engine::Simulation,
    memref::{Operation, Segment},
};

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * part as f64 / total as f64
    }
}

pub fn write_stats<W: Write>(sim: &Simulation, w: &mut W) -> io::Result<()> {
    for cache in sim.caches().iter().rev() {
        write_cache(cache, w)?;
    }
    for id in sim.instrumented() {
        if let Some(counters) = sim.defense_counters(id) {
            writeln!(
                w,
                "{}: {} flushes, {} key rotations, {} breaths, {} of {} ways active",
                sim.cache(id).name,
                counters.flushes.separate_with_commas(),
                counters.key_rotations.separate_with_commas(),
                counters.breaths.separate_with_commas(),
                sim.cache(id).active_ways(),
                sim.cache(id).associativity()
            )?;
        }
    }
    Ok(())
}

pub fn write_cache<W: Write>(cache: &Cache, w: &mut W) -> io::Result<()> {
    let totals = cache.totals();
    writeln!(
        w,
        "{}: {} bytes, {} sets x {} ways, {} byte lines",
        cache.name,
        cache.config.size.separate_with_commas(),
        cache.set_count(),
        cache.associativity(),
        cache.line_size()
    )?;
    writeln!(
        w,
        "  accesses {:>16}  hits {:>16} ({:.2}%)  misses {:>16} ({:.2}%)",
        totals.access.separate_with_commas(),
        totals.hits.separate_with_commas(),
        ratio(totals.hits, totals.access),
        totals.misses.separate_with_commas(),
        ratio(totals.misses, totals.access)
    )?;
    writeln!(
        w,
        "  fetches {:>16}  write-backs {:>16}  evictions {:>16}  cleans {}  invalidations {}",
        totals.fetches.separate_with_commas(),
        totals.write_backs.separate_with_commas(),
        totals.evictions.separate_with_commas(),
        totals.cleans.separate_with_commas(),
        totals.invalidations.separate_with_commas()
    )?;
    writeln!(
        w,
        "  splits {}  wait {}  idle {}  sweeps {}",
        cache.counters.splits.separate_with_commas(),
        cache.counters.wait_time.separate_with_commas(),
        cache.counters.idle_time.separate_with_commas(),
        cache.counters.sweeps.separate_with_commas()
    )?;

    for op in Operation::ALL {
        let fetches = cache.counters.fetches[op.index()];
        if fetches > 0 {
            writeln!(
                w,
                "  {:<10} {:>16} fetches {:>16} misses",
                op.name(),
                fetches.separate_with_commas(),
                cache.counters.misses[op.index()].separate_with_commas()
            )?;
        }
    }

    for segment in Segment::ALL {
        let mut per_segment = crate::cache::SetCounters::default();
        for set in &cache.sets {
            per_segment.accumulate(&set.counters[segment.index()]);
        }
        if per_segment.access > 0 {
            writeln!(
                w,
                "  {:<7} {:>16} accesses {:>16} misses {:>12} write-backs {:>12} evictions",
                segment.name(),
                per_segment.access.separate_with_commas(),
                per_segment.misses.separate_with_commas(),
                per_segment.write_backs.separate_with_commas(),
                per_segment.evictions.separate_with_commas()
            )?;
        }
    }

    let written: u64 = Outcome::ALL
        .iter()
        .map(|&o| cache.classification.total(Resolution::Byte, o))
        .sum();
    if written > 0 {
        write!(w, "  {:<17}", "")?;
        for outcome in Outcome::ALL {
            write!(w, " {:>12}", outcome.name())?;
        }
        writeln!(w)?;
        for segment in Segment::ALL {
            for resolution in Resolution::ALL {
                let row = Outcome::ALL.map(|o| cache.classification.get(segment, resolution, o));
                if row.iter().all(|&n| n == 0) {
                    continue;
                }
                write!(w, "  {:<7} {:<9}", segment.name(), resolution.name())?;
                for n in row {
                    write!(w, " {:>12}", n.separate_with_commas())?;
                }
                writeln!(w)?;
            }
        }
    }
    Ok(())
}
