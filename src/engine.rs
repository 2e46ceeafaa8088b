// SPDX-FileCopyrightText: 2023 Stefan Hackenberg <mail@stefan-hackenberg.de>
//
// SPDX-License-Identifier: MIT

//! Reference engine.
//!
//! A [`Simulation`] owns every cache of the hierarchy in one arena and moves
//! references through it. Lower levels are reached through [`CacheId`]s, so a
//! miss recursing towards memory never needs more than one mutable borrow of
//! the arena at a time: the line being filled or written back is moved out of
//! its set for the duration of the call and put back afterwards.

use anyhow::Result;
use log::{debug, info, trace, warn};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    cache::{stat, Cache, CacheId, CacheKind, CacheLine, Classification, Outcome, Resolution},
    config::{Architecture, Coherence, Prefetch, Replacement, SimConfig, WritePolicy},
    error::SimError,
    leakage::{EntropyLeakage, LeakageModel, LeakageReport},
    memref::{ref_split, MemoryReference, Operation, RefPool, Segment, MAX_REFERENCE_SIZE},
    scheme::{compute_set, IndexScheme, SchemeKeys},
};

/// Source of "dead" knowledge for written bytes.
pub trait LivenessOracle {
    /// Whether the value written to `address` is never read again.
    fn is_dead(&self, address: u64, segment: Segment) -> bool;
}

/// Oracle that knows nothing, so no write is ever dead.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverDead;

impl LivenessOracle for NeverDead {
    fn is_dead(&self, _address: u64, _segment: Segment) -> bool {
        false
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DefenseCounters {
    pub flushes: u64,
    pub breaths: u64,
    pub key_rotations: u64,
}

/// Per cache state of an instrumented cache.
#[derive(Clone, Debug)]
struct Instrument {
    keys: SchemeKeys,
    since_flush: u64,
    since_breath: u64,
    growing: bool,
    counters: DefenseCounters,
}

enum Access<'a> {
    Demand(&'a mut MemoryReference),
    /// Fetch on behalf of the upper level line.
    Fill(&'a mut MemoryReference, &'a mut CacheLine),
    WriteBack(&'a mut CacheLine),
}

impl Access<'_> {
    fn address(&self) -> u64 {
        match self {
            Access::Demand(mr) | Access::Fill(mr, _) => mr.address,
            Access::WriteBack(line) => line.address,
        }
    }

    fn operation(&self) -> Operation {
        match self {
            Access::Demand(mr) | Access::Fill(mr, _) => mr.operation,
            Access::WriteBack(line) => line.operation,
        }
    }

    fn segment(&self) -> Segment {
        match self {
            Access::Demand(mr) | Access::Fill(mr, _) => mr.segment,
            Access::WriteBack(line) => line.segment,
        }
    }

    fn time(&self) -> u64 {
        match self {
            Access::Demand(mr) | Access::Fill(mr, _) => mr.time,
            Access::WriteBack(line) => line.time,
        }
    }

    fn set_time(&mut self, time: u64) {
        match self {
            Access::Demand(mr) => mr.time = time,
            Access::Fill(mr, line) => {
                mr.time = time;
                line.time = time;
            }
            Access::WriteBack(line) => line.time = time,
        }
    }
}

pub struct Simulation {
    caches: Vec<Cache>,
    l1i: Vec<CacheId>,
    l1d: Vec<CacheId>,
    pool: RefPool,
    scheme: IndexScheme,
    instrumented_level: u8,
    instruments: Vec<Option<Instrument>>,
    flush_threshold: u64,
    dynamic_threshold: u64,
    rng: StdRng,
    leakage: Box<dyn LeakageModel>,
    liveness: Box<dyn LivenessOracle>,
}

impl Simulation {
    /// Build the hierarchy described by `config`.
    ///
    /// Caches are created memory first so that every cache knows the id of
    /// the level below it.
    pub fn new(config: &SimConfig) -> Result<Self> {
        if config.cores == 0 {
            return Err(SimError::InvalidTopology("zero cores".to_string()).into());
        }
        let levels: Vec<_> = config.lower_levels().collect();
        let memory_level = levels.last().map_or(2, |(level, _)| level + 1);

        let mut caches = vec![Cache::new(
            "memory",
            memory_level,
            CacheKind::Memory,
            config.memory.clone(),
            None,
        )?];
        let mut below: Vec<CacheId> = vec![0];
        let mut below_shared = true;
        for (level, cache_config) in levels.into_iter().rev() {
            if cache_config.shared {
                if !below_shared {
                    return Err(SimError::InvalidTopology(format!(
                        "shared L{level} above a private level"
                    ))
                    .into());
                }
                caches.push(Cache::new(
                    format!("L{level}"),
                    level,
                    CacheKind::Unified,
                    cache_config.clone(),
                    Some(below[0]),
                )?);
                below = vec![caches.len() - 1];
            } else {
                let mut private = Vec::with_capacity(config.cores);
                for core in 0..config.cores {
                    let lower = if below_shared { below[0] } else { below[core] };
                    caches.push(Cache::new(
                        format!("L{level}[{core}]"),
                        level,
                        CacheKind::Unified,
                        cache_config.clone(),
                        Some(lower),
                    )?);
                    private.push(caches.len() - 1);
                }
                below = private;
                below_shared = false;
            }
        }

        let mut l1i = Vec::with_capacity(config.cores);
        let mut l1d = Vec::with_capacity(config.cores);
        for core in 0..config.cores {
            let lower = if below_shared { below[0] } else { below[core] };
            caches.push(Cache::new(
                format!("L1I[{core}]"),
                1,
                CacheKind::Instruction,
                config.l1i.clone(),
                Some(lower),
            )?);
            l1i.push(caches.len() - 1);
            caches.push(Cache::new(
                format!("L1D[{core}]"),
                1,
                CacheKind::Data,
                config.l1d.clone(),
                Some(lower),
            )?);
            l1d.push(caches.len() - 1);
        }

        for cache in &caches {
            warn_unmodeled(cache);
        }

        let mut instruments = vec![None; caches.len()];
        let mut leakage_geometry = None;
        for (id, cache) in caches.iter_mut().enumerate() {
            let instrumented = config.instrumented_level > 0
                && cache.level == config.instrumented_level
                && matches!(cache.kind, CacheKind::Data | CacheKind::Unified);
            if !instrumented {
                continue;
            }
            let ways = config
                .initial_active_ways
                .unwrap_or_else(|| cache.associativity());
            cache.set_active_ways(ways);
            leakage_geometry.get_or_insert((cache.set_count(), cache.line_size()));
            instruments[id] = Some(Instrument {
                keys: SchemeKeys::default(),
                since_flush: 0,
                since_breath: 0,
                growing: true,
                counters: DefenseCounters::default(),
            });
            info!(
                "Instrumenting {} with scheme {}, {} of {} ways active",
                cache.name,
                config.scheme,
                cache.active_ways(),
                cache.associativity()
            );
        }
        if config.instrumented_level > 0 && leakage_geometry.is_none() {
            warn!(
                "No data cache at level {}, leakage is not observed",
                config.instrumented_level
            );
        }
        let (set_count, line_size) = leakage_geometry.unwrap_or((0, config.l1d.line_size));

        debug!("Hierarchy of {} caches for {} cores", caches.len(), config.cores);
        Ok(Self {
            caches,
            l1i,
            l1d,
            pool: RefPool::new(config.pool_capacity),
            scheme: config.scheme,
            instrumented_level: config.instrumented_level,
            instruments,
            flush_threshold: config.flush_threshold,
            dynamic_threshold: config.dynamic_threshold,
            rng: StdRng::seed_from_u64(config.key_seed),
            leakage: Box::new(EntropyLeakage::new(set_count, line_size, config.scheme)),
            liveness: Box::new(NeverDead),
        })
    }

    pub fn with_leakage(mut self, leakage: Box<dyn LeakageModel>) -> Self {
        self.leakage = leakage;
        self
    }

    pub fn with_liveness(mut self, liveness: Box<dyn LivenessOracle>) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn caches(&self) -> &[Cache] {
        &self.caches
    }

    pub fn cache(&self, id: CacheId) -> &Cache {
        &self.caches[id]
    }

    pub fn cores(&self) -> usize {
        self.l1d.len()
    }

    pub fn l1i(&self, core: usize) -> Result<CacheId> {
        Ok(*self.l1i.get(core).ok_or(SimError::UnknownCore(core))?)
    }

    pub fn l1d(&self, core: usize) -> Result<CacheId> {
        Ok(*self.l1d.get(core).ok_or(SimError::UnknownCore(core))?)
    }

    pub fn scheme(&self) -> IndexScheme {
        self.scheme
    }

    pub fn instrumented_level(&self) -> u8 {
        self.instrumented_level
    }

    /// Ids of the caches indexed by the configured scheme.
    pub fn instrumented(&self) -> impl Iterator<Item = CacheId> + '_ {
        self.instruments
            .iter()
            .enumerate()
            .filter_map(|(id, instrument)| instrument.as_ref().map(|_| id))
    }

    pub fn keys(&self, id: CacheId) -> Option<&SchemeKeys> {
        self.instruments[id].as_ref().map(|i| &i.keys)
    }

    pub fn set_keys(&mut self, id: CacheId, keys: SchemeKeys) {
        if let Some(instrument) = self.instruments[id].as_mut() {
            instrument.keys = keys;
        }
    }

    pub fn defense_counters(&self, id: CacheId) -> Option<&DefenseCounters> {
        self.instruments[id].as_ref().map(|i| &i.counters)
    }

    pub fn pool(&self) -> &RefPool {
        &self.pool
    }

    /// Issue a trace reference at the L1 of its core and return its completion time.
    pub fn issue(&mut self, mr: &mut MemoryReference) -> Result<u64> {
        if mr.operation.is_bookkeeping() {
            return Ok(mr.time);
        }
        let id = if mr.operation.is_instruction() {
            self.l1i(mr.core)?
        } else {
            self.l1d(mr.core)?
        };
        self.reference(id, Some(mr), None)
    }

    /// Apply one access to cache `id` and return the time it completes.
    ///
    /// * reference only: a demand access, split at line boundaries first.
    /// * reference and line: fill `line` of the level above with the block
    ///   containing the reference.
    /// * line only: write `line` back into this level.
    pub fn reference(
        &mut self,
        id: CacheId,
        mr: Option<&mut MemoryReference>,
        line: Option<&mut CacheLine>,
    ) -> Result<u64> {
        match (mr, line) {
            (Some(mr), None) => self.demand(id, mr),
            (Some(mr), Some(line)) => self.access(id, Access::Fill(mr, line)),
            (None, Some(line)) => self.access(id, Access::WriteBack(line)),
            (None, None) => Err(SimError::MissingReferenceInputs.into()),
        }
    }

    fn demand(&mut self, id: CacheId, mr: &mut MemoryReference) -> Result<u64> {
        let tag_mask = self.caches[id].tag_mask();
        while mr.address & tag_mask != mr.last_address() & tag_mask {
            let mut head = ref_split(&mut self.pool, mr, tag_mask)?;
            self.caches[id].counters.splits += 1;
            let done = self.access(id, Access::Demand(&mut head));
            self.pool.release(head);
            mr.time = done?;
        }
        self.access(id, Access::Demand(mr))
    }

    fn access(&mut self, id: CacheId, mut acc: Access<'_>) -> Result<u64> {
        let address = acc.address();
        let operation = acc.operation();
        let segment = acc.segment();
        let mut ref_time = acc.time();

        let set_index = self.select_set(id, address)?;
        self.caches[id].sets[set_index].counters[segment.index()].access += 1;

        if operation.is_control() {
            if let Access::Demand(mr) = &mut acc {
                return Ok(self.control(id, set_index, mr));
            }
        }

        let cache = &mut self.caches[id];
        let tag = cache.tag_of(address);
        let is_memory = cache.is_memory();
        let access_cycles = cache.config.access_cycles;
        let bank_index = cache.bank_of(tag);
        let hit_way = cache.sets[set_index].search(tag);

        let bank = &mut cache.banks[bank_index];
        if bank.busy_until > ref_time {
            let stall = if cache.config.architecture == Architecture::Blocking
                || hit_way.is_none()
                || tag == bank.miss_tag
            {
                bank.miss_until.saturating_sub(ref_time)
            } else {
                bank.busy_until - ref_time
            };
            cache.counters.wait_time += stall;
            ref_time += stall;
        } else {
            cache.counters.idle_time += ref_time.saturating_sub(bank.last_busy);
        }
        let mut crnt = ref_time + access_cycles;
        bank.busy_until = crnt;
        bank.miss_until = crnt;
        bank.last_busy = crnt;
        acc.set_time(crnt);
        cache.counters.fetches[operation.index()] += 1;

        let way = match hit_way {
            Some(way) => {
                cache.sets[set_index].counters[segment.index()].hits += 1;
                trace!("{}: hit {:#x}", cache.name, address);
                way
            }
            None => {
                cache.sets[set_index].counters[segment.index()].misses += 1;
                cache.counters.misses[operation.index()] += 1;
                trace!("{}: miss {:#x}", cache.name, address);
                match &mut acc {
                    Access::Demand(mr)
                        if operation.is_write() && !cache.config.write_allocate && !is_memory =>
                    {
                        if let Some(lower) = cache.lower {
                            let done = self.reference(lower, Some(&mut **mr), None)?;
                            self.caches[id].banks[bank_index].last_busy = done;
                            return Ok(done);
                        }
                    }
                    Access::WriteBack(line) if !is_memory => {
                        debug!("{}: write-back of {:#x} missed", cache.name, line.address);
                    }
                    _ => {}
                }
                let (way, done) = self.allocate(id, set_index, bank_index, &mut acc, crnt)?;
                crnt = done;
                way
            }
        };

        let cache = &mut self.caches[id];
        let level = cache.level;
        let subblock_size = cache.subblock_size();
        match &mut acc {
            Access::Demand(mr) => update_cl(
                Some(&**mr),
                None,
                cache.sets[set_index].line_mut(way),
                level,
                subblock_size,
                self.liveness.as_ref(),
                &mut cache.classification,
            )?,
            Access::WriteBack(line) => update_cl(
                None,
                Some(&**line),
                cache.sets[set_index].line_mut(way),
                level,
                subblock_size,
                self.liveness.as_ref(),
                &mut cache.classification,
            )?,
            Access::Fill(_, upper) => copy_fill(cache.sets[set_index].line(way), upper),
        }
        cache.sets[set_index].move_to_mru(way);

        let write_through = operation.is_write()
            && !matches!(acc, Access::Fill(..))
            && cache.config.write_policy == WritePolicy::WriteThrough;
        if let (true, Some(lower)) = (write_through, cache.lower) {
            let mut line = cache.sets[set_index].take(way);
            line.operation = Operation::Write;
            line.time = crnt;
            let result = self.reference(lower, None, Some(&mut line));
            line.dirty = 0;
            for s in line.stat.iter_mut() {
                *s &= !stat::DIRTY;
            }
            self.caches[id].sets[set_index].restore(way, line);
            result?;
        }

        let bank = &mut self.caches[id].banks[bank_index];
        bank.busy_until = ref_time + access_cycles;
        bank.last_busy = crnt;
        acc.set_time(crnt);
        Ok(crnt)
    }

    /// Replace the LRU line of the set with the block of `acc`.
    fn allocate(
        &mut self,
        id: CacheId,
        set_index: usize,
        bank_index: usize,
        acc: &mut Access<'_>,
        mut crnt: u64,
    ) -> Result<(usize, u64)> {
        let cache = &mut self.caches[id];
        let lower = cache.lower;
        let line_size = cache.line_size();
        let subblock_size = cache.subblock_size();
        let tag = cache.tag_of(acc.address());
        let set = &mut cache.sets[set_index];
        let victim = set.lru();

        if set.line(victim).is_valid() {
            let evicted = set.line(victim).segment.index();
            set.counters[evicted].evictions += 1;
            if set.line(victim).is_dirty() {
                set.counters[evicted].write_backs += 1;
                if let Some(lower) = lower {
                    let mut line = set.take(victim);
                    line.operation = Operation::Write;
                    line.time = crnt;
                    trace!("{}: write back {:#x}", cache.name, line.address);
                    let done = self.reference(lower, None, Some(&mut line));
                    self.caches[id].sets[set_index].restore(victim, line);
                    crnt = done?;
                    self.caches[id].banks[bank_index].last_busy = crnt;
                }
            }
        }

        let set = &mut self.caches[id].sets[set_index];
        let line = set.line_mut(victim);
        line.reset(line_size);
        line.address = tag;
        line.alloc_time = crnt;
        line.time = crnt;
        line.operation = acc.operation();
        line.segment = acc.segment();
        set.move_to_mru(victim);

        match acc {
            Access::WriteBack(_) => {}
            Access::Demand(mr) | Access::Fill(mr, _) => match lower {
                Some(lower) => {
                    let mut line = set.take(victim);
                    mr.time = crnt;
                    let done = self.reference(lower, Some(&mut **mr), Some(&mut line));
                    line.valid = subblock_mask(&line.stat, subblock_size);
                    self.caches[id].sets[set_index].restore(victim, line);
                    crnt = done?;
                    self.caches[id].banks[bank_index].miss_tag = tag;
                }
                None => fill_from_reference(set.line_mut(victim), mr, subblock_size),
            },
        }

        let cache = &mut self.caches[id];
        cache.sets[set_index].counters[acc.segment().index()].fetches += 1;
        cache.banks[bank_index].miss_until = crnt;
        Ok((victim, crnt))
    }

    /// Clean or invalidate the line of `mr` in this cache only.
    fn control(&mut self, id: CacheId, set_index: usize, mr: &mut MemoryReference) -> u64 {
        let cache = &mut self.caches[id];
        let tag = cache.tag_of(mr.address);
        let line_size = cache.line_size();
        let done = mr.time + cache.config.control_cycles;
        let segment = mr.segment.index();
        let set = &mut cache.sets[set_index];
        match set.search(tag) {
            Some(way) => {
                if mr.operation == Operation::Clean {
                    set.line_mut(way).reset(line_size);
                    set.counters[segment].cleans += 1;
                } else {
                    set.line_mut(way).invalidate();
                    set.counters[segment].invalidations += 1;
                }
                set.move_to_lru(way);
            }
            None => warn!(
                "{}: {} of {:#x} missed",
                cache.name,
                mr.operation.name(),
                mr.address
            ),
        }
        let bank = cache.bank_of(tag);
        cache.banks[bank].last_busy = done;
        mr.time = done;
        done
    }

    fn select_set(&mut self, id: CacheId, address: u64) -> Result<usize> {
        if self.instruments[id].is_none() {
            return Ok(self.caches[id].naive_set(address));
        }
        self.run_defenses(id)?;
        let cache = &self.caches[id];
        let line_address = address >> cache.log2_line();
        let set_count = cache.set_count();
        let keys = self.instruments[id].as_ref().map(|i| &i.keys);
        let set = match keys {
            Some(keys) => compute_set(line_address, self.scheme, set_count, keys),
            None => cache.naive_set(address),
        };
        self.leakage.observe(set, line_address);
        Ok(set)
    }

    fn run_defenses(&mut self, id: CacheId) -> Result<()> {
        let (flush, breathe) = match self.instruments[id].as_mut() {
            Some(instrument) => {
                instrument.since_flush += 1;
                instrument.since_breath += 1;
                let flush = self.flush_threshold > 0 && instrument.since_flush >= self.flush_threshold;
                let breathe =
                    self.dynamic_threshold > 0 && instrument.since_breath >= self.dynamic_threshold;
                if flush {
                    instrument.since_flush = 0;
                }
                if breathe {
                    instrument.since_breath = 0;
                }
                (flush, breathe)
            }
            None => return Ok(()),
        };
        if flush {
            self.flush(id)?;
        }
        if breathe {
            self.breathe(id)?;
        }
        Ok(())
    }

    /// Write back and invalidate every active line of cache `id`, then rotate its keys.
    pub fn flush(&mut self, id: CacheId) -> Result<()> {
        for set_index in 0..self.caches[id].set_count() {
            let ways: Vec<usize> = self.caches[id].sets[set_index].ring().collect();
            for way in ways {
                self.flush_line(id, set_index, way)?;
            }
        }
        self.caches[id].counters.sweeps += 1;
        let keys = SchemeKeys::random(&mut self.rng);
        if let Some(instrument) = self.instruments[id].as_mut() {
            instrument.keys = keys;
            instrument.counters.flushes += 1;
            instrument.counters.key_rotations += 1;
        }
        debug!("{}: flushed, keys rotated", self.caches[id].name);
        Ok(())
    }

    /// Step the active associativity of cache `id` by two ways.
    ///
    /// Grows until all ways are active, then shrinks down to two, and so on.
    /// The ways given up on a shrink are written back and invalidated first.
    pub fn breathe(&mut self, id: CacheId) -> Result<usize> {
        let active = self.caches[id].active_ways();
        let associativity = self.caches[id].associativity();
        let Some(instrument) = self.instruments[id].as_mut() else {
            return Ok(active);
        };
        if associativity <= 2 {
            return Ok(active);
        }
        let growing = if active <= 2 {
            true
        } else if active >= associativity {
            false
        } else {
            instrument.growing
        };
        instrument.growing = growing;
        instrument.counters.breaths += 1;

        let cache = &mut self.caches[id];
        let target = if growing {
            let target = (active + 2).min(associativity);
            for set in cache.sets.iter_mut() {
                while set.active_ways() < target && set.restore_parked().is_some() {}
            }
            target
        } else {
            let target = active.saturating_sub(2).max(2);
            for set_index in 0..cache.set_count() {
                while self.caches[id].sets[set_index].active_ways() > target {
                    let way = self.caches[id].sets[set_index].lru();
                    self.flush_line(id, set_index, way)?;
                    self.caches[id].sets[set_index].shed_lru();
                }
            }
            self.caches[id].counters.sweeps += 1;
            target
        };
        self.caches[id].note_active_ways(target);
        debug!(
            "{}: {} ways active ({})",
            self.caches[id].name,
            target,
            if growing { "growing" } else { "shrinking" }
        );
        Ok(target)
    }

    fn flush_line(&mut self, id: CacheId, set_index: usize, way: usize) -> Result<()> {
        let cache = &mut self.caches[id];
        let lower = cache.lower;
        let set = &mut cache.sets[set_index];
        let line = set.line(way);
        let segment = line.segment.index();
        if line.is_valid() && line.is_dirty() {
            set.counters[segment].write_backs += 1;
            if let Some(lower) = lower {
                let mut line = set.take(way);
                line.operation = Operation::Write;
                let result = self.reference(lower, None, Some(&mut line));
                self.caches[id].sets[set_index].restore(way, line);
                result?;
            }
        }
        self.caches[id].sets[set_index].line_mut(way).invalidate();
        Ok(())
    }

    /// Compute the leakage figures. Call once after the last reference.
    pub fn finish(&mut self) -> LeakageReport {
        self.leakage.finalize()
    }
}

fn warn_unmodeled(cache: &Cache) {
    let config = &cache.config;
    if config.coherence != Coherence::None {
        warn!("{}: coherence {:?} is not modeled", cache.name, config.coherence);
    }
    if config.prefetch != Prefetch::Off {
        warn!("{}: prefetch {:?} is not modeled", cache.name, config.prefetch);
    }
    if config.replacement != Replacement::Lru {
        warn!(
            "{}: replacement {:?} is not modeled, using LRU",
            cache.name, config.replacement
        );
    }
}

/// Subblocks holding at least one valid byte.
fn subblock_mask(stat: &[u8], subblock_size: usize) -> u16 {
    stat.chunks(subblock_size.max(1))
        .enumerate()
        .filter(|(_, chunk)| chunk.iter().any(|s| s & stat::VALID != 0))
        .fold(0, |mask, (index, _)| mask | 1 << index)
}

/// Install the payload of `mr` into a line fetched from memory.
fn fill_from_reference(line: &mut CacheLine, mr: &MemoryReference, subblock_size: usize) {
    let offset = mr.address.saturating_sub(line.address) as usize;
    for (i, &byte) in mr.payload().iter().enumerate() {
        let Some(at) = offset.checked_add(i).filter(|&at| at < line.size()) else {
            break;
        };
        line.data[at] = byte;
        line.orig[at] = byte;
        line.stat[at] = stat::VALID;
    }
    if !mr.split && offset < line.size() && mr.size > 0 {
        line.stat[offset] |= stat::ELEMENT_START;
    }
    line.valid = subblock_mask(&line.stat, subblock_size);
}

/// Copy the block of the upper level `line` out of `hit`.
fn copy_fill(hit: &CacheLine, line: &mut CacheLine) {
    let offset = line.address.saturating_sub(hit.address) as usize;
    let len = line.size().min(hit.size().saturating_sub(offset));
    line.data[..len].copy_from_slice(&hit.data[offset..offset + len]);
    line.orig[..len].copy_from_slice(&hit.orig[offset..offset + len]);
    line.stat[..len].copy_from_slice(&hit.stat[offset..offset + len]);
    line.valid = hit.valid;
}

#[derive(Clone, Copy, Debug, Default)]
struct Tally {
    read: bool,
    writes: [u32; Outcome::COUNT],
}

impl Tally {
    const WRITE_OUTCOMES: [Outcome; 5] = [
        Outcome::Dead,
        Outcome::Live,
        Outcome::Dusty,
        Outcome::Useless,
        Outcome::Untouched,
    ];

    fn add(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Read => self.read = true,
            other => self.writes[other.index()] += 1,
        }
    }

    fn has(&self, outcome: Outcome) -> bool {
        self.writes[outcome.index()] > 0
    }

    /// Strongest outcome among the bytes.
    fn element(&self) -> Option<Outcome> {
        if self.read {
            return Some(Outcome::Read);
        }
        Self::WRITE_OUTCOMES.into_iter().find(|&o| self.has(o))
    }

    /// Outcome of a subblock or block.
    ///
    /// Wasted writes (dead, dusty, untouched) without any live or useless byte
    /// make the region mixed.
    fn region(&self) -> Option<Outcome> {
        if self.read {
            return Some(Outcome::Read);
        }
        if self.has(Outcome::Live) {
            Some(Outcome::Live)
        } else if self.has(Outcome::Useless) {
            Some(Outcome::Useless)
        } else if [Outcome::Dead, Outcome::Dusty, Outcome::Untouched]
            .into_iter()
            .any(|o| self.has(o))
        {
            Some(Outcome::Mixed)
        } else {
            None
        }
    }
}

/// Merge the bytes of exactly one source into `dst` and classify every write.
///
/// The source is either a demand reference or a line written back from the
/// level above. Written bytes are classified at byte, element, subblock and
/// block resolution:
///
/// * untouched: the source byte is invalid or `dst` never held it,
/// * dead: the value is never read again (levels below L1 only),
/// * dusty: the same value is written over an already touched byte,
/// * useless: the previous access to the byte was a write,
/// * live: anything else.
pub fn update_cl(
    mr: Option<&MemoryReference>,
    line: Option<&CacheLine>,
    dst: &mut CacheLine,
    level: u8,
    subblock_size: usize,
    liveness: &dyn LivenessOracle,
    classification: &mut Classification,
) -> Result<()> {
    let mut synthesized = [0u8; MAX_REFERENCE_SIZE];
    let (address, operation, segment, data, orig, src_stat) = match (mr, line) {
        (Some(mr), None) => {
            synthesized[..mr.size].fill(stat::VALID);
            if !mr.split && mr.size > 0 {
                synthesized[0] |= stat::ELEMENT_START;
            }
            (
                mr.address,
                mr.operation,
                mr.segment,
                mr.payload(),
                mr.payload(),
                &synthesized[..mr.size],
            )
        }
        (None, Some(line)) => (
            line.address,
            line.operation,
            line.segment,
            &line.data[..],
            &line.orig[..],
            &line.stat[..],
        ),
        _ => return Err(SimError::ConflictingUpdateSources.into()),
    };

    let offset = address.saturating_sub(dst.address) as usize;
    let len = src_stat.len().min(dst.size().saturating_sub(offset));
    let read = !operation.is_write();
    let subblock_size = subblock_size.max(1) as u64;

    let mut element: Option<Tally> = None;
    let mut subblock = Tally::default();
    let mut block = Tally::default();
    for i in 0..len {
        let d = offset + i;
        let s = src_stat[i];
        let src_valid = s & stat::VALID != 0;
        let dst_valid = dst.stat[d] & stat::VALID != 0;

        if s & stat::ELEMENT_START != 0 {
            element = Some(Tally::default());
            dst.stat[d] |= stat::ELEMENT_START;
        } else {
            dst.stat[d] &= !stat::ELEMENT_START;
        }

        let outcome = if read {
            dst.stat[d] = (dst.stat[d] & !stat::LAST_ACCESS) | stat::TOUCHED | stat::LAST_READ;
            Outcome::Read
        } else {
            let outcome = if !src_valid || !dst_valid {
                Outcome::Untouched
            } else if level != 1 && liveness.is_dead(address + i as u64, segment) {
                Outcome::Dead
            } else if dst.stat[d] & stat::TOUCHED != 0 && dst.data[d] == data[i] {
                Outcome::Dusty
            } else if dst.stat[d] & stat::LAST_WRITE != 0 {
                Outcome::Useless
            } else {
                Outcome::Live
            };
            dst.stat[d] = (dst.stat[d] & !stat::LAST_ACCESS) | stat::TOUCHED | stat::LAST_WRITE;
            outcome
        };

        if src_valid {
            if !dst_valid {
                dst.orig[d] = orig[i];
            }
            dst.data[d] = data[i];
            dst.stat[d] |= stat::VALID;
            if !read {
                dst.stat[d] |= stat::DIRTY;
            }
        }

        classification.count(segment, Resolution::Byte, outcome);
        if let Some(element) = element.as_mut() {
            element.add(outcome);
        }
        subblock.add(outcome);
        block.add(outcome);

        let last = i + 1 == len;
        if last || src_stat[i + 1] & stat::ELEMENT_START != 0 {
            if let Some(outcome) = element.take().and_then(|e| e.element()) {
                classification.count(segment, Resolution::Element, outcome);
            }
        }
        if last || (address + i as u64) % subblock_size == subblock_size - 1 {
            if let Some(outcome) = subblock.region() {
                classification.count(segment, Resolution::Subblock, outcome);
            }
            subblock = Tally::default();
        }
    }
    if let Some(outcome) = block.region() {
        classification.count(segment, Resolution::Block, outcome);
    }

    dst.valid |= subblock_mask(&dst.stat, subblock_size as usize);
    if read {
        dst.referenced |= 1;
    } else {
        let dirty = dst
            .stat
            .chunks(subblock_size as usize)
            .enumerate()
            .filter(|(_, chunk)| chunk.iter().any(|s| s & stat::DIRTY != 0))
            .fold(0, |mask, (index, _)| mask | 1 << index);
        dst.dirty |= dirty;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::SetCounters, config::CacheConfig};

    struct AlwaysDead;

    impl LivenessOracle for AlwaysDead {
        fn is_dead(&self, _address: u64, _segment: Segment) -> bool {
            true
        }
    }

    fn valid_line(address: u64) -> CacheLine {
        let mut line = CacheLine::default();
        line.reset(64);
        line.address = address;
        line.stat.fill(stat::VALID);
        line.valid = 1;
        line
    }

    fn write(address: u64, data: &[u8]) -> MemoryReference {
        MemoryReference::new(Operation::Write, address, data.len()).with_data(data)
    }

    fn classify(mr: &MemoryReference, dst: &mut CacheLine, counts: &mut Classification) {
        update_cl(Some(mr), None, dst, 1, 64, &NeverDead, counts).unwrap();
    }

    #[test]
    fn test_update_cl_needs_one_source() {
        let mut dst = valid_line(0x1000);
        let mut counts = Classification::default();
        let mr = write(0x1000, &[1]);
        let line = valid_line(0x1000);
        assert!(update_cl(None, None, &mut dst, 1, 64, &NeverDead, &mut counts).is_err());
        assert!(
            update_cl(Some(&mr), Some(&line), &mut dst, 1, 64, &NeverDead, &mut counts).is_err()
        );
    }

    #[test]
    fn test_write_outcomes() {
        let mut dst = valid_line(0x1000);
        let mut counts = Classification::default();

        classify(&write(0x1008, &[1, 2, 3, 4]), &mut dst, &mut counts);
        assert_eq!(counts.total(Resolution::Byte, Outcome::Live), 4);
        assert_eq!(counts.total(Resolution::Element, Outcome::Live), 1);
        assert_eq!(counts.total(Resolution::Block, Outcome::Live), 1);
        assert!(dst.is_dirty());
        assert_eq!(&dst.data[8..12], &[1, 2, 3, 4]);
        assert_eq!(&dst.orig[8..12], &[0, 0, 0, 0]);

        classify(&write(0x1008, &[1, 2, 3, 4]), &mut dst, &mut counts);
        assert_eq!(counts.total(Resolution::Byte, Outcome::Dusty), 4);
        assert_eq!(counts.total(Resolution::Element, Outcome::Dusty), 1);
        assert_eq!(counts.total(Resolution::Subblock, Outcome::Mixed), 1);
        assert_eq!(counts.total(Resolution::Block, Outcome::Mixed), 1);
        assert_eq!(counts.total(Resolution::Block, Outcome::Dusty), 0);

        classify(&write(0x1008, &[9, 9, 9, 9]), &mut dst, &mut counts);
        assert_eq!(counts.total(Resolution::Byte, Outcome::Useless), 4);

        let read = MemoryReference::new(Operation::Read, 0x1008, 4).with_data(&[9, 9, 9, 9]);
        classify(&read, &mut dst, &mut counts);
        assert_eq!(counts.total(Resolution::Byte, Outcome::Read), 4);
        assert_eq!(counts.total(Resolution::Block, Outcome::Read), 1);

        classify(&write(0x1008, &[5, 5, 5, 5]), &mut dst, &mut counts);
        assert_eq!(counts.total(Resolution::Byte, Outcome::Live), 8);
    }

    #[test]
    fn test_write_back_of_partial_line() {
        let mut upper = valid_line(0x1000);
        upper.stat.fill(0);
        upper.operation = Operation::Write;
        upper.stat[0] = stat::VALID | stat::ELEMENT_START | stat::TOUCHED | stat::LAST_WRITE;
        upper.data[0] = 7;

        let mut dst = valid_line(0x1000);
        let mut counts = Classification::default();
        update_cl(None, Some(&upper), &mut dst, 2, 16, &NeverDead, &mut counts).unwrap();
        assert_eq!(counts.total(Resolution::Byte, Outcome::Live), 1);
        assert_eq!(counts.total(Resolution::Byte, Outcome::Untouched), 63);
        assert_eq!(counts.total(Resolution::Element, Outcome::Live), 1);
        // a live byte wins its subblock, the three untouched subblocks are mixed
        assert_eq!(counts.total(Resolution::Subblock, Outcome::Live), 1);
        assert_eq!(counts.total(Resolution::Subblock, Outcome::Mixed), 3);
        assert_eq!(counts.total(Resolution::Subblock, Outcome::Untouched), 0);
        assert_eq!(counts.total(Resolution::Block, Outcome::Live), 1);
        assert_eq!(dst.data[0], 7);
        assert_eq!(dst.dirty, 1);

        let mut counts = Classification::default();
        update_cl(None, Some(&upper), &mut dst, 2, 16, &AlwaysDead, &mut counts).unwrap();
        assert_eq!(counts.total(Resolution::Byte, Outcome::Dead), 1);
        assert_eq!(counts.total(Resolution::Subblock, Outcome::Mixed), 4);
        assert_eq!(counts.total(Resolution::Block, Outcome::Mixed), 1);
    }

    fn l1_config(associativity: usize) -> SimConfig {
        SimConfig {
            instrumented_level: 1,
            initial_active_ways: Some(2),
            ..SimConfig::l1_only(CacheConfig::new(32768, 64, associativity, 1))
        }
    }

    fn set_totals(sim: &Simulation, id: CacheId, set: usize) -> SetCounters {
        sim.cache(id).sets[set].totals()
    }

    #[test]
    fn test_reference_without_inputs() {
        let mut sim = Simulation::new(&SimConfig::default()).unwrap();
        let l1 = sim.l1d(0).unwrap();
        assert!(sim.reference(l1, None, None).is_err());
    }

    #[test]
    fn test_miss_then_hit() {
        let mut sim = Simulation::new(&SimConfig::l1_only(CacheConfig::new(32768, 64, 8, 1))).unwrap();
        let l1 = sim.l1d(0).unwrap();
        let mut first = MemoryReference::new(Operation::Read, 0x1000, 8);
        let done = sim.issue(&mut first).unwrap();
        // L1 access plus the memory fetch
        assert_eq!(done, 1 + 150);
        let mut second = MemoryReference::new(Operation::Read, 0x1008, 8);
        second.time = done;
        assert_eq!(sim.issue(&mut second).unwrap(), done + 1);

        let totals = set_totals(&sim, l1, 0);
        assert_eq!(totals.misses, 1);
        assert_eq!(totals.hits, 1);
        assert_eq!(totals.fetches, 1);
    }

    #[test]
    fn test_line_crossing_reference_is_split() {
        let mut sim = Simulation::new(&SimConfig::l1_only(CacheConfig::new(32768, 64, 8, 1))).unwrap();
        let l1 = sim.l1d(0).unwrap();
        let mut mr = write(0x103c, &[1, 2, 3, 4, 5, 6, 7, 8]);
        sim.issue(&mut mr).unwrap();
        let cache = sim.cache(l1);
        assert_eq!(cache.counters.splits, 1);
        assert_eq!(cache.totals().misses, 2);
        let (set, way) = cache.find(0x1040).unwrap();
        assert_eq!(&cache.sets[set].line(way).data[..4], &[5, 6, 7, 8]);
        assert_eq!(sim.pool().outstanding(), 0);
    }

    #[test]
    fn test_reference_over_three_lines() {
        let config = SimConfig {
            memory: CacheConfig::new(1 << 20, 16, 16, 150),
            ..SimConfig::l1_only(CacheConfig::new(4096, 16, 4, 1))
        };
        let mut sim = Simulation::new(&config).unwrap();
        let l1 = sim.l1d(0).unwrap();
        let data: Vec<u8> = (1..=32).collect();
        sim.issue(&mut write(0x1008, &data)).unwrap();

        let cache = sim.cache(l1);
        assert_eq!(cache.counters.splits, 2);
        assert_eq!(cache.totals().misses, 3);
        for (address, bytes) in [(0x1000, 8..16), (0x1010, 0..16), (0x1020, 0..8)] {
            let (set, way) = cache.find(address).unwrap();
            let line = cache.sets[set].line(way);
            let start = (address + bytes.start as u64 - 0x1008) as usize;
            assert_eq!(line.data[bytes.clone()], data[start..start + bytes.len()]);
            assert!(line.is_dirty());
        }
        assert_eq!(cache.classification.total(Resolution::Byte, Outcome::Live), 32);
        // only the first piece starts an element
        assert_eq!(cache.classification.total(Resolution::Element, Outcome::Live), 1);
        assert_eq!(cache.classification.total(Resolution::Block, Outcome::Live), 3);
        assert_eq!(sim.pool().outstanding(), 0);
    }

    #[test]
    fn test_unknown_core_is_rejected() {
        let mut sim = Simulation::new(&SimConfig::default()).unwrap();
        assert!(sim.l1d(1).is_err());
        assert!(sim.l1i(1).is_err());
        let mut mr = MemoryReference::new(Operation::Read, 0x1000, 8).with_core(1);
        assert!(sim.issue(&mut mr).is_err());
        assert_eq!(sim.cache(sim.l1d(0).unwrap()).totals().access, 0);
    }

    #[test]
    fn test_control_operations_stay_local() {
        let mut sim = Simulation::new(&SimConfig::default()).unwrap();
        let l1 = sim.l1d(0).unwrap();
        sim.issue(&mut write(0x1000, &[1])).unwrap();
        let mut clean = MemoryReference::new(Operation::Clean, 0x1000, 1);
        sim.issue(&mut clean).unwrap();
        assert!(sim.cache(l1).find(0x1000).is_none());
        assert_eq!(sim.cache(l1).sets[0].totals().cleans, 1);
        // the L2 copy survives
        assert!(sim.caches().iter().any(|c| c.level == 2 && c.find(0x1000).is_some()));

        let mut invalidate = MemoryReference::new(Operation::Invalidate, 0x9000, 1);
        sim.issue(&mut invalidate).unwrap();
        assert_eq!(sim.cache(l1).totals().invalidations, 0);
    }

    #[test]
    fn test_dirty_victim_is_written_back() {
        let config = SimConfig::l1_only(CacheConfig::new(4096, 64, 1, 1));
        let mut sim = Simulation::new(&config).unwrap();
        let l1 = sim.l1d(0).unwrap();
        sim.issue(&mut write(0x0000, &[1])).unwrap();
        sim.issue(&mut MemoryReference::new(Operation::Read, 0x1000, 1)).unwrap();
        let totals = set_totals(&sim, l1, 0);
        assert_eq!(totals.evictions, 1);
        assert_eq!(totals.write_backs, 1);
        let memory = sim.cache(0);
        let (set, way) = memory.find(0x0000).unwrap();
        assert_eq!(memory.sets[set].line(way).data[0], 1);
    }

    #[test]
    fn test_breathing_sequence() {
        let mut sim = Simulation::new(&l1_config(8)).unwrap();
        let l1 = sim.l1d(0).unwrap();
        assert_eq!(sim.cache(l1).active_ways(), 2);

        let mut seen = Vec::new();
        for _ in 0..7 {
            for k in 1..=8u64 {
                sim.issue(&mut write(0x1000 * k, &[k as u8])).unwrap();
            }
            let before = set_totals(&sim, l1, 0).write_backs;
            let active = sim.cache(l1).active_ways();
            let now = sim.breathe(l1).unwrap();
            let written = set_totals(&sim, l1, 0).write_backs - before;
            if now < active {
                assert_eq!(written, 2);
            } else {
                assert_eq!(written, 0);
            }
            assert_eq!(sim.cache(l1).sets[0].ring().count(), now);
            seen.push(now);
        }
        assert_eq!(seen, vec![4, 6, 8, 6, 4, 2, 4]);
        assert_eq!(sim.defense_counters(l1).unwrap().breaths, 7);
    }

    #[test]
    fn test_flush_threshold_rotates_keys() {
        let config = SimConfig {
            scheme: IndexScheme::Ceaser,
            flush_threshold: 4,
            key_seed: 7,
            ..l1_config(8)
        };
        let mut sim = Simulation::new(&config).unwrap();
        let l1 = sim.l1d(0).unwrap();
        let initial = sim.keys(l1).cloned().unwrap();
        for k in 0..4u64 {
            sim.issue(&mut write(0x40 * k, &[1])).unwrap();
        }
        let counters = sim.defense_counters(l1).unwrap();
        assert_eq!(counters.flushes, 1);
        assert_eq!(counters.key_rotations, 1);
        assert_ne!(sim.keys(l1).unwrap(), &initial);
        // the three lines written before the flush went back to memory
        assert_eq!(sim.cache(l1).totals().write_backs, 3);
        assert_eq!(sim.cache(l1).counters.sweeps, 1);
    }

    #[test]
    fn test_private_level_below_shared_is_rejected() {
        let mut config = SimConfig::default();
        config.l3 = config.l3.map(|c| CacheConfig { shared: false, ..c });
        config.l2 = config.l2.map(CacheConfig::shared);
        assert!(Simulation::new(&config).is_err());
    }

    #[test]
    fn test_private_levels_per_core() {
        let config = SimConfig {
            cores: 2,
            ..SimConfig::default()
        };
        let sim = Simulation::new(&config).unwrap();
        let names: Vec<&str> = sim.caches().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["memory", "L3", "L2[0]", "L2[1]", "L1I[0]", "L1D[0]", "L1I[1]", "L1D[1]"]
        );
        assert_eq!(sim.cache(sim.l1d(1).unwrap()).lower, Some(3));
        assert_eq!(sim.cache(3).lower, Some(1));
    }
}
