// SPDX-FileCopyrightText: 2023 Stefan Hackenberg <mail@stefan-hackenberg.de>
//
// SPDX-License-Identifier: MIT

//! Cache data model.
//!
//! A [`Cache`] owns its [`CacheSet`]s and every set owns its [`CacheLine`]s.
//! Recency is a closed doubly linked ring of way indices inside the set: the
//! `lru` link of a line points one step towards the LRU end, the `mru` link one
//! step towards the MRU end, and the LRU line links back to the MRU line.
//! The ring holds exactly the set's active ways; ways shed by associativity
//! breathing are parked outside the ring until the set grows again.

use std::mem;

use anyhow::Result;

use crate::{
    config::{Architecture, CacheConfig},
    error::SimError,
    memref::{Operation, Segment},
};

/// Per byte status flags.
pub mod stat {
    pub const VALID: u8 = 0x01;
    pub const DIRTY: u8 = 0x02;
    pub const TOUCHED: u8 = 0x04;
    pub const LAST_READ: u8 = 0x08;
    pub const LAST_WRITE: u8 = 0x10;
    pub const ELEMENT_START: u8 = 0x40;

    pub const LAST_ACCESS: u8 = LAST_READ | LAST_WRITE;
}

/// Most subblocks a line can track in its bit-vectors.
pub const MAX_SUBBLOCKS: usize = 16;

pub type CacheId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    Read,
    Untouched,
    Live,
    Useless,
    Dusty,
    Dead,
    Mixed,
}

impl Outcome {
    pub const COUNT: usize = 7;

    pub const ALL: [Outcome; Outcome::COUNT] = [
        Outcome::Read,
        Outcome::Untouched,
        Outcome::Live,
        Outcome::Useless,
        Outcome::Dusty,
        Outcome::Dead,
        Outcome::Mixed,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Outcome::Read => "read",
            Outcome::Untouched => "untouched",
            Outcome::Live => "live",
            Outcome::Useless => "useless",
            Outcome::Dusty => "dusty",
            Outcome::Dead => "dead",
            Outcome::Mixed => "mixed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Resolution {
    Byte,
    Element,
    Subblock,
    Block,
}

impl Resolution {
    pub const COUNT: usize = 4;

    pub const ALL: [Resolution; Resolution::COUNT] = [
        Resolution::Byte,
        Resolution::Element,
        Resolution::Subblock,
        Resolution::Block,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Resolution::Byte => "byte",
            Resolution::Element => "element",
            Resolution::Subblock => "subblock",
            Resolution::Block => "block",
        }
    }
}

/// Classification counters indexed by segment, resolution and outcome.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Classification([[[u64; Outcome::COUNT]; Resolution::COUNT]; Segment::COUNT]);

impl Classification {
    pub fn count(&mut self, segment: Segment, resolution: Resolution, outcome: Outcome) {
        self.0[segment.index()][resolution.index()][outcome.index()] += 1;
    }

    pub fn get(&self, segment: Segment, resolution: Resolution, outcome: Outcome) -> u64 {
        self.0[segment.index()][resolution.index()][outcome.index()]
    }

    /// Sum over all segments.
    pub fn total(&self, resolution: Resolution, outcome: Outcome) -> u64 {
        Segment::ALL
            .iter()
            .map(|&segment| self.get(segment, resolution, outcome))
            .sum()
    }
}

#[derive(Clone, Debug, Default)]
pub struct CacheLine {
    /// Line aligned address of the cached block.
    pub address: u64,
    pub alloc_time: u64,
    pub time: u64,
    pub valid: u16,
    pub referenced: u16,
    pub dirty: u16,
    pub shared: u16,
    pub exclusive: u16,
    pub operation: Operation,
    pub segment: Segment,
    pub data: Vec<u8>,
    /// First observed value of every byte.
    pub orig: Vec<u8>,
    pub stat: Vec<u8>,
    lru: usize,
    mru: usize,
}

impl CacheLine {
    pub fn is_valid(&self) -> bool {
        self.valid != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty != 0
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Clear contents and flags and size the byte arrays to `line_size`.
    pub fn reset(&mut self, line_size: usize) {
        self.address = 0;
        self.alloc_time = 0;
        self.valid = 0;
        self.referenced = 0;
        self.dirty = 0;
        self.shared = 0;
        self.exclusive = 0;
        self.operation = Operation::default();
        self.segment = Segment::default();
        for bytes in [&mut self.data, &mut self.orig, &mut self.stat] {
            bytes.clear();
            bytes.resize(line_size, 0);
        }
    }

    /// Drop residency, keeping the tag for diagnostics.
    pub fn invalidate(&mut self) {
        self.valid = 0;
        self.dirty = 0;
        for s in self.stat.iter_mut() {
            *s &= !(stat::VALID | stat::DIRTY);
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetCounters {
    pub access: u64,
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub write_backs: u64,
    pub evictions: u64,
    pub cleans: u64,
    pub invalidations: u64,
}

impl SetCounters {
    pub fn accumulate(&mut self, other: &SetCounters) {
        self.access += other.access;
        self.hits += other.hits;
        self.misses += other.misses;
        self.fetches += other.fetches;
        self.write_backs += other.write_backs;
        self.evictions += other.evictions;
        self.cleans += other.cleans;
        self.invalidations += other.invalidations;
    }
}

#[derive(Clone, Debug)]
pub struct CacheSet {
    lines: Vec<CacheLine>,
    mru: usize,
    lru: usize,
    active: usize,
    parked: Vec<usize>,
    pub counters: [SetCounters; Segment::COUNT],
}

impl CacheSet {
    pub fn new(ways: usize) -> Self {
        assert!(ways > 0);
        let mut lines = vec![CacheLine::default(); ways];
        for (way, line) in lines.iter_mut().enumerate() {
            line.lru = (way + 1) % ways;
            line.mru = (way + ways - 1) % ways;
        }
        Self {
            lines,
            mru: 0,
            lru: ways - 1,
            active: ways,
            parked: Vec::new(),
            counters: Default::default(),
        }
    }

    pub fn ways(&self) -> usize {
        self.lines.len()
    }

    pub fn active_ways(&self) -> usize {
        self.active
    }

    pub fn mru(&self) -> usize {
        self.mru
    }

    pub fn lru(&self) -> usize {
        self.lru
    }

    /// Neighbour one step towards the LRU end.
    pub fn towards_lru(&self, way: usize) -> usize {
        self.lines[way].lru
    }

    /// Neighbour one step towards the MRU end.
    pub fn towards_mru(&self, way: usize) -> usize {
        self.lines[way].mru
    }

    pub fn line(&self, way: usize) -> &CacheLine {
        &self.lines[way]
    }

    pub fn line_mut(&mut self, way: usize) -> &mut CacheLine {
        &mut self.lines[way]
    }

    /// Ways of the ring from MRU to LRU.
    pub fn ring(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(Some(self.mru), move |&way| Some(self.lines[way].lru))
            .take(self.active)
    }

    /// Way holding a valid copy of `tag`.
    pub fn search(&self, tag: u64) -> Option<usize> {
        self.ring().find(|&way| {
            let line = &self.lines[way];
            line.is_valid() && line.address == tag
        })
    }

    /// Move the line out of the set, leaving an empty line behind.
    ///
    /// Must be paired with [`CacheSet::restore`] before the ring is touched.
    pub fn take(&mut self, way: usize) -> CacheLine {
        mem::take(&mut self.lines[way])
    }

    pub fn restore(&mut self, way: usize, line: CacheLine) {
        self.lines[way] = line;
    }

    fn unlink(&mut self, way: usize) {
        let (towards_mru, towards_lru) = (self.lines[way].mru, self.lines[way].lru);
        self.lines[towards_mru].lru = towards_lru;
        self.lines[towards_lru].mru = towards_mru;
        self.lines[way].lru = way;
        self.lines[way].mru = way;
    }

    /// Link `way` into the gap between the LRU and the MRU line.
    fn link_at_wrap(&mut self, way: usize) {
        let (lru, mru) = (self.lru, self.mru);
        self.lines[way].mru = lru;
        self.lines[way].lru = mru;
        self.lines[lru].lru = way;
        self.lines[mru].mru = way;
    }

    pub fn move_to_mru(&mut self, way: usize) {
        if way == self.mru {
            return;
        }
        if way == self.lru {
            self.lru = self.lines[way].mru;
        } else {
            self.unlink(way);
            self.link_at_wrap(way);
        }
        self.mru = way;
    }

    pub fn move_to_lru(&mut self, way: usize) {
        if way == self.lru {
            return;
        }
        if way == self.mru {
            self.mru = self.lines[way].lru;
        } else {
            self.unlink(way);
            self.link_at_wrap(way);
        }
        self.lru = way;
    }

    /// Take the LRU way out of the ring. The caller flushes it first.
    pub fn shed_lru(&mut self) -> usize {
        assert!(self.active > 1);
        let way = self.lru;
        let new_lru = self.lines[way].mru;
        self.unlink(way);
        self.lru = new_lru;
        self.active -= 1;
        self.parked.push(way);
        way
    }

    /// Return a parked way to the ring at its LRU end.
    pub fn restore_parked(&mut self) -> Option<usize> {
        let way = self.parked.pop()?;
        self.link_at_wrap(way);
        self.lru = way;
        self.active += 1;
        Some(way)
    }

    pub fn totals(&self) -> SetCounters {
        let mut total = SetCounters::default();
        for counters in &self.counters {
            total.accumulate(counters);
        }
        total
    }
}

/// Timing state of one bank.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Bank {
    pub busy_until: u64,
    pub miss_until: u64,
    pub miss_tag: u64,
    pub last_busy: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheCounters {
    pub fetches: [u64; Operation::COUNT],
    pub misses: [u64; Operation::COUNT],
    pub splits: u64,
    pub wait_time: u64,
    pub idle_time: u64,
    pub sweeps: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheKind {
    Instruction,
    Data,
    Unified,
    Memory,
}

#[derive(Clone, Debug)]
pub struct Cache {
    pub name: String,
    pub level: u8,
    pub kind: CacheKind,
    pub config: CacheConfig,
    /// Next level towards memory, `None` for the memory pseudo-cache.
    pub lower: Option<CacheId>,
    pub sets: Vec<CacheSet>,
    pub banks: Vec<Bank>,
    pub counters: CacheCounters,
    pub classification: Classification,
    associativity: usize,
    active_ways: usize,
    log2_line: u32,
    set_mask: u64,
    tag_mask: u64,
}

fn geometry_error(name: &str, reason: String) -> anyhow::Error {
    SimError::InvalidGeometry(format!("{name}: {reason}")).into()
}

impl Cache {
    pub fn new(
        name: impl Into<String>,
        level: u8,
        kind: CacheKind,
        config: CacheConfig,
        lower: Option<CacheId>,
    ) -> Result<Self> {
        let name = name.into();
        for (field, value) in [
            ("size", config.size),
            ("line size", config.line_size),
            ("subblock size", config.subblock_size),
        ] {
            if !value.is_power_of_two() {
                return Err(geometry_error(&name, format!("{field} {value} is not a power of two")));
            }
        }
        if config.associativity != 0 && !config.associativity.is_power_of_two() {
            return Err(geometry_error(
                &name,
                format!("associativity {} is not a power of two", config.associativity),
            ));
        }
        if config.subblock_size > config.line_size
            || config.line_size / config.subblock_size > MAX_SUBBLOCKS
        {
            return Err(geometry_error(
                &name,
                format!(
                    "subblock size {} does not fit line size {}",
                    config.subblock_size, config.line_size
                ),
            ));
        }
        let lines = config.size / config.line_size;
        let associativity = match config.associativity {
            0 => lines,
            ways => ways,
        };
        let set_count = lines / associativity.max(1);
        if set_count == 0 || set_count * associativity * config.line_size != config.size {
            return Err(geometry_error(
                &name,
                format!(
                    "{set_count} sets x {associativity} ways x {} bytes != {} bytes",
                    config.line_size, config.size
                ),
            ));
        }

        let log2_line = config.line_size.trailing_zeros();
        let banks = match config.architecture {
            Architecture::Distributed => config.banks.max(1),
            _ => 1,
        };
        Ok(Self {
            name,
            level,
            kind,
            lower,
            sets: (0..set_count).map(|_| CacheSet::new(associativity)).collect(),
            banks: vec![Bank::default(); banks],
            counters: CacheCounters::default(),
            classification: Classification::default(),
            associativity,
            active_ways: associativity,
            log2_line,
            set_mask: ((set_count - 1) as u64) << log2_line,
            tag_mask: !0u64 << log2_line,
            config,
        })
    }

    pub fn is_memory(&self) -> bool {
        self.lower.is_none()
    }

    pub fn line_size(&self) -> usize {
        self.config.line_size
    }

    pub fn subblock_size(&self) -> usize {
        self.config.subblock_size
    }

    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    pub fn associativity(&self) -> usize {
        self.associativity
    }

    pub fn active_ways(&self) -> usize {
        self.active_ways
    }

    pub fn log2_line(&self) -> u32 {
        self.log2_line
    }

    pub fn tag_mask(&self) -> u64 {
        self.tag_mask
    }

    pub fn tag_of(&self, address: u64) -> u64 {
        address & self.tag_mask
    }

    /// Set index taken from the address bits above the line offset.
    pub fn naive_set(&self, address: u64) -> usize {
        ((address & self.set_mask) >> self.log2_line) as usize
    }

    pub fn bank_of(&self, tag: u64) -> usize {
        if self.banks.len() > 1 {
            (tag >> self.log2_line) as usize % self.banks.len()
        } else {
            0
        }
    }

    /// Resize every ring without flushing. Used before the first reference.
    pub fn set_active_ways(&mut self, ways: usize) {
        let ways = ways.clamp(1, self.associativity);
        for set in self.sets.iter_mut() {
            while set.active_ways() > ways {
                set.shed_lru();
            }
            while set.active_ways() < ways && set.restore_parked().is_some() {}
        }
        self.active_ways = ways;
    }

    pub(crate) fn note_active_ways(&mut self, ways: usize) {
        self.active_ways = ways;
    }

    pub fn find(&self, address: u64) -> Option<(usize, usize)> {
        let tag = self.tag_of(address);
        self.sets
            .iter()
            .enumerate()
            .find_map(|(index, set)| set.search(tag).map(|way| (index, way)))
    }

    pub fn totals(&self) -> SetCounters {
        let mut total = SetCounters::default();
        for set in &self.sets {
            total.accumulate(&set.totals());
        }
        total
    }
}
