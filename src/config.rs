// SPDX-FileCopyrightText: 2023 Stefan Hackenberg <mail@stefan-hackenberg.de>
//
// SPDX-License-Identifier: MIT

//! Hierarchy configuration.
//!
//! A [`SimConfig`] is read from a JSON file. Every field has a default, so a
//! file only needs to name what differs from the built-in hierarchy.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{error::SimError, scheme::IndexScheme};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Architecture {
    /// Every access waits for an outstanding miss.
    #[default]
    Blocking,
    /// Hits proceed while a fill or write-back is in flight.
    HitUnderMiss,
    /// Independent banks, each with its own timing state.
    Distributed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WritePolicy {
    #[default]
    WriteBack,
    WriteThrough,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Coherence {
    #[default]
    None,
    Msi,
    Mesi,
    Moesi,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Prefetch {
    #[default]
    Off,
    NextLine,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Replacement {
    #[default]
    Lru,
    Random,
}

/// Parameters of one cache level.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub size: usize,
    pub line_size: usize,
    pub subblock_size: usize,
    /// 0 means fully associative.
    pub associativity: usize,
    pub access_cycles: u64,
    pub control_cycles: u64,
    pub architecture: Architecture,
    /// Bank count of a distributed cache.
    pub banks: usize,
    pub coherence: Coherence,
    pub prefetch: Prefetch,
    pub replacement: Replacement,
    pub write_policy: WritePolicy,
    pub write_allocate: bool,
    pub shared: bool,
}

impl CacheConfig {
    pub fn new(size: usize, line_size: usize, associativity: usize, access_cycles: u64) -> Self {
        Self {
            size,
            line_size,
            subblock_size: line_size,
            associativity,
            access_cycles,
            ..Default::default()
        }
    }

    pub fn with_control_cycles(mut self, control_cycles: u64) -> Self {
        self.control_cycles = control_cycles;
        self
    }

    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    pub fn with_write_policy(mut self, write_policy: WritePolicy) -> Self {
        self.write_policy = write_policy;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: 32768,
            line_size: 64,
            subblock_size: 64,
            associativity: 8,
            access_cycles: 1,
            control_cycles: 1,
            architecture: Architecture::Blocking,
            banks: 1,
            coherence: Coherence::None,
            prefetch: Prefetch::Off,
            replacement: Replacement::Lru,
            write_policy: WritePolicy::WriteBack,
            write_allocate: true,
            shared: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub cores: usize,
    pub l1i: CacheConfig,
    pub l1d: CacheConfig,
    pub l2: Option<CacheConfig>,
    pub l3: Option<CacheConfig>,
    pub l4: Option<CacheConfig>,
    pub l5: Option<CacheConfig>,
    pub memory: CacheConfig,
    pub scheme: IndexScheme,
    /// Level whose data caches use `scheme` and feed the leakage analyzer. 0 disables.
    pub instrumented_level: u8,
    /// Instrumented references between two full flushes. 0 disables.
    pub flush_threshold: u64,
    /// Instrumented references between two associativity steps. 0 disables.
    pub dynamic_threshold: u64,
    /// Active ways of the instrumented caches at start-up.
    pub initial_active_ways: Option<usize>,
    pub key_seed: u64,
    /// Issue references round-robin instead of by core clock.
    pub strict_order: bool,
    pub pool_capacity: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            cores: 1,
            l1i: CacheConfig::new(32768, 64, 8, 1),
            l1d: CacheConfig::new(32768, 64, 8, 0).with_control_cycles(1),
            l2: Some(CacheConfig::new(262144, 64, 8, 5).with_control_cycles(4)),
            l3: Some(
                CacheConfig::new(8388608, 64, 16, 15)
                    .with_control_cycles(6)
                    .shared(),
            ),
            l4: None,
            l5: None,
            memory: CacheConfig::new(8388608, 64, 16, 150)
                .with_control_cycles(30)
                .shared(),
            scheme: IndexScheme::Modulo,
            instrumented_level: 0,
            flush_threshold: 0,
            dynamic_threshold: 0,
            initial_active_ways: None,
            key_seed: 0,
            strict_order: false,
            pool_capacity: 4096,
        }
    }
}

impl SimConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Could not read config {}", path.display()))?;
        let config = serde_json::from_str(&text).map_err(SimError::from)?;
        Ok(config)
    }

    /// Four core Ivy Bridge like hierarchy.
    pub fn ivybridge() -> Self {
        Self {
            cores: 4,
            l1i: CacheConfig::new(32768, 64, 8, 1).with_control_cycles(1),
            l1d: CacheConfig::new(32768, 64, 8, 0).with_control_cycles(1),
            l2: Some(CacheConfig::new(262144, 64, 8, 12).with_control_cycles(4)),
            l3: Some(
                CacheConfig::new(8388608, 64, 16, 26)
                    .with_control_cycles(6)
                    .shared(),
            ),
            ..Default::default()
        }
    }

    /// A single core with only an L1 pair in front of memory.
    pub fn l1_only(l1d: CacheConfig) -> Self {
        Self {
            l1d,
            l2: None,
            l3: None,
            ..Default::default()
        }
    }

    /// Configured levels below L1 in memory-ward order, with their level number.
    pub fn lower_levels(&self) -> impl Iterator<Item = (u8, &CacheConfig)> {
        [&self.l2, &self.l3, &self.l4, &self.l5]
            .into_iter()
            .zip(2u8..)
            .filter_map(|(config, level)| config.as_ref().map(|c| (level, c)))
    }
}
