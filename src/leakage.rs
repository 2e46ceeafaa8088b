// SPDX-FileCopyrightText: 2023 Stefan Hackenberg <mail@stefan-hackenberg.de>
//
// SPDX-License-Identifier: MIT

//! Leakage of address bits through the observed set index.
//!
//! For every set the analyzer counts how often each tracked address bit is one
//! and how often every pair of bits disagrees. A bit whose value is fully
//! determined by landing in a given set leaks one bit of information; a bit
//! that is one half of the time leaks nothing.

use std::io::{self, Write};

use itertools::Itertools;
use log::{debug, info};
use serde::Serialize;

use crate::scheme::IndexScheme;

/// Low order line-address bits tracked per set.
pub const TRACKED_BITS: usize = 42;

/// Generic set-index leakage model
pub trait LeakageModel {
    /// Record one access of the instrumented cache that landed in `set`.
    fn observe(&mut self, set: usize, address: u64);

    /// Derive the per set figures after the last reference.
    fn finalize(&mut self) -> LeakageReport;
}

pub trait Entropy {
    /// Binary entropy `H(p)` in bits.
    fn entropy(self) -> f64;

    /// `1 - H(p)`, exactly 1 for a constant bit.
    fn leakage(self) -> f64;
}

impl Entropy for f64 {
    fn entropy(self) -> f64 {
        if self <= 0.0 || self >= 1.0 {
            0.0
        } else {
            -self * self.log2() - (1.0 - self) * (1.0 - self).log2()
        }
    }

    fn leakage(self) -> f64 {
        if self <= 0.0 || self >= 1.0 {
            1.0
        } else {
            (1.0 - self.entropy()).clamp(0.0, 1.0)
        }
    }
}

/// Position of the pair `(low, high)` with `low < high` in the packed triangle.
#[inline]
fn pair_index(low: usize, high: usize) -> usize {
    high * (high - 1) / 2 + low
}

#[derive(Clone, Debug, Default)]
struct SetTally {
    samples: u64,
    ones: Vec<u64>,
    disagree: Vec<u64>,
}

impl SetTally {
    fn correlation(&self, a: usize, b: usize) -> f64 {
        if self.samples == 0 || a == b {
            return 0.0;
        }
        let disagree = self.disagree[pair_index(a.min(b), a.max(b))];
        let agree = self.samples - disagree;
        let (low, high) = if agree < disagree {
            (agree, disagree)
        } else {
            (disagree, agree)
        };
        if high == 0 {
            0.0
        } else {
            1.0 - low as f64 / high as f64
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SetLeakage {
    pub set: usize,
    pub samples: u64,
    pub entropy: f64,
    pub leakage: f64,
    pub index_leakage: f64,
    pub tag_leakage: f64,
    pub correlation_leakage: f64,
    pub probability: Vec<f64>,
    pub bit_correlation_leakage: Vec<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LeakageReport {
    pub scheme: IndexScheme,
    pub scheme_name: String,
    pub line_size: usize,
    pub set_bits: u32,
    pub tracked_bits: usize,
    pub observed: u64,
    /// Bytes spanned by the observed line addresses.
    pub footprint: u64,
    pub sets: Vec<SetLeakage>,
}

impl LeakageReport {
    pub fn sets_used(&self) -> usize {
        self.sets.iter().filter(|s| s.samples > 0).count()
    }

    pub fn utilization(&self) -> f64 {
        if self.sets.is_empty() {
            0.0
        } else {
            self.sets_used() as f64 / self.sets.len() as f64
        }
    }

    fn weighted(&self, value: impl Fn(&SetLeakage) -> f64) -> f64 {
        if self.observed == 0 {
            return 0.0;
        }
        self.sets
            .iter()
            .map(|s| s.samples as f64 * value(s))
            .sum::<f64>()
            / self.observed as f64
    }

    /// Sample weighted average of the per set leakage.
    pub fn weighted_leakage(&self) -> f64 {
        self.weighted(|s| s.leakage)
    }

    pub fn weighted_correlation_leakage(&self) -> f64 {
        self.weighted(|s| s.correlation_leakage)
    }

    pub fn weighted_entropy(&self) -> f64 {
        self.weighted(|s| s.entropy)
    }

    pub fn weighted_index_leakage(&self) -> f64 {
        self.weighted(|s| s.index_leakage)
    }

    pub fn weighted_tag_leakage(&self) -> f64 {
        self.weighted(|s| s.tag_leakage)
    }

    pub fn write_summary<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(w, "Number of addresses read:, {}", self.observed)?;
        writeln!(w, "Memory footprint (bytes):, {}", self.footprint)?;
        writeln!(w, "Scheme:, {}, {}", self.scheme.id(), self.scheme_name)?;
        writeln!(
            w,
            "Set, Elements, Entropy, Info leakage, Set Info Leakage, Tag Info Leakage, \
             Avg heavy info leak, Correlation Info leakage, Avg heavy corr info leak"
        )?;
        let total = self.observed.max(1) as f64;
        for s in &self.sets {
            writeln!(
                w,
                "{}, {}, {:.6}, {:.6}, {:.6}, {:.6}, {:.6}, {:.6}, {:.6}",
                s.set,
                s.samples,
                s.entropy,
                s.leakage,
                s.index_leakage,
                s.tag_leakage,
                s.samples as f64 * s.leakage / total,
                s.correlation_leakage,
                s.samples as f64 * s.correlation_leakage / total,
            )?;
        }
        writeln!(
            w,
            "Total addresses:, {}, Average entropy:, {:.6}, Average info leakage:, {:.6}, \
             Set index leakage:, {:.6}, Tag info leakage:, {:.6}, Correlation leakage:, {:.6}",
            self.observed,
            self.weighted_entropy(),
            self.weighted_leakage(),
            self.weighted_index_leakage(),
            self.weighted_tag_leakage(),
            self.weighted_correlation_leakage()
        )?;
        writeln!(
            w,
            "Set lines used:, {} , Utilization:, {:.6}",
            self.sets_used(),
            self.utilization()
        )
    }

    /// One row per set and tracked bit.
    pub fn write_detail<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(w, "s,bit_pos,probability,correlation_leakage")?;
        for s in &self.sets {
            for (bit, (p, c)) in s
                .probability
                .iter()
                .zip(&s.bit_correlation_leakage)
                .enumerate()
            {
                writeln!(w, "{},{},{:.6},{:.6}", s.set, bit, p, c)?;
            }
        }
        Ok(())
    }
}

/// Entropy based leakage of the set index.
pub struct EntropyLeakage {
    scheme: IndexScheme,
    line_size: usize,
    bits: usize,
    set_bits: u32,
    sets: Vec<SetTally>,
    observed: u64,
    lowest: u64,
    highest: u64,
}

impl EntropyLeakage {
    pub fn new(set_count: usize, line_size: usize, scheme: IndexScheme) -> Self {
        Self::with_bits(set_count, line_size, scheme, TRACKED_BITS)
    }

    pub fn with_bits(set_count: usize, line_size: usize, scheme: IndexScheme, bits: usize) -> Self {
        assert!(bits > 0 && bits <= 64);
        Self {
            scheme,
            line_size,
            bits,
            set_bits: set_count.max(1).trailing_zeros(),
            sets: vec![SetTally::default(); set_count],
            observed: 0,
            lowest: u64::MAX,
            highest: 0,
        }
    }

    fn finalize_set(&self, set: usize, tally: &SetTally) -> SetLeakage {
        let probability: Vec<f64> = if tally.samples == 0 {
            vec![0.0; self.bits]
        } else {
            tally
                .ones
                .iter()
                .map(|&ones| ones as f64 / tally.samples as f64)
                .collect()
        };
        let marginal: Vec<f64> = probability.iter().map(|p| p.leakage()).collect();
        let index_bits = (self.set_bits as usize).min(self.bits);

        let mut bit_correlation_leakage: Vec<f64> = Vec::with_capacity(self.bits);
        for bit in 0..self.bits {
            let bound = bit_correlation_leakage
                .iter()
                .enumerate()
                .map(|(earlier, leak)| tally.correlation(bit, earlier) * leak)
                .fold(0.0, f64::max);
            bit_correlation_leakage.push(bound.max(marginal[bit]));
        }

        SetLeakage {
            set,
            samples: tally.samples,
            entropy: probability.iter().map(|p| p.entropy()).sum(),
            leakage: marginal.iter().sum(),
            index_leakage: marginal[..index_bits].iter().sum(),
            tag_leakage: marginal[index_bits..].iter().sum(),
            correlation_leakage: bit_correlation_leakage.iter().sum(),
            probability,
            bit_correlation_leakage,
        }
    }
}

impl LeakageModel for EntropyLeakage {
    fn observe(&mut self, set: usize, address: u64) {
        let bits = self.bits;
        let Some(tally) = self.sets.get_mut(set) else {
            debug!("Set {set} outside of leakage table");
            return;
        };
        if tally.ones.is_empty() {
            tally.ones = vec![0; bits];
            tally.disagree = vec![0; bits * (bits - 1) / 2];
        }
        for (bit, ones) in tally.ones.iter_mut().enumerate() {
            *ones += (address >> bit) & 1;
        }
        for (low, high) in (0..bits).tuple_combinations() {
            if ((address >> low) ^ (address >> high)) & 1 == 1 {
                tally.disagree[pair_index(low, high)] += 1;
            }
        }
        tally.samples += 1;

        self.observed += 1;
        self.lowest = self.lowest.min(address);
        self.highest = self.highest.max(address);
    }

    fn finalize(&mut self) -> LeakageReport {
        let sets: Vec<SetLeakage> = self
            .sets
            .iter()
            .enumerate()
            .map(|(set, tally)| self.finalize_set(set, tally))
            .collect();
        let footprint = if self.observed == 0 {
            0
        } else {
            let lines = (self.highest - self.lowest) as u128 + 1;
            u64::try_from(lines * self.line_size as u128).unwrap_or(u64::MAX)
        };
        info!(
            "Leakage of {}: {} samples over {} sets",
            self.scheme,
            self.observed,
            sets.iter().filter(|s| s.samples > 0).count()
        );
        LeakageReport {
            scheme: self.scheme,
            scheme_name: self.scheme.name().to_string(),
            line_size: self.line_size,
            set_bits: self.set_bits,
            tracked_bits: self.bits,
            observed: self.observed,
            footprint,
            sets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0.0, 1.0)]
    #[case(1.0, 1.0)]
    #[case(0.5, 0.0)]
    fn test_leakage_fixed_points(#[case] p: f64, #[case] expected: f64) {
        assert_eq!(p.leakage(), expected);
    }

    #[test]
    fn test_leakage_bounds() {
        for i in 0..=1000 {
            let leak = (i as f64 / 1000.0).leakage();
            assert!((0.0..=1.0).contains(&leak));
        }
        assert!((0.25f64.entropy() - 0.811278).abs() < 1e-6);
    }

    #[test]
    fn test_constant_addresses_leak_everything() {
        let mut analyzer = EntropyLeakage::with_bits(4, 64, IndexScheme::Modulo, 8);
        for _ in 0..10 {
            analyzer.observe(1, 0b1010_0101);
        }
        let report = analyzer.finalize();
        let set = &report.sets[1];
        assert_eq!(set.samples, 10);
        assert_eq!(set.leakage, 8.0);
        assert_eq!(set.index_leakage, 2.0);
        assert_eq!(set.tag_leakage, 6.0);
        assert_eq!(set.entropy, 0.0);
        assert_eq!(set.probability[0], 1.0);
        assert_eq!(set.probability[1], 0.0);
        assert_eq!(report.sets_used(), 1);
        assert_eq!(report.utilization(), 0.25);
        assert_eq!(report.footprint, 64);
    }

    #[test]
    fn test_wide_footprint_saturates() {
        let mut analyzer = EntropyLeakage::with_bits(1, 64, IndexScheme::Modulo, 8);
        analyzer.observe(0, 0);
        analyzer.observe(0, u64::MAX >> 6);
        assert_eq!(analyzer.finalize().footprint, u64::MAX);

        let mut analyzer = EntropyLeakage::with_bits(1, 64, IndexScheme::Modulo, 8);
        analyzer.observe(0, 0x40);
        analyzer.observe(0, 0x43);
        assert_eq!(analyzer.finalize().footprint, 4 * 64);
    }

    #[test]
    fn test_uniform_bit_leaks_nothing_alone() {
        let mut analyzer = EntropyLeakage::with_bits(1, 64, IndexScheme::Modulo, 2);
        // bit 0 uniform, bit 1 always equal to bit 0
        for address in [0b00, 0b11, 0b00, 0b11] {
            analyzer.observe(0, address);
        }
        let report = analyzer.finalize();
        let set = &report.sets[0];
        assert_eq!(set.leakage, 0.0);
        // bit 1 is fully correlated with bit 0, which leaks nothing itself
        assert_eq!(set.bit_correlation_leakage, vec![0.0, 0.0]);
    }

    #[test]
    fn test_correlation_propagates_leakage() {
        let mut analyzer = EntropyLeakage::with_bits(1, 64, IndexScheme::Modulo, 3);
        // bit 0 constant, bit 1 uniform, bit 2 mirrors bit 1
        for address in [0b001, 0b111, 0b001, 0b111] {
            analyzer.observe(0, address);
        }
        let set = analyzer.finalize().sets.remove(0);
        assert_eq!(set.probability, vec![1.0, 0.5, 0.5]);
        assert_eq!(set.leakage, 1.0);
        // bit 1 and bit 0 agree half of the time, so nothing propagates
        assert_eq!(set.bit_correlation_leakage, vec![1.0, 0.0, 0.0]);
        assert_eq!(set.correlation_leakage, 1.0);
    }

    #[test]
    fn test_report_streams() {
        let mut analyzer = EntropyLeakage::with_bits(2, 64, IndexScheme::Ceaser, 4);
        analyzer.observe(0, 3);
        analyzer.observe(0, 5);
        let report = analyzer.finalize();

        let mut summary = Vec::new();
        report.write_summary(&mut summary).unwrap();
        let summary = String::from_utf8(summary).unwrap();
        assert!(summary.starts_with("Number of addresses read:, 2\n"));
        assert!(summary.contains("Scheme:, 8, CEASER"));
        assert!(summary.contains("Set lines used:, 1 , Utilization:, 0.500000"));
        assert!(summary.contains(&format!(
            "Total addresses:, 2, Average entropy:, {:.6}, Average info leakage:, {:.6}, \
             Set index leakage:, {:.6}, Tag info leakage:, {:.6}",
            report.sets[0].entropy,
            report.sets[0].leakage,
            report.sets[0].index_leakage,
            report.sets[0].tag_leakage
        )));

        let mut detail = Vec::new();
        report.write_detail(&mut detail).unwrap();
        let detail = String::from_utf8(detail).unwrap();
        assert_eq!(detail.lines().count(), 1 + 2 * 4);
        assert!(detail.contains("\n0,0,1.000000,1.000000\n"));
    }
}
