// SPDX-FileCopyrightText: 2023 Stefan Hackenberg <mail@stefan-hackenberg.de>
//
// SPDX-License-Identifier: MIT

//! Normalized memory references and their record pool.

use anyhow::Result;
use log::trace;

use crate::error::SimError;

/// Largest access a single reference can carry.
pub const MAX_REFERENCE_SIZE: usize = 32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Operation {
    #[default]
    Read,
    Write,
    Modify,
    InstructionFetch,
    PrefetchRead,
    PrefetchInstruction,
    Allocate,
    Free,
    StackUpdate,
    Invalidate,
    Clean,
}

impl Operation {
    pub const COUNT: usize = 11;

    pub const ALL: [Operation; Operation::COUNT] = [
        Operation::Read,
        Operation::Write,
        Operation::Modify,
        Operation::InstructionFetch,
        Operation::PrefetchRead,
        Operation::PrefetchInstruction,
        Operation::Allocate,
        Operation::Free,
        Operation::StackUpdate,
        Operation::Invalidate,
        Operation::Clean,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Writes and read-modify-writes change the data of a line.
    pub fn is_write(self) -> bool {
        matches!(self, Operation::Write | Operation::Modify)
    }

    pub fn is_instruction(self) -> bool {
        matches!(
            self,
            Operation::InstructionFetch | Operation::PrefetchInstruction
        )
    }

    /// Line clean and invalidate never reach lower levels.
    pub fn is_control(self) -> bool {
        matches!(self, Operation::Invalidate | Operation::Clean)
    }

    /// Trace events that do not access any cache.
    pub fn is_bookkeeping(self) -> bool {
        matches!(
            self,
            Operation::Allocate | Operation::Free | Operation::StackUpdate
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Modify => "modify",
            Operation::InstructionFetch => "instr",
            Operation::PrefetchRead => "pref-read",
            Operation::PrefetchInstruction => "pref-instr",
            Operation::Allocate => "alloc",
            Operation::Free => "free",
            Operation::StackUpdate => "stack",
            Operation::Invalidate => "invalidate",
            Operation::Clean => "clean",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Segment {
    #[default]
    Global,
    Heap,
    Instruction,
    Stack,
    Other,
}

impl Segment {
    pub const COUNT: usize = 5;

    pub const ALL: [Segment; Segment::COUNT] = [
        Segment::Global,
        Segment::Heap,
        Segment::Instruction,
        Segment::Stack,
        Segment::Other,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Segment::Global => "global",
            Segment::Heap => "heap",
            Segment::Instruction => "instr",
            Segment::Stack => "stack",
            Segment::Other => "other",
        }
    }
}

/// One logical memory transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryReference {
    pub address: u64,
    pub virtual_address: Option<u64>,
    /// Logical time, advanced as the reference travels through the hierarchy.
    pub time: u64,
    pub size: usize,
    /// Payload, zero where the trace carries no data values.
    pub data: [u8; MAX_REFERENCE_SIZE],
    pub operation: Operation,
    pub segment: Segment,
    pub core: usize,
    /// Set on the remainder of a line crossing access.
    pub split: bool,
    /// Trace line the reference was read from.
    pub line: u64,
}

impl MemoryReference {
    pub fn new(operation: Operation, address: u64, size: usize) -> Self {
        Self {
            address,
            size: size.min(MAX_REFERENCE_SIZE),
            operation,
            segment: if operation.is_instruction() {
                Segment::Instruction
            } else {
                Segment::Global
            },
            ..Default::default()
        }
    }

    pub fn with_segment(mut self, segment: Segment) -> Self {
        self.segment = segment;
        self
    }

    pub fn with_core(mut self, core: usize) -> Self {
        self.core = core;
        self
    }

    pub fn with_data(mut self, data: &[u8]) -> Self {
        let len = data.len().min(MAX_REFERENCE_SIZE);
        self.data[..len].copy_from_slice(&data[..len]);
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// Address of the last byte touched. Saturates at the top of the address space.
    pub fn last_address(&self) -> u64 {
        self.address.saturating_add(self.size.max(1) as u64 - 1)
    }
}

/// Free list of reference records.
#[derive(Debug)]
pub struct RefPool {
    free: Vec<MemoryReference>,
    capacity: usize,
    outstanding: usize,
}

impl RefPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Vec::new(),
            capacity,
            outstanding: 0,
        }
    }

    /// Hand out a zeroed record.
    pub fn obtain(&mut self) -> Result<MemoryReference> {
        if self.outstanding >= self.capacity {
            return Err(SimError::PoolExhausted(self.capacity).into());
        }
        self.outstanding += 1;
        Ok(self
            .free
            .pop()
            .map(|mut record| {
                record.clone_from(&MemoryReference::default());
                record
            })
            .unwrap_or_default())
    }

    pub fn release(&mut self, record: MemoryReference) {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.free.push(record);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

impl Default for RefPool {
    fn default() -> Self {
        Self::new(4096)
    }
}

/// Cut the part of `mr` that lies in its first cache line into a new record.
///
/// `mr` keeps the remainder, starting at the next line boundary, and is marked
/// as a split continuation.
pub fn ref_split(pool: &mut RefPool, mr: &mut MemoryReference, tag_mask: u64) -> Result<MemoryReference> {
    let boundary = (mr.address & tag_mask).wrapping_add(!tag_mask).wrapping_add(1);
    debug_assert!(boundary > mr.address && boundary <= mr.last_address());
    let head_size = (boundary - mr.address) as usize;

    let mut head = pool.obtain()?;
    head.address = mr.address;
    head.virtual_address = mr.virtual_address;
    head.time = mr.time;
    head.size = head_size;
    head.data[..head_size].copy_from_slice(&mr.data[..head_size]);
    head.operation = mr.operation;
    head.segment = mr.segment;
    head.core = mr.core;
    head.line = mr.line;
    head.split = mr.split;

    mr.address += head_size as u64;
    mr.virtual_address = mr.virtual_address.map(|va| va + head_size as u64);
    mr.size -= head_size;
    mr.data.copy_within(head_size.., 0);
    mr.data[MAX_REFERENCE_SIZE - head_size..].fill(0);
    mr.split = true;

    trace!(
        "split {:#x}+{} | {:#x}+{}",
        head.address,
        head.size,
        mr.address,
        mr.size
    );
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_at_line_boundary() {
        let mut pool = RefPool::new(2);
        let data: Vec<u8> = (1..=8).collect();
        let mut mr = MemoryReference::new(Operation::Write, 0x103c, 8)
            .with_data(&data)
            .with_segment(Segment::Heap);
        let head = ref_split(&mut pool, &mut mr, !0x3f).unwrap();

        assert_eq!(head.address, 0x103c);
        assert_eq!(head.payload(), &[1, 2, 3, 4]);
        assert!(!head.split);
        assert_eq!(head.segment, Segment::Heap);

        assert_eq!(mr.address, 0x1040);
        assert_eq!(mr.payload(), &[5, 6, 7, 8]);
        assert!(mr.split);
        assert!(mr.data[4..].iter().all(|&b| b == 0));
        assert_eq!(pool.outstanding(), 1);

        pool.release(head);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_split_walks_line_by_line() {
        let mut pool = RefPool::new(4);
        let data: Vec<u8> = (0..32).collect();
        let mut mr = MemoryReference::new(Operation::Write, 0x1008, 32).with_data(&data);

        let first = ref_split(&mut pool, &mut mr, !0xf).unwrap();
        assert_eq!((first.address, first.size), (0x1008, 8));
        assert!(!first.split);

        let second = ref_split(&mut pool, &mut mr, !0xf).unwrap();
        assert_eq!((second.address, second.size), (0x1010, 16));
        assert_eq!(second.payload(), &data[8..24]);
        assert!(second.split);

        assert_eq!((mr.address, mr.size), (0x1020, 8));
        assert_eq!(mr.payload(), &data[24..]);
    }

    #[test]
    fn test_last_address_saturates() {
        let mr = MemoryReference::new(Operation::Read, u64::MAX - 3, 8);
        assert_eq!(mr.last_address(), u64::MAX);
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut pool = RefPool::new(1);
        let first = pool.obtain().unwrap();
        assert!(pool.obtain().is_err());
        pool.release(first);
        let again = pool.obtain().unwrap();
        assert_eq!(again, MemoryReference::default());
    }
}
