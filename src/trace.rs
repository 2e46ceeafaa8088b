// SPDX-FileCopyrightText: 2023 Stefan Hackenberg <mail@stefan-hackenberg.de>
//
// SPDX-License-Identifier: MIT

//! Trace input.
//!
//! Text records look like
//!
//! ```text
//! S 0 7ffd1040 8 0102030405060708 S
//! L 0 7ffd1040 8 0102030405060708 H
//! I 0 401000 4 90909090
//! F 0 602000
//! ```
//!
//! The first character is the record type, followed by the core id in
//! decimal, the hexadecimal address, the decimal size, the data bytes in
//! memory order (only in traces with data) and a segment character.
//! `P` and `F` records end after the address, `A` records after the size and
//! `I` records after the data.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use anyhow::{Context, Result};
use arrayvec::ArrayVec;
use log::{debug, warn};

use crate::{
    error::SimError,
    memref::{MemoryReference, Operation, Segment, MAX_REFERENCE_SIZE},
};

/// Source of memory references.
pub trait TraceReader {
    /// Next well formed reference, `None` at the end of the trace.
    fn next(&mut self) -> Result<Option<MemoryReference>>;

    fn close(&mut self) {}
}

/// Reader of the textual trace format.
pub struct MoolaTextReader<R: BufRead> {
    input: Option<R>,
    name: String,
    with_data: bool,
    line: u64,
    buffer: String,
    skipped: u64,
}

impl MoolaTextReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P, with_data: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(SimError::from)
            .with_context(|| format!("Could not open trace {}", path.display()))?;
        Ok(Self::new(
            BufReader::new(file),
            path.display().to_string(),
            with_data,
        ))
    }
}

impl<R: BufRead> MoolaTextReader<R> {
    pub fn new(input: R, name: impl Into<String>, with_data: bool) -> Self {
        Self {
            input: Some(input),
            name: name.into(),
            with_data,
            line: 0,
            buffer: String::new(),
            skipped: 0,
        }
    }

    /// Malformed records skipped so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl<R: BufRead> TraceReader for MoolaTextReader<R> {
    fn next(&mut self) -> Result<Option<MemoryReference>> {
        loop {
            let Some(input) = self.input.as_mut() else {
                return Ok(None);
            };
            self.buffer.clear();
            if input.read_line(&mut self.buffer).map_err(SimError::from)? == 0 {
                return Ok(None);
            }
            self.line += 1;
            match parse_record(&self.buffer, self.with_data) {
                Ok(Some(mut mr)) => {
                    mr.line = self.line;
                    return Ok(Some(mr));
                }
                Ok(None) => continue,
                Err(reason) => {
                    self.skipped += 1;
                    let error = SimError::TraceParse {
                        line: self.line,
                        reason,
                    };
                    warn!("{}: skipping record: {}", self.name, error);
                }
            }
        }
    }

    fn close(&mut self) {
        if self.input.take().is_some() {
            debug!(
                "{}: closed after {} lines, {} skipped",
                self.name, self.line, self.skipped
            );
        }
    }
}

/// References held in memory.
pub struct InMemoryTrace {
    references: std::vec::IntoIter<MemoryReference>,
}

impl InMemoryTrace {
    pub fn new(references: Vec<MemoryReference>) -> Self {
        Self {
            references: references.into_iter(),
        }
    }
}

impl TraceReader for InMemoryTrace {
    fn next(&mut self) -> Result<Option<MemoryReference>> {
        Ok(self.references.next())
    }
}

fn operation_of(code: char) -> Option<Operation> {
    Some(match code.to_ascii_uppercase() {
        'A' => Operation::Allocate,
        'F' => Operation::Free,
        'I' => Operation::InstructionFetch,
        'L' | 'R' => Operation::Read,
        'M' => Operation::Modify,
        'S' | 'W' => Operation::Write,
        'P' => Operation::StackUpdate,
        _ => return None,
    })
}

fn segment_of(code: &str) -> Segment {
    match code.chars().next().map(|c| c.to_ascii_uppercase()) {
        Some('G') => Segment::Global,
        Some('H') => Segment::Heap,
        Some('S') => Segment::Stack,
        _ => Segment::Other,
    }
}

fn parse_hex(token: &str) -> Result<u64, String> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u64::from_str_radix(digits, 16).map_err(|e| format!("bad hex value '{token}': {e}"))
}

fn parse_bytes(token: &str) -> Result<ArrayVec<u8, MAX_REFERENCE_SIZE>, String> {
    let digits = token.strip_prefix("0x").unwrap_or(token);
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in '{token}'"));
    }
    let mut bytes = ArrayVec::new();
    for pair in digits.as_bytes().chunks(2) {
        let pair = std::str::from_utf8(pair).map_err(|e| e.to_string())?;
        let byte = u8::from_str_radix(pair, 16).map_err(|e| format!("bad data '{token}': {e}"))?;
        bytes
            .try_push(byte)
            .map_err(|_| format!("more than {MAX_REFERENCE_SIZE} data bytes"))?;
    }
    Ok(bytes)
}

/// Parse one trace line. Blank and comment lines give `Ok(None)`.
pub fn parse_record(line: &str, with_data: bool) -> Result<Option<MemoryReference>, String> {
    let line = line.trim();
    let mut chars = line.chars();
    let Some(code) = chars.next() else {
        return Ok(None);
    };
    if code == '#' {
        return Ok(None);
    }
    let operation = operation_of(code).ok_or_else(|| format!("unknown record type '{code}'"))?;

    let mut fields = chars
        .as_str()
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|field| !field.is_empty());
    let mut field = |name: &str| fields.next().ok_or_else(|| format!("missing {name}"));

    let core: usize = field("core")?
        .parse()
        .map_err(|e| format!("bad core id: {e}"))?;
    let address = parse_hex(field("address")?)?;
    let mut mr = MemoryReference::new(operation, address, 0).with_core(core);
    if matches!(operation, Operation::StackUpdate | Operation::Free) {
        return Ok(Some(mr));
    }

    let size: usize = field("size")?
        .parse()
        .map_err(|e| format!("bad size: {e}"))?;
    if operation == Operation::Allocate {
        return Ok(Some(mr));
    }
    if size > MAX_REFERENCE_SIZE {
        return Err(format!("size {size} exceeds {MAX_REFERENCE_SIZE}"));
    }
    mr.size = size;

    if with_data {
        let bytes = parse_bytes(field("data")?)?;
        mr = mr.with_data(&bytes);
    }
    if operation.is_instruction() {
        return Ok(Some(mr));
    }
    mr.segment = fields.next().map_or(Segment::Other, segment_of);
    Ok(Some(mr))
}
