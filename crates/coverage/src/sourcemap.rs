//! Source-map decoding and program-counter mapping.
//!
//! The compiler emits one compressed source-map entry per instruction, while
//! traces report byte-offset program counters. [`SourceMap`] bridges the two:
//! it walks the decoded bytecode once to build a pc -> instruction-index
//! table and decompresses the map into an instruction-index -> range table.

use crate::{ast::CompilerSource, normalize_hex, CoverageError};
use alloy_primitives::hex;
use rustc_hash::FxHashMap;
use std::{collections::BTreeMap, str::FromStr};

/// A half-open region `[start, start + length)` of one source file.
///
/// `length == 0` means the instruction has no attributable source. `index`
/// is the compiler's source file id; `-1` marks compiler-internal code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceRange {
    pub start: usize,
    pub length: usize,
    pub index: i32,
}

impl FromStr for SourceRange {
    type Err = std::num::ParseIntError;

    /// Parses the `start:length:index` form used by AST `src` attributes.
    ///
    /// Negative `start`/`length` (emitted for synthesized nodes) collapse to
    /// an empty range rather than failing.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split(':');
        let mut next = |default: i64| -> Result<i64, Self::Err> {
            match fields.next() {
                Some(v) if !v.is_empty() => v.parse(),
                _ => Ok(default),
            }
        };
        let start = next(0)?;
        let length = next(0)?;
        let index = next(-1)?;
        Ok(Self {
            start: start.max(0) as usize,
            length: if start < 0 { 0 } else { length.max(0) as usize },
            index: index as i32,
        })
    }
}

/// A parsed source map for one bytecode.
#[derive(Clone, Debug)]
pub struct SourceMap {
    /// Label used in diagnostics, conventionally `<path>:<contract>`.
    pub fqdn: String,
    /// The bytecode this map was compiled for, as lowercase unprefixed hex.
    pub bytecode: String,
    /// The compiler sources referenced by `ranges`, keyed by source id.
    ///
    /// Ids are sparse: compiler-generated sources get ids past the user
    /// sources.
    pub compiler_sources: BTreeMap<u32, CompilerSource>,
    pc_to_instruction: FxHashMap<usize, usize>,
    ranges: Vec<SourceRange>,
}

impl SourceMap {
    /// Parses a compressed source map against its bytecode object.
    ///
    /// `object` is the hex bytecode (`0x` prefix optional); `source_map` is
    /// the compiler's `;`-separated compressed map.
    pub fn parse(
        fqdn: impl Into<String>,
        object: &str,
        source_map: &str,
        compiler_sources: BTreeMap<u32, CompilerSource>,
    ) -> Result<Self, CoverageError> {
        let fqdn = fqdn.into();
        let bytecode = normalize_hex(object);
        let bytes = hex::decode(&bytecode).map_err(|e| CoverageError::InvalidBytecode {
            fqdn: fqdn.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            pc_to_instruction: build_pc_table(&bytes),
            ranges: decompress(source_map),
            fqdn,
            bytecode,
            compiler_sources,
        })
    }

    /// Returns the ordinal of the instruction starting at `pc`.
    pub fn pc_to_instruction_index(&self, pc: usize) -> Result<usize, CoverageError> {
        self.pc_to_instruction.get(&pc).copied().ok_or_else(|| {
            CoverageError::UnknownProgramCounter { fqdn: self.fqdn.clone(), pc }
        })
    }

    /// Returns the source range attributed to the `index`-th instruction.
    pub fn instruction_index_to_range(&self, index: usize) -> Result<SourceRange, CoverageError> {
        self.ranges.get(index).copied().ok_or_else(|| {
            CoverageError::UnknownInstructionIndex { fqdn: self.fqdn.clone(), index }
        })
    }

    /// Maps a program counter straight to its source range.
    pub fn pc_to_range(&self, pc: usize) -> Result<SourceRange, CoverageError> {
        self.instruction_index_to_range(self.pc_to_instruction_index(pc)?)
    }

    /// The number of instructions found while walking the bytecode.
    pub fn instruction_count(&self) -> usize {
        self.pc_to_instruction.len()
    }
}

/// Walks the decoded bytecode recording each instruction-start offset.
///
/// PUSH1..PUSH32 carry `op - 0x60 + 1` immediate bytes. Truncated push data
/// at the end of the code still yields an entry for the final opcode; the
/// walk just stops at the code end.
fn build_pc_table(bytes: &[u8]) -> FxHashMap<usize, usize> {
    let mut table = FxHashMap::with_capacity_and_hasher(bytes.len(), Default::default());
    let mut pc = 0usize;
    let mut index = 0usize;
    while pc < bytes.len() {
        table.insert(pc, index);
        let op = bytes[pc];
        pc += if (0x60..=0x7f).contains(&op) { (op - 0x60) as usize + 2 } else { 1 };
        index += 1;
    }
    table.shrink_to_fit();
    table
}

/// Decompresses `s:l:f:j:m` entries, inheriting empty fields from the
/// previous entry. Only `s`, `l` and `f` are retained.
fn decompress(source_map: &str) -> Vec<SourceRange> {
    let mut ranges = Vec::new();
    let (mut start, mut length, mut index) = (0i64, 0i64, 0i64);
    for entry in source_map.split(';') {
        let mut fields = entry.split(':');
        let mut take = |slot: &mut i64| {
            if let Some(v) = fields.next() {
                if !v.is_empty() {
                    if let Ok(parsed) = v.parse() {
                        *slot = parsed;
                    }
                }
            }
        };
        take(&mut start);
        take(&mut length);
        take(&mut index);
        ranges.push(SourceRange {
            start: start.max(0) as usize,
            length: length.max(0) as usize,
            index: index as i32,
        });
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(object: &str, source_map: &str) -> SourceMap {
        SourceMap::parse("A.sol:A", object, source_map, BTreeMap::new()).unwrap()
    }

    #[test]
    fn decompression_inherits_previous_fields() {
        let ranges = decompress("10:20:0;;5::");
        assert_eq!(
            ranges,
            vec![
                SourceRange { start: 10, length: 20, index: 0 },
                SourceRange { start: 10, length: 20, index: 0 },
                SourceRange { start: 5, length: 20, index: 0 },
            ]
        );
    }

    #[test]
    fn walker_skips_push_data() {
        // PUSH1 0x00, STOP
        let m = map("600000", ";;");
        assert_eq!(m.pc_to_instruction_index(0).unwrap(), 0);
        assert_eq!(m.pc_to_instruction_index(2).unwrap(), 1);
        assert!(matches!(
            m.pc_to_instruction_index(1),
            Err(CoverageError::UnknownProgramCounter { pc: 1, .. })
        ));
    }

    #[test]
    fn walker_covers_constructor_prologue() {
        // The classic `PUSH1 0x80 PUSH1 0x40 MSTORE CALLVALUE DUP1 ISZERO ..`
        // prologue: instruction starts land after each push's data byte.
        let m = map("6080604052348015600f57600080fd5b50", "155:997:1:-:0;;;;;");
        for (pc, index) in [(0, 0), (2, 1), (4, 2), (5, 3), (6, 4), (7, 5), (9, 6), (16, 11)] {
            assert_eq!(m.pc_to_instruction_index(pc).unwrap(), index, "pc {pc}");
        }
        assert_eq!(
            m.instruction_index_to_range(5).unwrap(),
            SourceRange { start: 155, length: 997, index: 1 }
        );
        // More instructions than map entries: the range lookup is what fails.
        assert!(matches!(
            m.pc_to_range(16),
            Err(CoverageError::UnknownInstructionIndex { index: 11, .. })
        ));
    }

    #[test]
    fn truncated_push_data_is_tolerated() {
        // PUSH3 with a single data byte: the opcode still gets an entry.
        let m = map("62ff", "1:1:0");
        assert_eq!(m.pc_to_instruction_index(0).unwrap(), 0);
        assert_eq!(m.instruction_count(), 1);
    }

    #[test]
    fn negative_fields_collapse_to_empty_ranges() {
        let ranges = decompress("-1:-1:-1;10:5:0");
        assert_eq!(ranges[0], SourceRange { start: 0, length: 0, index: -1 });
        assert_eq!(ranges[1], SourceRange { start: 10, length: 5, index: 0 });
    }

    #[test]
    fn src_attribute_parsing() {
        assert_eq!(
            "155:997:1".parse::<SourceRange>().unwrap(),
            SourceRange { start: 155, length: 997, index: 1 }
        );
        assert_eq!(
            "-1:-1:-1".parse::<SourceRange>().unwrap(),
            SourceRange { start: 0, length: 0, index: -1 }
        );
    }

    #[test]
    fn rejects_non_hex_bytecode() {
        let err =
            SourceMap::parse("A.sol:A", "60zz", "", BTreeMap::new()).unwrap_err();
        assert!(matches!(err, CoverageError::InvalidBytecode { .. }));
    }
}
