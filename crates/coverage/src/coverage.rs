//! Hit attribution: tagged opcodes -> report counters.

use crate::{
    analysis::{Feature, SyntaxTable},
    report::{Report, SourceStats},
    sourcemap::SourceRange,
    sources::Sources,
    trace::{Executor, StructLog, TaggedLog},
    CoverageError,
};
use std::{collections::HashMap, sync::Arc};

/// Converts reconstructed traces into coverage reports.
///
/// Owns its [`Sources`] (trace crawling and fuzzy matching mutate them) and
/// the syntax tables precomputed for every interned source path.
#[derive(Debug)]
pub struct Coverage {
    sources: Sources,
    path_to_syntax: HashMap<String, Arc<SyntaxTable>>,
}

impl Coverage {
    /// Precomputes syntax tables for every source known to `sources`.
    pub fn new(sources: Sources) -> Self {
        let path_to_syntax = sources
            .compiler_sources()
            .map(|(path, source)| {
                trace!(%path, "building syntax table");
                (path.clone(), Arc::new(SyntaxTable::build(&source.content, &source.ast)))
            })
            .collect();
        Self { sources, path_to_syntax }
    }

    pub fn sources(&self) -> &Sources {
        &self.sources
    }

    pub fn sources_mut(&mut self) -> &mut Sources {
        &mut self.sources
    }

    pub fn syntax(&self, path: &str) -> Option<&Arc<SyntaxTable>> {
        self.path_to_syntax.get(path)
    }

    /// A zero-initialized report covering every known source path.
    pub fn fresh_report(&self) -> Report {
        Report(
            self.path_to_syntax
                .iter()
                .map(|(path, syntax)| (path.clone(), SourceStats::fresh(path, syntax)))
                .collect(),
        )
    }

    /// Accumulates `logs` into `report`.
    ///
    /// Opcodes whose instruction has no source-map entry (metadata tails of
    /// prefix-matched bytecodes) and opcodes attributed to an unindexed
    /// source id (`-1`, compiler internals) are skipped. Unknown addresses
    /// and unknown bytecodes abort the call: the trace cannot be attributed
    /// at all.
    pub fn report(&mut self, logs: &[TaggedLog], report: &mut Report) -> Result<(), CoverageError> {
        let Self { sources, path_to_syntax } = self;
        for tagged in logs {
            let bytecode = match &tagged.executor {
                Executor::Bytecode(code) => code.clone(),
                Executor::Address(address) => sources.address_to_bytecode(*address)?.to_string(),
            };
            let map = sources.bytecode_to_source_map(&bytecode)?;

            let range = match map.pc_to_range(tagged.log.pc as usize) {
                Ok(range) => range,
                Err(err) => {
                    trace!(%err, "skipping unmapped opcode");
                    continue;
                }
            };
            if range.length == 0 {
                continue;
            }

            let path = match sources.compiler_source_path(&map.bytecode, range.index) {
                Ok(path) => path.to_string(),
                Err(err) => {
                    trace!(%err, "skipping opcode without a source path");
                    continue;
                }
            };
            let Some(syntax) = path_to_syntax.get(&path) else {
                debug!(%path, "no syntax table for attributed path");
                continue;
            };

            let stats = report
                .0
                .entry(path.clone())
                .or_insert_with(|| SourceStats::fresh(&path, syntax));
            tally(&tagged.log, range, syntax, stats, path.starts_with('#'));
        }
        Ok(())
    }

    /// A copy of `report` fit for output: synthetic (`#`) and disambiguated
    /// (`:`) paths are dropped, and `l` keeps only lines with at least one
    /// significant feature.
    pub fn filtered_report(&self, report: &Report) -> Report {
        let mut filtered = Report::default();
        for (path, stats) in &report.0 {
            if path.starts_with('#') || path.contains(':') {
                continue;
            }
            let mut stats = stats.clone();
            if let Some(syntax) = self.path_to_syntax.get(path) {
                let significant = syntax.significant_lines();
                stats.l.retain(|line, _| significant.contains(line));
            }
            filtered.0.insert(path.clone(), stats);
        }
        filtered
    }
}

/// Applies one opcode's source range to the per-path counters.
///
/// Dedup rules, per opcode:
/// - a line is counted when it differs from the previously counted line;
/// - only the first branch feature counts;
/// - functions count only on `JUMPDEST`, and only the first feature;
/// - statements count on every occurrence.
fn tally(
    log: &StructLog,
    range: SourceRange,
    syntax: &SyntaxTable,
    stats: &mut SourceStats,
    generated: bool,
) {
    let mut counted_line = None;
    let mut counted_branch = false;
    let mut counted_function = false;

    for offset in range.start..range.start + range.length {
        let Some(features) = syntax.features.get(offset) else {
            // Generated-source maps sometimes point past the synthetic
            // content; tolerate the tail.
            if !generated {
                warn!(offset, path = %stats.path, "source range extends past content");
            }
            break;
        };
        for feature in features {
            match *feature {
                Feature::Line { line } => {
                    if counted_line != Some(line) {
                        *stats.l.entry(line).or_insert(0) += 1;
                        counted_line = Some(line);
                    }
                }
                Feature::Branch { id, alt } => {
                    if !counted_branch {
                        if let Some(counter) =
                            stats.b.get_mut(&id).and_then(|alts| alts.get_mut(alt as usize))
                        {
                            *counter += 1;
                        }
                        counted_branch = true;
                    }
                }
                Feature::Function { id } => {
                    if log.op == "JUMPDEST" && !counted_function {
                        *stats.f.entry(id).or_insert(0) += 1;
                        counted_function = true;
                    }
                }
                Feature::Statement { id } => {
                    *stats.s.entry(id).or_insert(0) += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ast::{AstNode, CompilerSource}, sourcemap::SourceMap};
    use serde_json::json;
    use std::collections::BTreeMap;

    const CONTENT: &str = "f();\ng();\n";

    /// Two identifier statements, one per line, plus an if over both.
    fn fixture_ast() -> AstNode {
        serde_json::from_value(json!({
            "nodeType": "SourceUnit",
            "src": format!("0:{}:0", CONTENT.len()),
            "nodes": [
                { "nodeType": "Identifier", "src": "0:3:0" },
                { "nodeType": "Identifier", "src": "5:3:0" },
                {
                    "nodeType": "IfStatement",
                    "src": format!("0:{}:0", CONTENT.len()),
                    "trueBody": { "nodeType": "Identifier", "src": "0:1:0" },
                    "falseBody": { "nodeType": "Identifier", "src": "5:1:0" },
                },
            ],
        }))
        .unwrap()
    }

    fn compiler_source(path: &str) -> CompilerSource {
        CompilerSource {
            path: path.into(),
            content: CONTENT.into(),
            ast: Arc::new(fixture_ast()),
            id: 0,
        }
    }

    /// `PUSH1 0x00` then `JUMPDEST` then `STOP`; the source map attributes
    /// pc 0 to bytes 0..4 (line 1), pc 2 to bytes 0..9 (both lines), pc 3
    /// to nothing.
    fn coverage_for(path: &str) -> (Coverage, String) {
        let source = compiler_source(path);
        let sources_by_id: BTreeMap<u32, CompilerSource> = [(0, source)].into();
        let map =
            SourceMap::parse("C.sol:C", "60005b00", "0:4:0;0:9:0;0:0:0", sources_by_id).unwrap();
        let bytecode = map.bytecode.clone();
        let mut sources = Sources::new();
        sources.index_source_map(Arc::new(map));
        (Coverage::new(sources), bytecode)
    }

    fn log(op: &str, pc: u64) -> StructLog {
        StructLog { pc, op: op.into(), depth: 1, ..Default::default() }
    }

    fn tagged(bytecode: &str, op: &str, pc: u64) -> TaggedLog {
        TaggedLog { log: log(op, pc), executor: Executor::Bytecode(bytecode.into()) }
    }

    #[test]
    fn one_opcode_counts_a_line_once() {
        let (mut coverage, code) = coverage_for("C.sol");
        let mut report = coverage.fresh_report();

        // pc 0 spans four bytes of line 1.
        coverage.report(&[tagged(&code, "PUSH1", 0)], &mut report).unwrap();
        assert_eq!(report.0["C.sol"].l[&1], 1);
        assert_eq!(report.0["C.sol"].l[&2], 0);

        // Two consecutive opcodes on the same line count twice.
        coverage.report(&[tagged(&code, "PUSH1", 0)], &mut report).unwrap();
        assert_eq!(report.0["C.sol"].l[&1], 2);
    }

    #[test]
    fn opcode_spanning_two_lines_counts_each_once() {
        let (mut coverage, code) = coverage_for("C.sol");
        let mut report = coverage.fresh_report();
        // pc 2 spans bytes 0..9: lines 1 and 2.
        coverage.report(&[tagged(&code, "JUMPDEST", 2)], &mut report).unwrap();
        assert_eq!(report.0["C.sol"].l[&1], 1);
        assert_eq!(report.0["C.sol"].l[&2], 1);
    }

    #[test]
    fn only_the_first_branch_feature_counts() {
        let (mut coverage, code) = coverage_for("C.sol");
        let mut report = coverage.fresh_report();
        // pc 2's range covers both alternatives' start bytes (0 and 5).
        coverage.report(&[tagged(&code, "JUMPDEST", 2)], &mut report).unwrap();
        assert_eq!(report.0["C.sol"].b[&0], vec![1, 0]);
    }

    #[test]
    fn statements_count_every_occurrence() {
        let (mut coverage, code) = coverage_for("C.sol");
        let mut report = coverage.fresh_report();
        coverage.report(&[tagged(&code, "JUMPDEST", 2)], &mut report).unwrap();
        // Both identifier statements are inside pc 2's range.
        assert_eq!(report.0["C.sol"].s[&0], 1);
        assert_eq!(report.0["C.sol"].s[&1], 1);
    }

    #[test]
    fn zero_length_ranges_are_skipped() {
        let (mut coverage, code) = coverage_for("C.sol");
        let mut report = coverage.fresh_report();
        coverage.report(&[tagged(&code, "STOP", 3)], &mut report).unwrap();
        assert!(report.0["C.sol"].l.values().all(|&count| count == 0));
    }

    #[test]
    fn reporting_twice_doubles_every_counter() {
        let (mut coverage, code) = coverage_for("C.sol");
        let logs =
            [tagged(&code, "PUSH1", 0), tagged(&code, "JUMPDEST", 2), tagged(&code, "STOP", 3)];

        let mut once = coverage.fresh_report();
        coverage.report(&logs, &mut once).unwrap();
        let mut twice = coverage.fresh_report();
        coverage.report(&logs, &mut twice).unwrap();
        coverage.report(&logs, &mut twice).unwrap();

        let (a, b) = (&once.0["C.sol"], &twice.0["C.sol"]);
        assert!(a.l.iter().all(|(line, count)| b.l[line] == count * 2));
        assert!(a.s.iter().all(|(id, count)| b.s[id] == count * 2));
        assert!(a.b.iter().all(|(id, counts)| {
            b.b[id].iter().zip(counts).all(|(double, single)| *double == single * 2)
        }));
    }

    #[test]
    fn address_tagged_logs_resolve_through_sources() {
        let (mut coverage, code) = coverage_for("C.sol");
        let address = alloy_primitives::address!("00000000000000000000000000000000000000aa");
        coverage.sources_mut().load_addresses([(address, code)]);

        let mut report = coverage.fresh_report();
        let tagged = TaggedLog { log: log("PUSH1", 0), executor: Executor::Address(address) };
        coverage.report(&[tagged], &mut report).unwrap();
        assert_eq!(report.0["C.sol"].l[&1], 1);

        let unknown = alloy_primitives::address!("00000000000000000000000000000000000000bb");
        let tagged = TaggedLog { log: log("PUSH1", 0), executor: Executor::Address(unknown) };
        let err = coverage.report(&[tagged], &mut report).unwrap_err();
        assert!(matches!(err, CoverageError::UnknownAddress(_)));
    }

    #[test]
    fn generated_source_tails_are_tolerated_and_filtered() {
        let (mut coverage, _code) = coverage_for("#utility.yul");
        let mut report = coverage.fresh_report();

        // Extend the attributed range past the synthetic content: the byte
        // loop must stop quietly instead of failing.
        let source = compiler_source("#utility.yul");
        let map = SourceMap::parse(
            "C.sol:C (creation)",
            "00",
            &format!("0:{}:0", CONTENT.len() + 40),
            [(0, source)].into(),
        )
        .unwrap();
        coverage.sources_mut().index_source_map(Arc::new(map));
        coverage.report(&[tagged("00", "STOP", 0)], &mut report).unwrap();

        let filtered = coverage.filtered_report(&report);
        assert!(filtered.0.is_empty(), "generated paths must be filtered out");
    }

    #[test]
    fn filter_keeps_only_significant_lines() {
        let (mut coverage, code) = coverage_for("C.sol");
        let mut report = coverage.fresh_report();
        coverage.report(&[tagged(&code, "JUMPDEST", 2)], &mut report).unwrap();

        let filtered = coverage.filtered_report(&report);
        let stats = &filtered.0["C.sol"];
        // Lines 1 and 2 carry identifier statements: both significant.
        assert_eq!(stats.l.len(), 2);

        // A path with a disambiguation suffix is dropped wholesale.
        let mut with_alias = report.clone();
        let alias = with_alias.0["C.sol"].clone();
        with_alias.0.insert("C.sol:0".into(), alias);
        assert!(!coverage.filtered_report(&with_alias).0.contains_key("C.sol:0"));
    }
}
