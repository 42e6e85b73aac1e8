//! The coverage report model.
//!
//! The on-disk format is istanbul-style JSON keyed by source path: each
//! entry carries the structural maps (`branchMap`, `fnMap`, `statementMap`)
//! plus the hit counters (`l`, `b`, `f`, `s`). Counters are monotone; a
//! report only ever accumulates.

use crate::analysis::{BranchDesc, FunctionDesc, StatementDesc, SyntaxTable};
use serde::Serialize;
use std::collections::BTreeMap;

/// A coverage report keyed by source path.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(transparent)]
pub struct Report(pub BTreeMap<String, SourceStats>);

impl Report {
    /// Folds `other` into `self`, summing every counter. Paths unknown to
    /// `self` are adopted wholesale.
    pub fn merge(&mut self, other: &Self) {
        for (path, stats) in &other.0 {
            match self.0.get_mut(path) {
                Some(existing) => existing.merge(stats),
                None => {
                    self.0.insert(path.clone(), stats.clone());
                }
            }
        }
    }
}

/// Coverage data for one source file.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStats {
    pub path: String,
    pub branch_map: BTreeMap<u32, BranchDesc>,
    pub fn_map: BTreeMap<u32, FunctionDesc>,
    pub statement_map: BTreeMap<u32, StatementDesc>,
    /// Hits per 1-based line.
    pub l: BTreeMap<u32, u64>,
    /// Hits per branch id, one counter per alternative.
    pub b: BTreeMap<u32, Vec<u64>>,
    /// Hits per function id.
    pub f: BTreeMap<u32, u64>,
    /// Hits per statement id.
    pub s: BTreeMap<u32, u64>,
}

impl SourceStats {
    /// A zeroed entry for `path`: every line, branch alternative, function
    /// and statement present with a 0 count.
    pub fn fresh(path: &str, syntax: &SyntaxTable) -> Self {
        Self {
            path: path.to_string(),
            branch_map: syntax.branch_map.clone(),
            fn_map: syntax.fn_map.clone(),
            statement_map: syntax.statement_map.clone(),
            l: (1..=syntax.line_count()).map(|line| (line, 0)).collect(),
            b: syntax
                .branch_map
                .iter()
                .map(|(&id, branch)| (id, vec![0; branch.locations.len()]))
                .collect(),
            f: syntax.fn_map.keys().map(|&id| (id, 0)).collect(),
            s: syntax.statement_map.keys().map(|&id| (id, 0)).collect(),
        }
    }

    fn merge(&mut self, other: &Self) {
        for (&line, &count) in &other.l {
            *self.l.entry(line).or_insert(0) += count;
        }
        for (&id, counts) in &other.b {
            let mine = self.b.entry(id).or_default();
            if mine.len() < counts.len() {
                mine.resize(counts.len(), 0);
            }
            for (slot, &count) in mine.iter_mut().zip(counts) {
                *slot += count;
            }
        }
        for (&id, &count) in &other.f {
            *self.f.entry(id).or_insert(0) += count;
        }
        for (&id, &count) in &other.s {
            *self.s.entry(id).or_insert(0) += count;
        }
    }
}
