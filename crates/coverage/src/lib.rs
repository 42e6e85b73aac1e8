//! # solcov-coverage
//!
//! Trace-based source coverage for Solidity projects.
//!
//! The pipeline has four stages:
//!
//! 1. [`Sources::crawl`](sources::Sources::crawl) indexes compiled artifacts:
//!    bytecodes, their source maps, and the compiler sources behind them.
//! 2. [`Trace::crawl`](trace::Trace::crawl) fetches a transaction's opcode
//!    trace over JSON-RPC and reconstructs the call stack, tagging every
//!    opcode with the bytecode that executed it.
//! 3. [`Coverage`](coverage::Coverage) projects compiler ASTs onto per-byte
//!    syntax tables and rolls tagged opcodes into hit counters.
//! 4. [`CoverInterceptor`](interceptor::CoverInterceptor) wraps a JSON-RPC
//!    provider so a test suite produces traces as a side effect of running.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

#[macro_use]
extern crate tracing;

use alloy_primitives::Address;

pub mod analysis;
pub mod artifacts;
pub mod ast;
pub mod coverage;
pub mod interceptor;
pub mod provider;
pub mod report;
pub mod sourcemap;
pub mod sources;
pub mod trace;

pub use analysis::SyntaxTable;
pub use coverage::Coverage;
pub use interceptor::{CoverInterceptor, TraceReporter};
pub use provider::{HttpProvider, RpcProvider};
pub use report::Report;
pub use sourcemap::{SourceMap, SourceRange};
pub use sources::Sources;
pub use trace::{Executor, StructLog, TaggedLog, Trace};

/// Errors produced while attributing executed bytecode back to source.
#[derive(Debug, thiserror::Error)]
pub enum CoverageError {
    /// The program counter does not mark an instruction start.
    #[error("unknown program counter {pc} in {fqdn}")]
    UnknownProgramCounter { fqdn: String, pc: usize },
    /// The instruction index has no source-map entry.
    #[error("unknown instruction index {index} in {fqdn}")]
    UnknownInstructionIndex { fqdn: String, index: usize },
    /// No bytecode has been recorded for the address.
    #[error("no bytecode known for address {0}")]
    UnknownAddress(Address),
    /// The bytecode matches no known source map, exactly or fuzzily.
    #[error("no source map matches bytecode {}", short_hex(.0))]
    NoSourceMap(String),
    /// The source id is not bound to a path for this bytecode.
    #[error("no source path for id {index} of bytecode {}", short_hex(.bytecode))]
    NoPathForSource { bytecode: String, index: i32 },
    /// The bytecode object is not decodable hex.
    #[error("invalid bytecode for {fqdn}: {reason}")]
    InvalidBytecode { fqdn: String, reason: String },
    /// The struct logs violate the call-stack discipline.
    #[error("inconsistent trace: {0}")]
    TraceInconsistency(String),
    /// The provider failed or returned a malformed response.
    #[error(transparent)]
    Rpc(#[from] alloy_transport::TransportError),
}

/// Strips a `0x`/`0X` prefix and lowercases the rest.
pub(crate) fn normalize_hex(s: &str) -> String {
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    s.to_ascii_lowercase()
}

/// Abbreviates a (potentially huge) hex blob for error messages.
fn short_hex(s: &str) -> String {
    if s.len() <= 16 {
        s.to_string()
    } else {
        format!("{}..{} ({} hex chars)", &s[..8], &s[s.len() - 8..], s.len())
    }
}
