//! Execution-trace reconstruction.
//!
//! `debug_traceTransaction` returns a flat list of per-opcode entries; the
//! call stack has to be recovered from depth changes. Every opcode is then
//! tagged with the deployed code that executed it: an address for regular
//! frames, or the raw init bytecode for contracts still in their
//! constructor.

use crate::{normalize_hex, provider::parse_response, CoverageError, RpcProvider, Sources};
use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

/// One entry of a geth-style struct-log trace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructLog {
    pub pc: u64,
    pub op: String,
    pub depth: u64,
    #[serde(default)]
    pub stack: Vec<U256>,
    /// 32-byte memory words as unprefixed hex.
    #[serde(default)]
    pub memory: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas: Option<u64>,
    #[serde(default, rename = "gasCost", skip_serializing_if = "Option::is_none")]
    pub gas_cost: Option<u64>,
}

impl StructLog {
    /// The stack word `n` positions below the top.
    fn stack_from_top(&self, n: usize) -> Result<U256, CoverageError> {
        self.stack
            .len()
            .checked_sub(n + 1)
            .and_then(|i| self.stack.get(i))
            .copied()
            .ok_or_else(|| {
                CoverageError::TraceInconsistency(format!(
                    "{} at pc {} needs {} stack words, trace has {}",
                    self.op,
                    self.pc,
                    n + 1,
                    self.stack.len()
                ))
            })
    }

    /// Extracts `[offset, offset + length)` of this log's memory as hex,
    /// clamped to the recorded memory size.
    fn memory_slice(&self, offset: usize, length: usize) -> String {
        let memory = self.memory.concat();
        let start = (offset * 2).min(memory.len());
        let end = (offset * 2 + length * 2).min(memory.len());
        memory[start..end].to_string()
    }
}

/// What executed an opcode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Executor {
    /// A deployed contract; its code is resolved through
    /// [`Sources::address_to_bytecode`].
    Address(Address),
    /// A contract under construction: the init code captured from memory
    /// (or the transaction input for the outermost creation frame).
    Bytecode(String),
}

/// A struct log tagged with its executor.
#[derive(Clone, Debug)]
pub struct TaggedLog {
    pub log: StructLog,
    pub executor: Executor,
}

/// A reconstructed transaction trace.
#[derive(Clone, Debug, Default)]
pub struct Trace {
    pub logs: Vec<TaggedLog>,
}

#[derive(Deserialize)]
struct TxInfo {
    to: Option<Address>,
    #[serde(default)]
    input: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TraceFrame {
    #[serde(default)]
    struct_logs: Vec<StructLog>,
}

impl Trace {
    /// Fetches and reconstructs the trace of `tx_hash`.
    ///
    /// Every address observed executing code gets its deployed bytecode
    /// fetched via `eth_getCode` and merged into `sources`.
    pub async fn crawl(
        provider: &dyn RpcProvider,
        tx_hash: B256,
        sources: &mut Sources,
    ) -> Result<Self, CoverageError> {
        let tx = provider.request("eth_getTransactionByHash", json!([tx_hash])).await?;
        let tx: Option<TxInfo> = parse_response("eth_getTransactionByHash", tx)?;
        let tx = tx.ok_or_else(|| {
            CoverageError::TraceInconsistency(format!("transaction {tx_hash} not found"))
        })?;

        let frame = provider
            .request(
                "debug_traceTransaction",
                json!([tx_hash, { "disableStorage": true, "enableMemory": true }]),
            )
            .await?;
        let frame: TraceFrame = parse_response("debug_traceTransaction", frame)?;

        let root = match tx.to {
            Some(address) => Executor::Address(address),
            // A creation transaction: the init code is the calldata.
            None => Executor::Bytecode(normalize_hex(&tx.input)),
        };
        let trace = Self::reconstruct(&frame.struct_logs, root)?;

        let addresses: BTreeSet<Address> = trace
            .logs
            .iter()
            .filter_map(|tagged| match tagged.executor {
                Executor::Address(address) => Some(address),
                Executor::Bytecode(_) => None,
            })
            .collect();
        let mut bindings = Vec::with_capacity(addresses.len());
        for address in addresses {
            let code = provider.request("eth_getCode", json!([address, "latest"])).await?;
            let code: String = parse_response("eth_getCode", code)?;
            bindings.push((address, code));
        }
        sources.load_addresses(bindings);

        Ok(trace)
    }

    /// Recovers the call stack from depth transitions and tags each log.
    fn reconstruct(struct_logs: &[StructLog], root: Executor) -> Result<Self, CoverageError> {
        let mut frames = vec![root];
        let mut logs = Vec::with_capacity(struct_logs.len());

        for (i, pre) in struct_logs.iter().enumerate() {
            let post = struct_logs.get(i + 1);
            let top = frames.last().ok_or_else(|| {
                CoverageError::TraceInconsistency(format!("call stack underflow at step {i}"))
            })?;
            logs.push(TaggedLog { log: pre.clone(), executor: top.clone() });

            match pre.op.as_str() {
                "CALL" | "CALLCODE" | "DELEGATECALL" | "STATICCALL" => {
                    // No depth increase means the callee had no code to run
                    // (precompile or plain transfer): no frame.
                    if post.is_some_and(|p| p.depth == pre.depth + 1) {
                        let callee = Address::from_word(B256::from(pre.stack_from_top(1)?));
                        frames.push(Executor::Address(callee));
                    }
                }
                "CREATE" | "CREATE2" => {
                    if !post.is_some_and(|p| p.depth == pre.depth + 1) {
                        return Err(CoverageError::TraceInconsistency(format!(
                            "{} at pc {} did not enter a constructor frame",
                            pre.op, pre.pc
                        )));
                    }
                    let offset = to_usize(pre.stack_from_top(1)?, pre)?;
                    let length = to_usize(pre.stack_from_top(2)?, pre)?;
                    frames.push(Executor::Bytecode(pre.memory_slice(offset, length)));
                }
                _ => {
                    if let Some(post) = post {
                        if post.depth > pre.depth {
                            return Err(CoverageError::TraceInconsistency(format!(
                                "{} at pc {} increased call depth",
                                pre.op, pre.pc
                            )));
                        }
                        if post.depth < pre.depth {
                            frames.pop();
                        }
                    }
                }
            }
        }

        Ok(Self { logs })
    }
}

fn to_usize(word: U256, log: &StructLog) -> Result<usize, CoverageError> {
    usize::try_from(word).map_err(|_| {
        CoverageError::TraceInconsistency(format!(
            "{} at pc {} references out-of-range memory",
            log.op, log.pc
        ))
    })
}
