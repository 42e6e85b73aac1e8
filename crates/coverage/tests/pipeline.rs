//! End-to-end pipeline test: build-info fixture -> crawl -> trace -> report.

use alloy_primitives::{address, B256};
use alloy_transport::{TransportError, TransportErrorKind};
use async_trait::async_trait;
use serde_json::{json, Value};
use solcov_coverage::{
    artifacts::DiskArtifacts, Coverage, RpcProvider, Sources, TraceReporter,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

const SOURCE: &str = "contract Counter {
    uint256 public count;

    function increment() public {
        count = count + 1;
    }
}
";

fn offset(snippet: &str) -> usize {
    SOURCE.find(snippet).unwrap()
}

fn src(snippet: &str) -> String {
    format!("{}:{}:0", offset(snippet), snippet.len())
}

/// The runtime bytecode the fixture pretends solc produced:
/// `JUMPDEST PUSH1 1 PUSH1 0 SLOAD ADD PUSH1 0 SSTORE`.
const DEPLOYED: &str = "5b600160005401600055";

fn fixture_build_info() -> Value {
    let fn_src = src("function increment() public {\n        count = count + 1;\n    }");
    let assign_src = src("count = count + 1");
    let add_src = src("count + 1");
    // One source-map entry per instruction: the JUMPDEST carries the
    // function range, everything else the assignment or its operands.
    let source_map = format!(
        "{fn_src}:-:0;{assign_src}:-:0;{add_src}:-:0;;;{assign_src}:-:0;"
    );

    let ast = json!({
        "nodeType": "SourceUnit",
        "src": format!("0:{}:0", SOURCE.len()),
        "nodes": [{
            "nodeType": "ContractDefinition",
            "src": format!("0:{}:0", SOURCE.len() - 1),
            "nodes": [
                {
                    "nodeType": "VariableDeclaration",
                    "src": src("uint256 public count"),
                },
                {
                    "nodeType": "FunctionDefinition",
                    "name": "increment",
                    "src": src("function increment() public {\n        count = count + 1;\n    }"),
                    "parameters": { "nodeType": "ParameterList", "src": src("()") },
                    "body": {
                        "nodeType": "Block",
                        "src": src("{\n        count = count + 1;\n    }"),
                        "statements": [{
                            "nodeType": "ExpressionStatement",
                            "src": src("count = count + 1;"),
                            "expression": {
                                "nodeType": "Assignment",
                                "src": src("count = count + 1"),
                                "leftHandSide": {
                                    "nodeType": "Identifier",
                                    "src": format!("{}:5:0", offset("count = count")),
                                },
                                "rightHandSide": {
                                    "nodeType": "BinaryOperation",
                                    "operator": "+",
                                    "src": src("count + 1"),
                                    "leftExpression": {
                                        "nodeType": "Identifier",
                                        "src": format!("{}:5:0", offset("count + 1")),
                                    },
                                    "rightExpression": {
                                        "nodeType": "Literal",
                                        "src": format!("{}:1:0", offset("1;")),
                                    },
                                },
                            },
                        }],
                    },
                },
            ],
        }],
    });

    json!({
        "input": { "sources": { "Counter.sol": { "content": SOURCE } } },
        "output": {
            "sources": { "Counter.sol": { "id": 0, "ast": ast } },
            "contracts": {
                "Counter.sol": {
                    "Counter": {
                        "evm": {
                            "bytecode": {
                                "object": format!("0x{DEPLOYED}"),
                                "sourceMap": source_map.clone(),
                            },
                            "deployedBytecode": {
                                "object": format!("0x{DEPLOYED}"),
                                "sourceMap": source_map,
                            },
                        },
                    },
                },
            },
        },
    })
}

struct MockProvider {
    responses: HashMap<String, Value>,
}

#[async_trait]
impl RpcProvider for MockProvider {
    async fn request(&self, method: &str, _params: Value) -> Result<Value, TransportError> {
        self.responses
            .get(method)
            .cloned()
            .ok_or_else(|| TransportErrorKind::custom_str(&format!("no response for {method}")))
    }
}

#[tokio::test]
async fn traces_roll_up_into_a_filtered_report() {
    let dir = tempfile::tempdir().unwrap();
    let build_info = dir.path().join("build-info");
    std::fs::create_dir_all(&build_info).unwrap();
    std::fs::write(
        build_info.join("counter.json"),
        serde_json::to_vec(&fixture_build_info()).unwrap(),
    )
    .unwrap();

    let mut sources = Sources::new();
    sources.crawl(&DiskArtifacts::load(dir.path()).unwrap()).unwrap();
    let coverage = Coverage::new(sources);

    // One `increment()` transaction against the deployed contract.
    let counter = address!("00000000000000000000000000000000000000c0");
    let struct_logs: Vec<Value> = [(0, "JUMPDEST"), (1, "PUSH1"), (3, "PUSH1"), (5, "SLOAD"), (6, "ADD"), (7, "PUSH1"), (9, "SSTORE")]
        .iter()
        .map(|&(pc, op)| json!({ "pc": pc, "op": op, "depth": 1, "stack": [] }))
        .collect();
    let provider: Arc<dyn RpcProvider> = Arc::new(MockProvider {
        responses: [
            ("eth_getTransactionByHash".to_string(), json!({ "to": counter, "input": "0x" })),
            ("debug_traceTransaction".to_string(), json!({ "structLogs": struct_logs })),
            ("eth_getCode".to_string(), json!(format!("0x{DEPLOYED}"))),
        ]
        .into(),
    });

    let reporter = Arc::new(Mutex::new(TraceReporter::new(provider, coverage)));
    reporter.lock().await.trace_and_report(B256::repeat_byte(7)).await.unwrap();

    let filtered = reporter.lock().await.filtered_report();
    let stats = &filtered.0["Counter.sol"];

    // The JUMPDEST credits the function exactly once.
    assert_eq!(stats.fn_map[&0].name, "increment");
    assert_eq!(stats.f[&0], 1);

    // The assignment line was executed; several opcodes map to it.
    let assignment_line = 5;
    assert!(stats.l[&assignment_line] >= 1);

    // Statement counters: the assignment statement was hit by multiple
    // opcodes, with no per-opcode dedup.
    let hits: u64 = stats.s.values().sum();
    assert!(hits >= 4, "expected several statement hits, got {hits}");

    // No branches in this contract.
    assert!(stats.branch_map.is_empty());

    // Only significant lines survive the filter: the contract header and
    // blank/brace lines are gone, while the (unexecuted parts of the)
    // state variable declaration stay as uncovered statements.
    assert!(!stats.l.contains_key(&1));
    assert!(!stats.l.contains_key(&3));
    assert!(!stats.l.contains_key(&7));
    assert_eq!(stats.l[&2], 0, "the declaration line was never executed");

    // Tracing the same transaction again doubles the counters.
    reporter.lock().await.trace_and_report(B256::repeat_byte(7)).await.unwrap();
    let doubled = reporter.lock().await.filtered_report();
    assert_eq!(doubled.0["Counter.sol"].f[&0], 2);
}
