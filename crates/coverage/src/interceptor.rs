//! Provider interception.
//!
//! [`CoverInterceptor`] wraps a JSON-RPC provider and produces coverage as
//! a side effect of the wrapped traffic: sent transactions are traced once
//! mined, and `eth_call`s are replayed as throwaway transactions inside a
//! snapshot/revert bracket so view functions show up in the report too.

use crate::{
    coverage::Coverage, provider::parse_response, report::Report, trace::Trace, CoverageError,
    RpcProvider,
};
use alloy_primitives::B256;
use alloy_transport::TransportError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Couples a provider with a [`Coverage`] and an accumulating [`Report`].
#[derive(Debug)]
pub struct TraceReporter {
    provider: Arc<dyn RpcProvider>,
    coverage: Coverage,
    report: Report,
}

impl TraceReporter {
    pub fn new(provider: Arc<dyn RpcProvider>, coverage: Coverage) -> Self {
        let report = coverage.fresh_report();
        Self { provider, coverage, report }
    }

    /// Traces one transaction and rolls it into the report.
    ///
    /// The address -> bytecode map stays consistent even on failure: codes
    /// are loaded before any counter is touched, and counters only grow.
    pub async fn trace_and_report(&mut self, tx_hash: B256) -> Result<(), CoverageError> {
        let trace =
            Trace::crawl(&*self.provider, tx_hash, self.coverage.sources_mut()).await?;
        self.coverage.report(&trace.logs, &mut self.report)
    }

    /// The accumulated raw report.
    pub fn report(&self) -> &Report {
        &self.report
    }

    /// The accumulated report, filtered for output.
    pub fn filtered_report(&self) -> Report {
        self.coverage.filtered_report(&self.report)
    }
}

/// An [`RpcProvider`] that forwards everything, tracing transactions and
/// replayed calls through a shared [`TraceReporter`].
#[derive(Clone, Debug)]
pub struct CoverInterceptor {
    inner: Arc<dyn RpcProvider>,
    reporter: Arc<Mutex<TraceReporter>>,
}

impl CoverInterceptor {
    pub fn new(inner: Arc<dyn RpcProvider>, reporter: Arc<Mutex<TraceReporter>>) -> Self {
        Self { inner, reporter }
    }

    async fn trace_tolerantly(&self, tx_hash: B256) {
        if let Err(err) = self.reporter.lock().await.trace_and_report(tx_hash).await {
            warn!(%tx_hash, %err, "could not trace transaction");
        }
    }

    /// Forward the transaction, then trace it unless it is still pending.
    async fn intercept_send_transaction(&self, params: Value) -> Result<Value, TransportError> {
        let result = self.inner.request("eth_sendTransaction", params).await?;

        match self.inner.request("eth_getBlockByNumber", json!(["pending", false])).await {
            Ok(pending) => {
                let none_pending = pending
                    .get("transactions")
                    .and_then(Value::as_array)
                    .is_some_and(Vec::is_empty);
                if none_pending {
                    if let Ok(tx_hash) = parse_response::<B256>("eth_sendTransaction", result.clone())
                    {
                        self.trace_tolerantly(tx_hash).await;
                    }
                }
            }
            Err(err) => warn!(%err, "could not inspect the pending block"),
        }

        Ok(result)
    }

    /// Forward the call, then replay it as a transaction inside a
    /// snapshot/revert bracket so its execution gets a trace.
    ///
    /// The returned result is the one captured *before* the replay; a node
    /// that orders state updates differently from an isolated call could in
    /// principle diverge here.
    async fn intercept_call(&self, params: Value) -> Result<Value, TransportError> {
        let result = self.inner.request("eth_call", params.clone()).await?;

        let call = params.get(0).cloned().unwrap_or(Value::Null);
        if let Err(err) = self.replay_in_snapshot(call).await {
            warn!(%err, "could not replay call for coverage");
        }

        Ok(result)
    }

    async fn replay_in_snapshot(&self, call: Value) -> Result<(), TransportError> {
        let snapshot = self.inner.request("evm_snapshot", json!([])).await?;

        let sent = self.inner.request("eth_sendTransaction", json!([call])).await;
        if let Ok(sent) = sent {
            if let Ok(tx_hash) = parse_response::<B256>("eth_sendTransaction", sent) {
                self.trace_tolerantly(tx_hash).await;
            }
        }

        // The bracket must close even when the replay failed.
        self.inner.request("evm_revert", json!([snapshot])).await?;
        Ok(())
    }
}

#[async_trait]
impl RpcProvider for CoverInterceptor {
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        match method {
            "eth_sendTransaction" => self.intercept_send_transaction(params).await,
            "eth_call" => self.intercept_call(params).await,
            _ => self.inner.request(method, params).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sources::Sources, trace::tests::MockProvider};
    use alloy_primitives::address;

    fn reporter(provider: &Arc<dyn RpcProvider>) -> Arc<Mutex<TraceReporter>> {
        Arc::new(Mutex::new(TraceReporter::new(provider.clone(), Coverage::new(Sources::new()))))
    }

    fn traceable(provider: MockProvider) -> MockProvider {
        let to = address!("00000000000000000000000000000000000000aa");
        provider
            .respond("eth_getTransactionByHash", json!({ "to": to, "input": "0x" }))
            .respond(
                "debug_traceTransaction",
                json!({ "structLogs": [{ "pc": 0, "op": "STOP", "depth": 1, "stack": [] }] }),
            )
            .respond("eth_getCode", json!("0x00"))
    }

    #[tokio::test]
    async fn passes_unrelated_methods_through() {
        let provider: Arc<dyn RpcProvider> =
            Arc::new(MockProvider::default().respond("eth_chainId", json!("0x1")));
        let interceptor = CoverInterceptor::new(provider.clone(), reporter(&provider));
        let result = interceptor.request("eth_chainId", json!([])).await.unwrap();
        assert_eq!(result, json!("0x1"));
    }

    #[tokio::test]
    async fn send_transaction_traces_when_nothing_is_pending() {
        let mock = traceable(MockProvider::default())
            .respond("eth_sendTransaction", json!(B256::repeat_byte(1)))
            .respond("eth_getBlockByNumber", json!({ "transactions": [] }));
        let provider: Arc<dyn RpcProvider> = Arc::new(mock);
        let interceptor = CoverInterceptor::new(provider.clone(), reporter(&provider));

        let result = interceptor.request("eth_sendTransaction", json!([{}])).await.unwrap();
        assert_eq!(result, json!(B256::repeat_byte(1)));
    }

    #[tokio::test]
    async fn send_transaction_skips_tracing_while_txs_are_pending() {
        let mock = MockProvider::default()
            .respond("eth_sendTransaction", json!(B256::repeat_byte(1)))
            .respond("eth_getBlockByNumber", json!({ "transactions": ["0xdead"] }));
        let provider: Arc<dyn RpcProvider> = Arc::new(mock);
        let interceptor = CoverInterceptor::new(provider.clone(), reporter(&provider));

        interceptor.request("eth_sendTransaction", json!([{}])).await.unwrap();
        // No trace was attempted: the mock has no debug_traceTransaction
        // canned response, and nothing failed.
    }

    #[tokio::test]
    async fn call_returns_original_result_and_brackets_the_replay() {
        let mock = traceable(MockProvider::default())
            .respond("eth_call", json!("0xcafe"))
            .respond("evm_snapshot", json!("0x7"))
            .respond("eth_sendTransaction", json!(B256::repeat_byte(2)))
            .respond("evm_revert", json!(true));
        let provider: Arc<dyn RpcProvider> = Arc::new(mock);
        let interceptor = CoverInterceptor::new(provider.clone(), reporter(&provider));

        let call = json!([{ "to": "0x00000000000000000000000000000000000000aa", "data": "0x" }]);
        let result = interceptor.request("eth_call", call).await.unwrap();
        assert_eq!(result, json!("0xcafe"));
    }
}
