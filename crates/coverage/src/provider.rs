//! The JSON-RPC seam.
//!
//! Everything that talks to a node goes through [`RpcProvider`], so the
//! trace reconstructor and the interceptor can be exercised against an
//! in-memory provider in tests.

use alloy_transport::{TransportError, TransportErrorKind};
use async_trait::async_trait;
use serde_json::Value;
use url::Url;

/// A minimal dynamic JSON-RPC provider.
#[async_trait]
pub trait RpcProvider: Send + Sync {
    /// Performs a single request, returning the raw `result` value.
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError>;
}

impl std::fmt::Debug for dyn RpcProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RpcProvider")
    }
}

/// Deserializes a provider response into `T`, mapping failures onto the
/// transport error domain.
pub fn parse_response<T: serde::de::DeserializeOwned>(
    method: &str,
    value: Value,
) -> Result<T, TransportError> {
    serde_json::from_value(value)
        .map_err(|e| TransportErrorKind::custom_str(&format!("malformed {method} response: {e}")))
}

/// An [`RpcProvider`] over HTTP.
#[derive(Clone, Debug)]
pub struct HttpProvider {
    client: alloy_rpc_client::RpcClient,
}

impl HttpProvider {
    pub fn new(url: Url) -> Self {
        Self { client: alloy_rpc_client::ClientBuilder::default().http(url) }
    }
}

#[async_trait]
impl RpcProvider for HttpProvider {
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        self.client.request(method.to_string(), params).await
    }
}
