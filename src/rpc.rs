// src/rpc.rs
use async_trait::async_trait;
use eyre::{eyre, Result};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,

    #[serde(rename = "blockNumber", default, skip_serializing_if = "Option::is_none")]
    pub block_number_hex: Option<String>,

    #[serde(rename = "transactionHash")]
    pub tx_hash: String,

    #[serde(rename = "logIndex", default, skip_serializing_if = "Option::is_none")]
    pub log_index_hex: Option<String>,
}

impl Log {
    pub fn block_number(&self) -> Option<u64> {
        self.block_number_hex.as_deref().and_then(parse_hex_u64)
    }

    pub fn log_index(&self) -> Option<u64> {
        self.log_index_hex.as_deref().and_then(parse_hex_u64)
    }
}

pub fn parse_hex_u64(s: &str) -> Option<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    timestamp: String,
}

/// ERC20 Transfer event topic keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// `eth_getLogs` filter. `None` topic slots match anything.
#[derive(Debug, Clone, PartialEq)]
pub struct LogFilter {
    pub address: String,
    pub from_block: u64,
    pub to_block: u64,
    pub topics: Vec<Option<String>>,
}

impl LogFilter {
    fn to_params(&self) -> Value {
        let mut filter = json!({
            "fromBlock": format!("0x{:x}", self.from_block),
            "toBlock": format!("0x{:x}", self.to_block),
            "address": self.address,
        });
        if !self.topics.is_empty() {
            filter["topics"] = json!(self.topics);
        }
        json!([filter])
    }
}

/// Read access to the chain deposits arrive on.
#[async_trait]
pub trait SourceChain: Send + Sync {
    async fn block_number(&self) -> Result<u64>;
    async fn logs(&self, filter: &LogFilter) -> Result<Vec<Log>>;
    /// Unix timestamp (seconds) of the given block.
    async fn block_timestamp(&self, block_number: u64) -> Result<u64>;
}

/// Plain HTTP JSON-RPC client with a per-call timeout and transport retries.
#[derive(Clone)]
pub struct RpcClient {
    client: Client,
    url: String,
    retries: u32,
    retry_pause: Duration,
}

impl RpcClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            retries: 3,
            retry_pause: Duration::from_secs(2),
        })
    }

    #[cfg(test)]
    fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        for attempt in 1..=self.retries {
            debug!("Sending {} → {}", method, self.url);

            match self.client.post(&self.url).json(&payload).send().await {
                Ok(resp) => {
                    if resp.status() != StatusCode::OK {
                        return Err(eyre!("RPC error: HTTP {} on {}", resp.status(), method));
                    }
                    let parsed: RpcResponse<T> = resp.json().await?;
                    if let Some(err) = parsed.error {
                        return Err(eyre!("{} failed: [{}] {}", method, err.code, err.message));
                    }
                    return parsed
                        .result
                        .ok_or_else(|| eyre!("{} returned no result", method));
                }
                Err(e) if attempt < self.retries => {
                    warn!(
                        "RPC request {} failed (attempt {}): {}. Retrying...",
                        method, attempt, e
                    );
                    tokio::time::sleep(self.retry_pause).await;
                }
                Err(e) => {
                    return Err(eyre!(
                        "RPC request {} failed after {} attempts: {}",
                        method,
                        self.retries,
                        e
                    ))
                }
            }
        }

        Err(eyre!("Unreachable: retries exhausted"))
    }
}

#[async_trait]
impl SourceChain for RpcClient {
    async fn block_number(&self) -> Result<u64> {
        let hex: String = self.call("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&hex).ok_or_else(|| eyre!("malformed block number: {}", hex))
    }

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<Log>> {
        debug!(
            "eth_getLogs range {} → {} on {}",
            filter.from_block, filter.to_block, filter.address
        );
        self.call("eth_getLogs", filter.to_params()).await
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64> {
        // a null result means the node doesn't know the block yet
        let block: BlockHeader = self
            .call(
                "eth_getBlockByNumber",
                json!([format!("0x{:x}", block_number), false]),
            )
            .await?;
        parse_hex_u64(&block.timestamp)
            .ok_or_else(|| eyre!("malformed timestamp for block {}", block_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> RpcClient {
        RpcClient::new(&server.uri(), Duration::from_secs(5))
            .unwrap()
            .with_retry_pause(Duration::from_millis(10))
    }

    #[test]
    fn transfer_topic_is_keccak_of_signature() {
        let hash = alloy::primitives::keccak256("Transfer(address,address,uint256)");
        assert_eq!(format!("{:#x}", hash), TRANSFER_TOPIC);
    }

    #[test]
    fn filter_serializes_null_topic_slots() {
        let filter = LogFilter {
            address: "0xabc".to_string(),
            from_block: 16,
            to_block: 255,
            topics: vec![Some(TRANSFER_TOPIC.to_string()), None, Some("0x01".to_string())],
        };
        let params = filter.to_params();
        assert_eq!(params[0]["fromBlock"], "0x10");
        assert_eq!(params[0]["toBlock"], "0xff");
        assert_eq!(params[0]["topics"][1], Value::Null);
        assert_eq!(params[0]["topics"][2], "0x01");
    }

    #[tokio::test]
    async fn reads_block_number() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_blockNumber" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1, "result": "0x6ebbb36"
            })))
            .mount(&server)
            .await;

        assert_eq!(client(&server).block_number().await.unwrap(), 0x6ebbb36);
    }

    #[tokio::test]
    async fn reads_block_timestamp() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_getBlockByNumber" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "result": { "number": "0x10", "timestamp": "0x65f1e400" }
            })))
            .mount(&server)
            .await;

        assert_eq!(client(&server).block_timestamp(16).await.unwrap(), 0x65f1e400);
    }

    #[tokio::test]
    async fn surfaces_json_rpc_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "error": { "code": -32005, "message": "query returned more than 10000 results" }
            })))
            .mount(&server)
            .await;

        let filter = LogFilter {
            address: "0xabc".to_string(),
            from_block: 1,
            to_block: 2,
            topics: vec![],
        };
        let err = client(&server).logs(&filter).await.unwrap_err();
        assert!(err.to_string().contains("-32005"));
    }

    #[tokio::test]
    async fn parses_logs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_getLogs" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "result": [{
                    "address": "0x0b2c639c533813f4aa9d7837caf62653d097ff85",
                    "topics": [TRANSFER_TOPIC],
                    "data": "0x00000000000000000000000000000000000000000000000000000000000f4240",
                    "blockNumber": "0x10",
                    "transactionHash": "0xaa",
                    "logIndex": "0x2",
                    "removed": false
                }]
            })))
            .mount(&server)
            .await;

        let filter = LogFilter {
            address: "0x0b2c639c533813f4aa9d7837caf62653d097ff85".to_string(),
            from_block: 1,
            to_block: 20,
            topics: vec![Some(TRANSFER_TOPIC.to_string())],
        };
        let logs = client(&server).logs(&filter).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_number(), Some(16));
        assert_eq!(logs[0].log_index(), Some(2));
    }

    #[tokio::test]
    async fn gives_up_on_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        assert!(client(&server).block_number().await.is_err());
    }
}
