use crate::{
    chain::{
        ChainReader,
        ForfeitLog,
        encode_call,
        u64_word,
    },
    events::{
        FORFEITED,
        LogEvent,
        topic,
        word_to_u64,
    },
    room::words_from_bytes,
};
use alloy_primitives::{
    Address,
    B256,
};
use anyhow::{
    Context,
    anyhow,
};
use reqwest::StatusCode;
use serde::{
    Deserialize,
    de::DeserializeOwned,
};
use serde_json::{
    Value,
    json,
};
use std::{
    fmt,
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
};
use url::Url;

#[derive(Debug)]
pub enum RpcError {
    Status { status: StatusCode, body: String },
    Rpc { code: i64, message: String },
}

impl RpcError {
    pub fn is_rate_limited(&self) -> bool {
        match self {
            RpcError::Status { status, .. } => *status == StatusCode::TOO_MANY_REQUESTS,
            RpcError::Rpc { code, .. } => *code == 429,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Status { status, body } => {
                write!(f, "rpc endpoint responded with {status}: {body}")
            }
            RpcError::Rpc { code, message } => write!(f, "rpc error {code}: {message}"),
        }
    }
}

impl std::error::Error for RpcError {}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorDto>,
}

#[derive(Deserialize)]
struct RpcErrorDto {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogDto {
    topics: Vec<B256>,
    data: String,
    block_number: Option<String>,
}

/// Read-only view of the room contract over a JSON-RPC HTTP endpoint.
pub struct JsonRpcChain {
    url: Url,
    contract: Address,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl JsonRpcChain {
    pub fn new(url: Url, contract: Address) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client for rpc endpoint")?;
        Ok(Self {
            url,
            contract,
            http,
            next_id: AtomicU64::new(1),
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> crate::Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let res = self
            .http
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?;
        let status = res.status();
        let bytes = res
            .bytes()
            .await
            .with_context(|| format!("failed to read {method} response body"))?;
        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes).into_owned();
            return Err(RpcError::Status { status, body }.into());
        }
        let envelope: RpcResponse<T> = serde_json::from_slice(&bytes)
            .with_context(|| format!("invalid {method} response payload"))?;
        if let Some(error) = envelope.error {
            return Err(RpcError::Rpc {
                code: error.code,
                message: error.message,
            }
            .into());
        }
        envelope
            .result
            .ok_or_else(|| anyhow!("{method} response carried no result"))
    }

    async fn eth_call(&self, data: Vec<u8>) -> crate::Result<Vec<u8>> {
        let params = json!([
            { "to": self.contract, "data": format!("0x{}", hex::encode(data)) },
            "latest"
        ]);
        let raw: String = self.request("eth_call", params).await?;
        decode_hex(&raw)
    }

    async fn get_logs(
        &self,
        topics: Vec<Option<B256>>,
        from_block: u64,
        to_block: u64,
    ) -> crate::Result<Vec<LogDto>> {
        let params = json!([{
            "address": self.contract,
            "fromBlock": format!("{from_block:#x}"),
            "toBlock": format!("{to_block:#x}"),
            "topics": topics,
        }]);
        self.request("eth_getLogs", params).await
    }
}

impl ChainReader for JsonRpcChain {
    async fn next_room_id(&self) -> crate::Result<u64> {
        let data = self.eth_call(encode_call("nextRoomId()", &[])).await?;
        let words = words_from_bytes(&data).context("decode nextRoomId() result")?;
        let word = words
            .first()
            .ok_or_else(|| anyhow!("nextRoomId() returned no data"))?;
        word_to_u64(word).ok_or_else(|| anyhow!("nextRoomId() does not fit in u64"))
    }

    async fn room_words(&self, room_id: u64) -> crate::Result<Vec<B256>> {
        let data = self
            .eth_call(encode_call("rooms(uint256)", &[u64_word(room_id)]))
            .await?;
        Ok(words_from_bytes(&data)?)
    }

    async fn block_number(&self) -> crate::Result<u64> {
        let raw: String = self.request("eth_blockNumber", json!([])).await?;
        parse_quantity(&raw)
    }

    async fn forfeit_logs(
        &self,
        room_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> crate::Result<Vec<ForfeitLog>> {
        let topics = vec![Some(topic(FORFEITED)), Some(u64_word(room_id))];
        let logs = self.get_logs(topics, from_block, to_block).await?;
        let mut found = Vec::new();
        for log in logs {
            let data = decode_hex(&log.data)?;
            let block_number = match &log.block_number {
                Some(raw) => parse_quantity(raw)?,
                None => continue,
            };
            if let Some(LogEvent::Forfeited { room_id, record }) =
                LogEvent::decode(&log.topics, &data)
            {
                found.push(ForfeitLog {
                    block_number,
                    room_id,
                    record,
                });
            }
        }
        found.sort_by_key(|log| log.block_number);
        Ok(found)
    }

    async fn contract_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> crate::Result<Vec<LogEvent>> {
        let logs = self.get_logs(Vec::new(), from_block, to_block).await?;
        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            let data = decode_hex(&log.data)?;
            if let Some(event) = LogEvent::decode(&log.topics, &data) {
                events.push(event);
            }
        }
        Ok(events)
    }
}

fn decode_hex(raw: &str) -> crate::Result<Vec<u8>> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    hex::decode(digits).with_context(|| format!("invalid hex payload {raw}"))
}

fn parse_quantity(raw: &str) -> crate::Result<u64> {
    let digits = raw
        .strip_prefix("0x")
        .ok_or_else(|| anyhow!("quantity {raw} lacks 0x prefix"))?;
    u64::from_str_radix(digits, 16).with_context(|| format!("invalid quantity {raw}"))
}
