//! Ethereum JSON-RPC implementation of [`ChainClient`].
//!
//! Four read methods are used: `eth_blockNumber`, `eth_getLogs`,
//! `eth_getBlockByNumber` and `eth_call`. Event topics and function
//! selectors are derived from their ABI signatures at construction time, so
//! there are no hand-copied hash constants to rot.
//!
//! No internal retry: a failed request surfaces as [`ChainError`] and the
//! watcher's next poll cycle tries again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use revpool_core::{keccak256, ChainEventKind, EventPointer};

use crate::chain::{ChainClient, ChainError, OnChainConfig, RawChainEvent};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON-RPC chain client bound to one token + community contract pair.
pub struct JsonRpcChainClient {
    client: reqwest::Client,
    url: String,
    token_address: Address,
    community_address: Address,
    request_id: AtomicU64,

    transfer_topic: B256,
    admin_fee_topic: B256,
    block_created_topic: B256,
}

impl JsonRpcChainClient {
    pub fn new(
        url: impl Into<String>,
        token_address: Address,
        community_address: Address,
    ) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(|e| ChainError::Rpc(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            token_address,
            community_address,
            request_id: AtomicU64::new(1),
            transfer_topic: keccak256(b"Transfer(address,address,uint256)"),
            admin_fee_topic: keccak256(b"AdminFeeChanged(uint256)"),
            block_created_topic: keccak256(b"BlockCreated(uint256,bytes32,string)"),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChainError::Rpc(format!("{method}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChainError::Rpc(format!("{method}: http {status}")));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ChainError::Decode(format!("{method}: {e}")))?;
        if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
            return Err(ChainError::Rpc(format!("{method}: {error}")));
        }
        payload
            .get("result")
            .cloned()
            .ok_or_else(|| ChainError::Decode(format!("{method}: missing result")))
    }

    async fn get_logs(&self, filter: Value) -> Result<Vec<Value>, ChainError> {
        let result = self.call("eth_getLogs", json!([filter])).await?;
        result
            .as_array()
            .cloned()
            .ok_or_else(|| ChainError::Decode("eth_getLogs: result is not an array".into()))
    }

    /// `eth_call` of a no-argument view function, returning the raw word(s).
    async fn call_view(&self, signature: &str) -> Result<Vec<u8>, ChainError> {
        let digest = keccak256(signature.as_bytes());
        let selector = &digest.as_slice()[..4];
        let result = self
            .call(
                "eth_call",
                json!([{
                    "to": format!("0x{}", hex::encode(self.community_address.as_slice())),
                    "data": format!("0x{}", hex::encode(selector)),
                }, "latest"]),
            )
            .await?;
        let data = result
            .as_str()
            .ok_or_else(|| ChainError::Decode(format!("{signature}: non-string result")))?;
        decode_hex(data).map_err(|e| ChainError::Decode(format!("{signature}: {e}")))
    }

    fn decode_log(&self, log: &Value) -> Result<Option<RawChainEvent>, ChainError> {
        if log.get("removed").and_then(Value::as_bool).unwrap_or(false) {
            // Range queries should never hand back removed logs; drop and
            // let reconciliation catch any gap.
            warn!("removed log in eth_getLogs response dropped");
            return Ok(None);
        }

        let pointer = EventPointer {
            block_number: hex_quantity(log, "blockNumber")?,
            tx_index: hex_quantity(log, "transactionIndex")?,
            log_index: hex_quantity(log, "logIndex")?,
        };
        let topics: Vec<B256> = log
            .get("topics")
            .and_then(Value::as_array)
            .map(|ts| {
                ts.iter()
                    .filter_map(Value::as_str)
                    .filter_map(|t| decode_hex(t).ok())
                    .filter(|b| b.len() == 32)
                    .map(|b| {
                        let mut word = [0u8; 32];
                        word.copy_from_slice(&b);
                        B256::from(word)
                    })
                    .collect()
            })
            .unwrap_or_default();
        let topic0 = match topics.first() {
            Some(t) => *t,
            None => return Ok(None),
        };
        let data = decode_hex(log.get("data").and_then(Value::as_str).unwrap_or("0x"))
            .map_err(|e| ChainError::Decode(format!("log data: {e}")))?;

        let kind = if topic0 == self.transfer_topic {
            let from = topics
                .get(1)
                .map(topic_address)
                .ok_or_else(|| ChainError::Decode("Transfer without from topic".into()))?;
            ChainEventKind::RevenueReceived {
                from,
                amount: word_u256(&data, 0)
                    .ok_or_else(|| ChainError::Decode("Transfer without amount".into()))?,
            }
        } else if topic0 == self.admin_fee_topic {
            ChainEventKind::AdminFeeChanged {
                fee: word_u256(&data, 0)
                    .ok_or_else(|| ChainError::Decode("AdminFeeChanged without fee".into()))?,
            }
        } else if topic0 == self.block_created_topic {
            let block_number = word_u256(&data, 0)
                .ok_or_else(|| ChainError::Decode("BlockCreated without number".into()))?;
            let root = word_b256(&data, 1)
                .ok_or_else(|| ChainError::Decode("BlockCreated without root".into()))?;
            ChainEventKind::BlockCreated {
                block_number: u256_to_u64(block_number)
                    .ok_or_else(|| ChainError::Decode("BlockCreated number overflow".into()))?,
                root_hash: root,
                ipfs_hash: dynamic_string(&data, 2).unwrap_or_default(),
            }
        } else {
            debug!(topic = %topic0, "unrecognized log topic skipped");
            return Ok(None);
        };

        Ok(Some(RawChainEvent { pointer, kind }))
    }
}

#[async_trait]
impl ChainClient for JsonRpcChainClient {
    async fn head_block(&self) -> Result<u64, ChainError> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        let hex = result
            .as_str()
            .ok_or_else(|| ChainError::Decode("eth_blockNumber: non-string".into()))?;
        parse_quantity(hex).map_err(ChainError::Decode)
    }

    async fn fetch_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawChainEvent>, ChainError> {
        let from = format!("0x{from_block:x}");
        let to = format!("0x{to_block:x}");

        // Revenue: token transfers whose `to` topic is the community vault.
        let vault_topic = format!(
            "0x{:0>64}",
            hex::encode(self.community_address.as_slice())
        );
        let transfer_logs = self
            .get_logs(json!({
                "address": format!("0x{}", hex::encode(self.token_address.as_slice())),
                "fromBlock": from,
                "toBlock": to,
                "topics": [format!("{}", self.transfer_topic), Value::Null, vault_topic],
            }))
            .await?;

        // Admin-fee changes and committed-block markers on the community
        // contract itself.
        let community_logs = self
            .get_logs(json!({
                "address": format!("0x{}", hex::encode(self.community_address.as_slice())),
                "fromBlock": from,
                "toBlock": to,
                "topics": [[
                    format!("{}", self.admin_fee_topic),
                    format!("{}", self.block_created_topic),
                ]],
            }))
            .await?;

        let mut events = Vec::with_capacity(transfer_logs.len() + community_logs.len());
        for log in transfer_logs.iter().chain(community_logs.iter()) {
            if let Some(event) = self.decode_log(log)? {
                events.push(event);
            }
        }
        events.sort_by_key(|e| e.pointer);
        Ok(events)
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64, ChainError> {
        let result = self
            .call(
                "eth_getBlockByNumber",
                json!([format!("0x{block_number:x}"), false]),
            )
            .await?;
        if result.is_null() {
            return Err(ChainError::BlockNotFound(block_number));
        }
        let seconds = hex_quantity(&result, "timestamp")?;
        Ok(seconds * 1000)
    }

    async fn on_chain_config(&self) -> Result<OnChainConfig, ChainError> {
        let token = self.call_view("token()").await?;
        let admin = self.call_view("owner()").await?;
        let freeze = self.call_view("blockFreezePeriodSeconds()").await?;
        let fee = self.call_view("adminFee()").await?;

        Ok(OnChainConfig {
            token_address: word_address(&token)
                .ok_or_else(|| ChainError::Decode("token(): short word".into()))?,
            admin_address: word_address(&admin)
                .ok_or_else(|| ChainError::Decode("owner(): short word".into()))?,
            block_freeze_seconds: word_u256(&freeze, 0)
                .and_then(u256_to_u64)
                .ok_or_else(|| ChainError::Decode("blockFreezePeriodSeconds(): bad word".into()))?,
            admin_fee: word_u256(&fee, 0)
                .ok_or_else(|| ChainError::Decode("adminFee(): bad word".into()))?,
        })
    }
}

// ── ABI word helpers ─────────────────────────────────────────────────────

fn decode_hex(input: &str) -> Result<Vec<u8>, String> {
    let stripped = input.strip_prefix("0x").unwrap_or(input);
    hex::decode(stripped).map_err(|e| e.to_string())
}

fn parse_quantity(input: &str) -> Result<u64, String> {
    let stripped = input.strip_prefix("0x").unwrap_or(input);
    u64::from_str_radix(stripped, 16).map_err(|e| format!("bad quantity {input:?}: {e}"))
}

fn hex_quantity(object: &Value, field: &str) -> Result<u64, ChainError> {
    object
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ChainError::Decode(format!("missing field {field}")))
        .and_then(|s| parse_quantity(s).map_err(ChainError::Decode))
}

fn word_u256(data: &[u8], word: usize) -> Option<U256> {
    let start = word * 32;
    let slice = data.get(start..start + 32)?;
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(slice);
    Some(U256::from_be_bytes(bytes))
}

fn word_b256(data: &[u8], word: usize) -> Option<B256> {
    let start = word * 32;
    let slice = data.get(start..start + 32)?;
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(slice);
    Some(B256::from(bytes))
}

fn word_address(data: &[u8]) -> Option<Address> {
    let slice = data.get(..32)?;
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&slice[12..32]);
    Some(Address::from(bytes))
}

fn topic_address(topic: &B256) -> Address {
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&topic.as_slice()[12..32]);
    Address::from(bytes)
}

fn u256_to_u64(value: U256) -> Option<u64> {
    if value > U256::from(u64::MAX) {
        None
    } else {
        Some(value.to::<u64>())
    }
}

/// Decode an ABI `string` whose offset lives at `word`; tolerant of
/// malformed tails (returns `None` rather than failing the whole log).
fn dynamic_string(data: &[u8], word: usize) -> Option<String> {
    let offset = word_u256(data, word)?;
    let offset = u256_to_u64(offset)? as usize;
    let length = word_u256_at(data, offset)?;
    let length = u256_to_u64(length)? as usize;
    let bytes = data.get(offset + 32..offset + 32 + length)?;
    String::from_utf8(bytes.to_vec()).ok()
}

fn word_u256_at(data: &[u8], offset: usize) -> Option<U256> {
    let slice = data.get(offset..offset + 32)?;
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(slice);
    Some(U256::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> JsonRpcChainClient {
        JsonRpcChainClient::new(
            "http://127.0.0.1:8545",
            Address::from([0x11u8; 20]),
            Address::from([0x22u8; 20]),
        )
        .unwrap()
    }

    fn log(topics: Vec<String>, data: String) -> Value {
        json!({
            "blockNumber": "0x10",
            "transactionIndex": "0x2",
            "logIndex": "0x5",
            "topics": topics,
            "data": data,
        })
    }

    #[test]
    fn decodes_transfer_log() {
        let c = client();
        let from = format!("0x{:0>64}", hex::encode([0xAAu8; 20]));
        let to = format!("0x{:0>64}", hex::encode([0x22u8; 20]));
        let amount = format!("0x{:064x}", 1000u64);

        let event = c
            .decode_log(&log(
                vec![format!("{}", c.transfer_topic), from, to],
                amount,
            ))
            .unwrap()
            .unwrap();

        assert_eq!(
            event.pointer,
            EventPointer { block_number: 0x10, tx_index: 2, log_index: 5 }
        );
        match event.kind {
            ChainEventKind::RevenueReceived { from, amount } => {
                assert_eq!(from, Address::from([0xAAu8; 20]));
                assert_eq!(amount, U256::from(1000u64));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn decodes_admin_fee_log() {
        let c = client();
        let fee = format!("0x{:064x}", 200_000_000_000_000_000u64);
        let event = c
            .decode_log(&log(vec![format!("{}", c.admin_fee_topic)], fee))
            .unwrap()
            .unwrap();
        assert!(matches!(
            event.kind,
            ChainEventKind::AdminFeeChanged { fee } if fee == U256::from(200_000_000_000_000_000u64)
        ));
    }

    #[test]
    fn decodes_block_created_log_with_ipfs_hash() {
        let c = client();
        let root = [0x7Bu8; 32];
        let ipfs = b"QmTest";
        // word0 = blockNumber, word1 = root, word2 = offset (0x60),
        // then length + padded bytes.
        let mut data = Vec::new();
        data.extend_from_slice(&U256::from(42u64).to_be_bytes::<32>());
        data.extend_from_slice(&root);
        data.extend_from_slice(&U256::from(0x60u64).to_be_bytes::<32>());
        data.extend_from_slice(&U256::from(ipfs.len() as u64).to_be_bytes::<32>());
        let mut padded = ipfs.to_vec();
        padded.resize(32, 0);
        data.extend_from_slice(&padded);

        let event = c
            .decode_log(&log(
                vec![format!("{}", c.block_created_topic)],
                format!("0x{}", hex::encode(&data)),
            ))
            .unwrap()
            .unwrap();
        match event.kind {
            ChainEventKind::BlockCreated { block_number, root_hash, ipfs_hash } => {
                assert_eq!(block_number, 42);
                assert_eq!(root_hash, B256::from(root));
                assert_eq!(ipfs_hash, "QmTest");
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn removed_and_foreign_logs_are_skipped() {
        let c = client();
        let mut removed = log(vec![format!("{}", c.admin_fee_topic)], format!("0x{:064x}", 1u64));
        removed["removed"] = json!(true);
        assert!(c.decode_log(&removed).unwrap().is_none());

        let foreign = log(
            vec![format!("{}", keccak256(b"Approval(address,address,uint256)"))],
            format!("0x{:064x}", 1u64),
        );
        assert!(c.decode_log(&foreign).unwrap().is_none());
    }

    #[test]
    fn quantity_parsing() {
        assert_eq!(parse_quantity("0x10").unwrap(), 16);
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert!(parse_quantity("0xzz").is_err());
    }
}
