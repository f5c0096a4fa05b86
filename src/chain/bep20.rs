//! BEP-20 USDT gateway over Ethereum JSON-RPC
//!
//! Transfers are submitted with `eth_sendTransaction` from the hot wallet,
//! which the node signs (unlocked account or signer proxy). Status comes
//! from `eth_getTransactionReceipt`, falling back to
//! `eth_getTransactionByHash` to tell "pending" from "unknown".

use super::{BlockchainGateway, ChainError, ChainTxReport, is_evm_address};
use crate::config::ChainConfig;
use crate::money::{from_token_units, to_token_units};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// `transfer(address,uint256)`
const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

/// `balanceOf(address)`
const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

#[derive(Serialize)]
struct JsonRpcRequest<T> {
    jsonrpc: &'static str,
    method: &'static str,
    params: T,
    id: u64,
}

#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Serialize)]
struct CallRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<&'a str>,
    to: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    gas: Option<String>,
    data: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TxReceipt {
    status: Option<String>,
    block_number: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    block_number: Option<String>,
    gas_price: Option<String>,
}

pub struct Bep20Gateway {
    config: ChainConfig,
    client: reqwest::Client,
}

impl Bep20Gateway {
    pub fn new(config: ChainConfig) -> Result<Self, ChainError> {
        info!(
            rpc_url = %config.rpc_url,
            contract = %config.usdt_contract,
            "Initializing BEP-20 gateway"
        );
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ChainError::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    /// `Ok(None)` when the node answers with `result: null`
    async fn rpc_call_optional<T, R>(
        &self,
        method: &'static str,
        params: T,
    ) -> Result<Option<R>, ChainError>
    where
        T: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 1,
        };

        let response = self
            .client
            .post(&self.config.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ChainError::Network(format!("HTTP request failed: {}", e)))?;

        let rpc_response: JsonRpcResponse<R> = response
            .json()
            .await
            .map_err(|e| ChainError::Network(format!("Failed to parse response: {}", e)))?;

        if let Some(error) = rpc_response.error {
            return Err(ChainError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(rpc_response.result)
    }

    async fn rpc_call<T, R>(&self, method: &'static str, params: T) -> Result<R, ChainError>
    where
        T: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        self.rpc_call_optional(method, params)
            .await?
            .ok_or_else(|| ChainError::Parse(format!("No result in {} response", method)))
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        let result: String = self.rpc_call("eth_blockNumber", ()).await?;
        parse_hex_u64(&result)
    }
}

#[async_trait]
impl BlockchainGateway for Bep20Gateway {
    async fn send_payment(&self, to_address: &str, amount: Decimal) -> Result<String, ChainError> {
        let units = to_token_units(amount, self.config.token_decimals)?;
        let call = CallRequest {
            from: Some(&self.config.hot_wallet_address),
            to: &self.config.usdt_contract,
            gas: Some(format!("0x{:x}", self.config.gas_limit)),
            data: transfer_calldata(to_address, units)?,
        };
        let tx_hash: String = self.rpc_call("eth_sendTransaction", [call]).await?;
        info!(to = %to_address, %amount, tx_hash = %tx_hash, "USDT transfer submitted");
        Ok(tx_hash)
    }

    async fn check_transaction_status(&self, tx_hash: &str) -> Result<ChainTxReport, ChainError> {
        let receipt: Option<TxReceipt> = self
            .rpc_call_optional("eth_getTransactionReceipt", [tx_hash])
            .await?;

        if let Some(receipt) = receipt
            && let Some(block_hex) = receipt.block_number
        {
            let block = parse_hex_u64(&block_hex)?;
            return match receipt.status.as_deref() {
                Some("0x1") => {
                    let head = self.block_number().await?;
                    Ok(ChainTxReport::confirmed(
                        block,
                        head.saturating_sub(block) + 1,
                    ))
                }
                _ => Ok(ChainTxReport::failed(block)),
            };
        }

        let tx: Option<RpcTransaction> = self
            .rpc_call_optional("eth_getTransactionByHash", [tx_hash])
            .await?;
        match tx {
            Some(tx) => {
                debug!(tx_hash, block = ?tx.block_number, "Transaction not yet receipted");
                let gas_price = tx.gas_price.as_deref().map(parse_hex_u128).transpose()?;
                Ok(ChainTxReport::pending(gas_price))
            }
            None => Ok(ChainTxReport::unknown()),
        }
    }

    fn validate_wallet_address(&self, address: &str) -> bool {
        is_evm_address(address)
    }

    async fn get_usdt_balance(&self, address: &str) -> Result<Decimal, ChainError> {
        let call = CallRequest {
            from: None,
            to: &self.config.usdt_contract,
            gas: None,
            data: balance_of_calldata(address)?,
        };
        let result: String = self.rpc_call("eth_call", (call, "latest")).await?;
        let units = parse_hex_u128(&result)?;
        Ok(from_token_units(units, self.config.token_decimals)?)
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        let result: String = self.rpc_call("eth_gasPrice", ()).await?;
        parse_hex_u128(&result)
    }
}

// ============================================================================
// ABI encoding
// ============================================================================

fn address_bytes(address: &str) -> Result<[u8; 20], ChainError> {
    if !is_evm_address(address) {
        return Err(ChainError::InvalidAddress(address.to_string()));
    }
    let raw = hex::decode(&address[2..])
        .map_err(|_| ChainError::InvalidAddress(address.to_string()))?;
    let mut out = [0u8; 20];
    out.copy_from_slice(&raw);
    Ok(out)
}

/// `transfer(to, units)` calldata, `0x`-prefixed
pub fn transfer_calldata(to: &str, units: u128) -> Result<String, ChainError> {
    let mut data = Vec::with_capacity(4 + 32 + 32);
    data.extend_from_slice(&TRANSFER_SELECTOR);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(&address_bytes(to)?);
    data.extend_from_slice(&[0u8; 16]);
    data.extend_from_slice(&units.to_be_bytes());
    Ok(format!("0x{}", hex::encode(data)))
}

pub fn balance_of_calldata(owner: &str) -> Result<String, ChainError> {
    let mut data = Vec::with_capacity(4 + 32);
    data.extend_from_slice(&BALANCE_OF_SELECTOR);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(&address_bytes(owner)?);
    Ok(format!("0x{}", hex::encode(data)))
}

fn parse_hex_u128(value: &str) -> Result<u128, ChainError> {
    let digits = value.trim_start_matches("0x").trim_start_matches('0');
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| ChainError::Parse(format!("Invalid hex quantity {}: {}", value, e)))
}

fn parse_hex_u64(value: &str) -> Result<u64, ChainError> {
    u64::try_from(parse_hex_u128(value)?)
        .map_err(|_| ChainError::Parse(format!("Quantity out of range: {}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TO: &str = "0x1111111111111111111111111111111111111111";

    #[test]
    fn test_transfer_calldata_layout() {
        let data = transfer_calldata(TO, 1_000_000_000_000_000_000).unwrap();
        // selector + 2 words
        assert_eq!(data.len(), 2 + 8 + 64 + 64);
        assert!(data.starts_with("0xa9059cbb"));
        assert!(data.contains("1111111111111111111111111111111111111111"));
        assert!(data.ends_with("0de0b6b3a7640000"));
    }

    #[test]
    fn test_transfer_calldata_rejects_bad_address() {
        assert!(matches!(
            transfer_calldata("0x1234", 1),
            Err(ChainError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_balance_of_calldata() {
        let data = balance_of_calldata(TO).unwrap();
        assert!(data.starts_with("0x70a08231"));
        assert_eq!(data.len(), 2 + 8 + 64);
    }

    #[test]
    fn test_parse_hex_quantities() {
        assert_eq!(parse_hex_u128("0x0").unwrap(), 0);
        assert_eq!(parse_hex_u128("0x").unwrap(), 0);
        assert_eq!(parse_hex_u128("0x3b9aca00").unwrap(), 1_000_000_000);
        // 32-byte word from eth_call
        let word = format!("0x{:064x}", 5_000_000u128);
        assert_eq!(parse_hex_u128(&word).unwrap(), 5_000_000);
        assert_eq!(parse_hex_u64("0x10").unwrap(), 16);
        assert!(parse_hex_u64("0xzz").is_err());
    }
}
