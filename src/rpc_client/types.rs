use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::range::BlockRange;

pub const REQUEST_ID: u64 = 1;

/// Address/topic selection sent with every eth_getLogs call.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LogFilter {
    #[serde(default)]
    pub address: Vec<String>,
    /// Positional topics, `None` matches anything in that position
    #[serde(default)]
    pub topics: Vec<Option<String>>,
}

impl Default for LogFilter {
    fn default() -> Self {
        Self {
            address: vec!["0xe91D153E0b41518A2Ce8Dd3D7944Fa863463a97d".to_owned()],
            topics: vec![Some(
                "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef".to_owned(),
            )],
        }
    }
}

#[derive(Clone, Debug)]
pub struct GetLogs {
    pub range: BlockRange,
    pub filter: Arc<LogFilter>,
}

/// Log count or JSON-RPC error object of a well formed eth_getLogs response.
#[derive(Debug, PartialEq, Eq)]
pub enum LogsResponse {
    Count(u64),
    Error { code: i64, message: String },
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

impl From<&GetLogs> for serde_json::Value {
    fn from(req: &GetLogs) -> serde_json::Value {
        let mut filter = serde_json::Map::new();
        filter.insert(
            "fromBlock".into(),
            format!("{:#x}", req.range.start).into(),
        );
        filter.insert("toBlock".into(), format!("{:#x}", req.range.end).into());

        match req.filter.address.as_slice() {
            [] => {}
            [single] => {
                filter.insert("address".into(), single.clone().into());
            }
            many => {
                filter.insert("address".into(), many.to_vec().into());
            }
        }

        if !req.filter.topics.is_empty() {
            filter.insert("topics".into(), serde_json::json!(req.filter.topics));
        }

        serde_json::json!({
            "method": "eth_getLogs",
            "params": [filter],
            "id": REQUEST_ID,
            "jsonrpc": "2.0",
        })
    }
}

impl GetLogs {
    pub(crate) fn resp_from_json(&self, json: String) -> Result<LogsResponse> {
        let mut json = json.into_bytes();
        let json: serde_json::Value =
            simd_json::serde::from_slice(&mut json).context("parse response json")?;

        let mut json = match json {
            serde_json::Value::Object(obj) => obj,
            _ => return Err(anyhow!("non object rpc response")),
        };

        if json
            .remove("jsonrpc")
            .context("get jsonrpc field")?
            .as_str()
            .context("jsonrpc field is str")?
            != "2.0"
        {
            return Err(anyhow!("invalid jsonrpc field in response"));
        }

        if json
            .remove("id")
            .context("get id field")?
            .as_u64()
            .context("id field is u64")?
            != REQUEST_ID
        {
            return Err(anyhow!("invalid id field in response"));
        }

        if let Some(err) = json.remove("error") {
            let err: RpcErrorObject = serde_json::from_value(err).context("deserialize error")?;
            return Ok(LogsResponse::Error {
                code: err.code,
                message: err.message,
            });
        }

        match json.remove("result").context("get result field")? {
            serde_json::Value::Array(logs) => Ok(LogsResponse::Count(logs.len() as u64)),
            _ => Err(anyhow!("result field is not an array")),
        }
    }
}
