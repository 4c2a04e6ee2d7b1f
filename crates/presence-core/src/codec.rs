//! Call payload codec.
//!
//! The broker never looks inside a call; only the client proxy and the worker
//! agent encode and decode payloads, through the [`Codec`] trait. [`JsonCodec`]
//! is the default.

use crate::error::RemoteFault;
use crate::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One remote call: which service, which member, with what arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Call {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }
}

/// Outcome of a call as carried in the reply payload.
///
/// Externally tagged, so a returned value that happens to look like a fault
/// can never be mistaken for one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Value(Value),
    Fault(RemoteFault),
}

impl Reply {
    /// Convert into the caller-facing result.
    pub fn into_result(self) -> std::result::Result<Value, RemoteFault> {
        match self {
            Reply::Value(value) => Ok(value),
            Reply::Fault(fault) => Err(fault),
        }
    }
}

impl From<std::result::Result<Value, RemoteFault>> for Reply {
    fn from(result: std::result::Result<Value, RemoteFault>) -> Self {
        match result {
            Ok(value) => Reply::Value(value),
            Err(fault) => Reply::Fault(fault),
        }
    }
}

/// Encoding contract between client proxies and worker agents.
pub trait Codec: Send + Sync + 'static {
    fn encode_call(&self, call: &Call) -> Result<Bytes>;
    fn decode_call(&self, payload: &[u8]) -> Result<Call>;
    fn encode_reply(&self, reply: &Reply) -> Result<Bytes>;
    fn decode_reply(&self, payload: &[u8]) -> Result<Reply>;
}

/// JSON payloads via serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode_call(&self, call: &Call) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(call)?))
    }

    fn decode_call(&self, payload: &[u8]) -> Result<Call> {
        Ok(serde_json::from_slice(payload)?)
    }

    fn encode_reply(&self, reply: &Reply) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(reply)?))
    }

    fn decode_reply(&self, payload: &[u8]) -> Result<Reply> {
        Ok(serde_json::from_slice(payload)?)
    }
}
