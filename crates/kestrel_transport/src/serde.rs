//! Wire framing for per-server requests.
//!
//! An `InstanceRequest` is what one server receives for one sub-query:
//! the broker request, the segments that server must search, and enough
//! identity to correlate the response. Framing is magic + format version +
//! length-prefixed bincode payload, so field ordering on the wire is the
//! declaration order of the struct and stays stable.

use ::serde::{Deserialize, Serialize};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use kestrel_common::error::{QueryError, QueryResult};
use kestrel_common::request::BrokerRequest;

/// Magic bytes prefixing every serialized instance request.
pub const INSTANCE_REQUEST_MAGIC: &[u8; 4] = b"KSIR";
/// Wire format version; bump on backward-incompatible layout changes.
pub const INSTANCE_REQUEST_FORMAT_VERSION: u32 = 1;

/// One per-server sub-query as shipped over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRequest {
    pub request_id: u64,
    pub enable_trace: bool,
    pub query: BrokerRequest,
    /// Names of the segments this server must search.
    pub search_segments: Vec<String>,
    /// Identifier of the issuing broker, for server-side logging.
    pub broker_id: String,
}

/// Encoder/decoder for instance requests.
///
/// A `SerDe` owns a scratch buffer and is NOT safe to share across
/// concurrent scatter calls: construct a fresh one per call.
#[derive(Debug, Default)]
pub struct SerDe {
    scratch: Vec<u8>,
}

impl SerDe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serialize(&mut self, request: &InstanceRequest) -> QueryResult<Bytes> {
        self.scratch.clear();
        bincode::serialize_into(&mut self.scratch, request)
            .map_err(|e| QueryError::Internal(format!("instance request encode failed: {}", e)))?;
        let mut buf = BytesMut::with_capacity(INSTANCE_REQUEST_MAGIC.len() + 8 + self.scratch.len());
        buf.put_slice(INSTANCE_REQUEST_MAGIC);
        buf.put_u32(INSTANCE_REQUEST_FORMAT_VERSION);
        buf.put_u32(self.scratch.len() as u32);
        buf.put_slice(&self.scratch);
        Ok(buf.freeze())
    }

    pub fn deserialize(&mut self, bytes: &[u8]) -> QueryResult<InstanceRequest> {
        let mut buf = bytes;
        if buf.remaining() < INSTANCE_REQUEST_MAGIC.len() + 8 {
            return Err(QueryError::Internal(format!(
                "instance request too short: {} bytes",
                bytes.len()
            )));
        }
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if &magic != INSTANCE_REQUEST_MAGIC {
            return Err(QueryError::Internal("bad instance request magic".to_string()));
        }
        let version = buf.get_u32();
        if version != INSTANCE_REQUEST_FORMAT_VERSION {
            return Err(QueryError::Internal(format!(
                "unsupported instance request format version {}",
                version
            )));
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(QueryError::Internal(format!(
                "truncated instance request: expected {} bytes, have {}",
                len,
                buf.remaining()
            )));
        }
        bincode::deserialize(&buf[..len])
            .map_err(|e| QueryError::Internal(format!("instance request decode failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::request::{BrokerRequest, Selection};

    fn sample_request() -> InstanceRequest {
        InstanceRequest {
            request_id: 42,
            enable_trace: true,
            query: BrokerRequest::selection(
                "t_OFFLINE",
                Selection {
                    selection_columns: vec!["a".into()],
                    size: 10,
                    selection_sort_sequence: Vec::new(),
                },
            ),
            search_segments: vec!["seg0".into(), "seg1".into()],
            broker_id: "broker-1".into(),
        }
    }

    #[test]
    fn round_trip() {
        let request = sample_request();
        let mut serde = SerDe::new();
        let bytes = serde.serialize(&request).unwrap();
        let decoded = serde.deserialize(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn rejects_version_mismatch() {
        let mut serde = SerDe::new();
        let mut bytes = serde.serialize(&sample_request()).unwrap().to_vec();
        // Version field sits right after the 4-byte magic.
        bytes[7] = 99;
        assert!(serde.deserialize(&bytes).is_err());
    }
}
