//! Span-context propagation across task and process boundaries.
//!
//! Every uplink decode opens a root context; its serialized form
//! travels inside the `carrier` field of the uplink frame so the
//! forwarder (and anything downstream of the broker) can continue the
//! trace. The carrier is a fixed 24-byte big-endian layout:
//! 16 bytes trace id, 8 bytes span id.

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;

const CARRIER_LEN: usize = 24;

/// Identifies one span within one trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: u128,
    pub span_id: u64,
}

impl SpanContext {
    /// Start a new trace.
    pub fn new_root() -> Self {
        let mut rng = rand::thread_rng();
        SpanContext {
            trace_id: rng.gen(),
            span_id: rng.gen(),
        }
    }

    /// Derive a child context within the same trace.
    pub fn child(&self) -> Self {
        SpanContext {
            trace_id: self.trace_id,
            span_id: rand::thread_rng().gen(),
        }
    }

    /// Serialize into the binary carrier format.
    pub fn to_carrier(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(CARRIER_LEN);
        buf.put_u128(self.trace_id);
        buf.put_u64(self.span_id);
        buf.to_vec()
    }

    /// Deserialize from the binary carrier format.
    pub fn from_carrier(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() != CARRIER_LEN {
            anyhow::bail!("carrier must be {} bytes, got {}", CARRIER_LEN, data.len());
        }
        let mut buf = data;
        Ok(SpanContext {
            trace_id: buf.get_u128(),
            span_id: buf.get_u64(),
        })
    }

    pub fn trace_id_hex(&self) -> String {
        format!("{:032x}", self.trace_id)
    }

    pub fn span_id_hex(&self) -> String {
        format!("{:016x}", self.span_id)
    }
}
