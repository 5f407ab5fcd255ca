use bytes::Bytes;
use uuid::Uuid;

/// The unit of transmission on a meshrpc connection.
///
/// A frame carries a 128-bit correlation identifier, an optional request-name
/// string used for serializer negotiation, a priority integer (default 0,
/// higher served first by compliant servers) and the opaque body bytes.
///
/// Responses echo the correlation identifier of the request they answer;
/// the client demultiplexes by id, never by ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Correlation identifier, unique per request attempt
    pub id: Uuid,
    /// Request name advertised by the serializer, absent on responses
    pub name: Option<String>,
    /// Scheduling hint for the server; default 0
    pub priority: i32,
    /// Opaque payload bytes
    pub body: Bytes,
}

impl Frame {
    /// A request frame with a freshly assigned correlation identifier.
    pub fn request(name: impl Into<String>, priority: i32, body: Bytes) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: Some(name.into()),
            priority,
            body,
        }
    }

    /// A response frame answering `id`.
    pub fn response(id: Uuid, body: Bytes) -> Self {
        Self {
            id,
            name: None,
            priority: 0,
            body,
        }
    }

    /// Encoded size of the frame payload, excluding the length prefix.
    pub fn encoded_len(&self) -> usize {
        16 + 2 + self.name.as_ref().map(|n| n.len()).unwrap_or(0) + 4 + self.body.len()
    }
}
