use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::WireError;

/// Bulk payload of the terminal frame a streaming reply ends with. The reply
/// router unregisters the correlation id when it sees this.
pub const NO_MORE_REPLIES: &[u8] = b"no_more_replies";

/// One framed protocol message: `(command, correlation-id, params, bulk)`.
///
/// `params` is JSON — usually an object, but some commands carry a bare array
/// (`upload_requirements` ships a list of layer hashes). `bulk` is opaque
/// bytes. A message can be replied to iff its correlation id is non-empty;
/// replies reuse the id of the message they answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub command: String,
    pub id: String,
    pub params: Value,
    pub bulk: Bytes,
}

impl Message {
    pub fn new(
        command: impl Into<String>,
        id: impl Into<String>,
        params: Value,
        bulk: impl Into<Bytes>,
    ) -> Self {
        Message {
            command: command.into(),
            id: id.into(),
            params,
            bulk: bulk.into(),
        }
    }

    /// A command with no correlation id and no bulk.
    pub fn command(command: impl Into<String>, params: Value) -> Self {
        Message::new(command, "", params, Bytes::new())
    }

    /// A reply to this message: empty command, same correlation id.
    pub fn reply(&self, params: Value, bulk: impl Into<Bytes>) -> Self {
        Message::new("", self.id.clone(), params, bulk)
    }

    /// The terminator a streaming reply sends once no more frames will follow.
    pub fn sentinel(id: impl Into<String>) -> Self {
        Message::new("", id, Value::Object(Default::default()), NO_MORE_REPLIES)
    }

    pub fn replyable(&self) -> bool {
        !self.id.is_empty()
    }

    pub fn is_sentinel(&self) -> bool {
        let empty_params = match &self.params {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        };
        self.command.is_empty() && empty_params && self.bulk.as_ref() == NO_MORE_REPLIES
    }

    /// Convenience accessor for a string-valued param.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(Value::as_u64)
    }

    /// The remote failure message, if this frame reports one.
    pub fn exception(&self) -> Option<&str> {
        self.param_str(crate::commands::EXCEPTION)
    }

    /// Serialize into the four length-prefixed parts carried by one
    /// transport record. `Null` params encode as an empty JSON object.
    pub fn encode(&self) -> Bytes {
        let params = match &self.params {
            Value::Null => b"{}".to_vec(),
            other => serde_json::to_vec(other).expect("params are valid JSON"),
        };
        let mut dst = BytesMut::with_capacity(
            16 + self.command.len() + self.id.len() + params.len() + self.bulk.len(),
        );
        for part in [self.command.as_bytes(), self.id.as_bytes(), &params, &self.bulk] {
            dst.put_u32(part.len() as u32);
            dst.put_slice(part);
        }
        dst.freeze()
    }

    /// Parse one transport record back into a message.
    pub fn decode(frame: &[u8]) -> Result<Message, WireError> {
        let mut src = frame;
        let mut parts: [&[u8]; 4] = [&[]; 4];
        for slot in parts.iter_mut() {
            if src.remaining() < 4 {
                return Err(WireError::Malformed("truncated part length"));
            }
            let len = src.get_u32() as usize;
            if src.remaining() < len {
                return Err(WireError::Malformed("truncated part body"));
            }
            *slot = &src[..len];
            src.advance(len);
        }
        if src.has_remaining() {
            return Err(WireError::Malformed("trailing bytes after bulk"));
        }
        let [command, id, params, bulk] = parts;
        Ok(Message {
            command: std::str::from_utf8(command)
                .map_err(|_| WireError::Malformed("command is not utf-8"))?
                .to_owned(),
            id: std::str::from_utf8(id)
                .map_err(|_| WireError::Malformed("correlation id is not utf-8"))?
                .to_owned(),
            params: serde_json::from_slice(params)
                .map_err(|_| WireError::Malformed("params are not json"))?,
            bulk: Bytes::copy_from_slice(bulk),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn round_trip() {
        let msg = Message::new(
            "spawn_container",
            "aVyXk3mQbqUEqW9sT2fGHx",
            json!({"node": "pk", "env": [["A", "1"]]}),
            Bytes::from_static(b"\x00\x01binary"),
        );
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trip_array_params_and_empty_bulk() {
        let msg = Message::new("upload_requirements", "id1", json!(["abc", "def"]), Bytes::new());
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn null_params_encode_as_empty_object() {
        let msg = Message::new("log", "", Value::Null, Bytes::new());
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.params, json!({}));
    }

    #[test]
    fn sentinel_detected_exactly() {
        assert!(Message::sentinel("abc").is_sentinel());

        // Same bulk under a real command is not a terminator.
        let near = Message::new("fetch", "abc", json!({}), NO_MORE_REPLIES);
        assert!(!near.is_sentinel());
        // Non-empty params is not a terminator either.
        let near = Message::new("", "abc", json!({"k": 1}), NO_MORE_REPLIES);
        assert!(!near.is_sentinel());
        // Nor an ordinary empty reply.
        let near = Message::new("", "abc", json!({}), Bytes::new());
        assert!(!near.is_sentinel());
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let bytes = Message::command("fetch", json!({})).encode();
        assert!(Message::decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(Message::decode(&bytes[..2]).is_err());

        let mut trailing = BytesMut::from(bytes.as_ref());
        trailing.put_u8(0);
        assert!(Message::decode(&trailing).is_err());
    }

    #[test]
    fn replies_reuse_the_correlation_id() {
        let req = Message::new("fetch", "req-id", json!({"filename": "/etc/hosts"}), Bytes::new());
        let reply = req.reply(json!({}), Bytes::from_static(b"127.0.0.1"));
        assert_eq!(reply.id, "req-id");
        assert!(reply.command.is_empty());
        assert!(!reply.is_sentinel());
    }
}
