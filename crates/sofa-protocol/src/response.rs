//! Protocol response types

use crate::error::ProtocolError;
use bytes::{BufMut, BytesMut};
use serde_json::Value;

/// A protocol response
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// +OK [message]
    Ok(Option<String>),

    /// -ERR <code> <message>
    Error { code: String, message: String },

    /// $<length>\r\n<data>
    Bulk(Vec<u8>),

    /// *<count>\r\n<items>
    Array(Vec<Response>),

    /// #<seq> <json>
    Change { seq: u64, record: Value },

    /// :<integer>
    Integer(i64),

    /// JSON value, sent as bulk data
    Json(Value),

    /// Null response
    Null,

    /// PONG
    Pong,
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok(None)
    }

    pub fn ok_with_message(msg: impl Into<String>) -> Self {
        Response::Ok(Some(msg.into()))
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Response::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(id: &str) -> Self {
        Response::Error {
            code: "NOT_FOUND".into(),
            message: format!("Document not found: {}", id),
        }
    }

    pub fn invalid_command(msg: &str) -> Self {
        Response::Error {
            code: "INVALID_CMD".into(),
            message: msg.to_string(),
        }
    }

    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        Response::Bulk(data.into())
    }

    pub fn integer(n: i64) -> Self {
        Response::Integer(n)
    }

    pub fn json(v: Value) -> Self {
        Response::Json(v)
    }

    pub fn change(seq: u64, record: Value) -> Self {
        Response::Change { seq, record }
    }

    pub fn pong() -> Self {
        Response::Pong
    }

    pub fn null() -> Self {
        Response::Null
    }

    pub fn array(items: Vec<Response>) -> Self {
        Response::Array(items)
    }

    /// Encode the response to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Encode the response into an existing buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Response::Ok(None) => {
                buf.put_slice(b"+OK\r\n");
            }
            Response::Ok(Some(msg)) => {
                buf.put_slice(b"+OK ");
                buf.put_slice(msg.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Response::Error { code, message } => {
                buf.put_slice(b"-ERR ");
                buf.put_slice(code.as_bytes());
                buf.put_slice(b" ");
                // Messages must stay on one line
                buf.put_slice(message.replace(['\r', '\n'], " ").as_bytes());
                buf.put_slice(b"\r\n");
            }
            Response::Bulk(data) => {
                put_bulk(buf, data);
            }
            Response::Array(items) => {
                buf.put_slice(b"*");
                buf.put_slice(items.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                for item in items {
                    item.encode_into(buf);
                }
            }
            Response::Change { seq, record } => {
                buf.put_slice(b"#");
                buf.put_slice(seq.to_string().as_bytes());
                buf.put_slice(b" ");
                // Compact JSON never contains a raw newline
                let json = serde_json::to_string(record).unwrap_or_else(|_| "null".to_string());
                buf.put_slice(json.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Response::Integer(n) => {
                buf.put_slice(b":");
                buf.put_slice(n.to_string().as_bytes());
                buf.put_slice(b"\r\n");
            }
            Response::Json(v) => {
                let json = serde_json::to_string(v).unwrap_or_else(|_| "null".to_string());
                put_bulk(buf, json.as_bytes());
            }
            Response::Null => {
                buf.put_slice(b"$-1\r\n");
            }
            Response::Pong => {
                buf.put_slice(b"+PONG\r\n");
            }
        }
    }
}

fn put_bulk(buf: &mut BytesMut, data: &[u8]) {
    buf.put_slice(b"$");
    buf.put_slice(data.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
}

impl From<ProtocolError> for Response {
    fn from(e: ProtocolError) -> Self {
        Response::error(e.code(), e.to_string())
    }
}

impl From<sofa_core::Error> for Response {
    fn from(e: sofa_core::Error) -> Self {
        ProtocolError::from(e).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_ok() {
        let resp = Response::ok();
        assert_eq!(resp.encode().as_ref(), b"+OK\r\n");
    }

    #[test]
    fn test_encode_error() {
        let resp = Response::error("NOT_FOUND", "Document not found");
        assert_eq!(resp.encode().as_ref(), b"-ERR NOT_FOUND Document not found\r\n");
    }

    #[test]
    fn test_error_message_is_single_line() {
        let resp = Response::error("BAD_REQUEST", "line one\nline two");
        assert_eq!(resp.encode().as_ref(), b"-ERR BAD_REQUEST line one line two\r\n");
    }

    #[test]
    fn test_encode_bulk() {
        let resp = Response::bulk(b"hello".to_vec());
        assert_eq!(resp.encode().as_ref(), b"$5\r\nhello\r\n");
    }

    #[test]
    fn test_encode_json() {
        let resp = Response::json(json!({"a": 1}));
        assert_eq!(resp.encode().as_ref(), b"$7\r\n{\"a\":1}\r\n");
    }

    #[test]
    fn test_encode_change() {
        let resp = Response::change(12, json!({"id": "a"}));
        assert_eq!(resp.encode().as_ref(), b"#12 {\"id\":\"a\"}\r\n");
    }

    #[test]
    fn test_encode_integer() {
        let resp = Response::integer(42);
        assert_eq!(resp.encode().as_ref(), b":42\r\n");
    }

    #[test]
    fn test_encode_null() {
        let resp = Response::null();
        assert_eq!(resp.encode().as_ref(), b"$-1\r\n");
    }

    #[test]
    fn test_encode_array() {
        let resp = Response::array(vec![Response::ok(), Response::integer(1)]);
        assert_eq!(resp.encode().as_ref(), b"*2\r\n+OK\r\n:1\r\n");
    }

    #[test]
    fn test_core_error_codes() {
        let resp: Response = sofa_core::Error::NotFound("a".into()).into();
        assert!(matches!(resp, Response::Error { ref code, .. } if code == "NOT_FOUND"));

        let resp: Response = sofa_core::Error::MalformedRevision("x".into()).into();
        assert!(matches!(resp, Response::Error { ref code, .. } if code == "BAD_REVISION"));
    }
}
