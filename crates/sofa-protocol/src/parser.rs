//! Command parser

use crate::command::Command;
use crate::error::{ProtocolError, ProtocolResult};
use bytes::BytesMut;
use serde_json::Value;
use tracing::trace;

/// Maximum message size: one document plus room for a bulk envelope
const MAX_MESSAGE_SIZE: usize = sofa_core::document::MAX_DOCUMENT_SIZE * 2;

/// Line protocol parser
pub struct Parser {
    buffer: BytesMut,
}

impl Parser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Add data to the parser buffer
    pub fn feed(&mut self, data: &[u8]) -> ProtocolResult<()> {
        if self.buffer.len() + data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: self.buffer.len() + data.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Try to parse a complete command from the buffer
    pub fn parse(&mut self) -> ProtocolResult<Option<Command>> {
        let line_end = match self.buffer.iter().position(|&b| b == b'\n') {
            Some(pos) => pos,
            None => return Ok(None),
        };

        // Exclude \r\n or \n
        let line_len = if line_end > 0 && self.buffer[line_end - 1] == b'\r' {
            line_end - 1
        } else {
            line_end
        };

        let line = String::from_utf8_lossy(&self.buffer[..line_len]).to_string();
        let _ = self.buffer.split_to(line_end + 1);

        let command = Self::parse_line(&line)?;
        trace!(command = command.name(), "Parsed command");
        Ok(Some(command))
    }

    /// Parse a single command line
    pub fn parse_line(line: &str) -> ProtocolResult<Command> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ProtocolError::InvalidCommand("Empty command".into()));
        }

        let mut tokens = Tokenizer::new(line);
        let cmd = tokens
            .next()
            .ok_or_else(|| ProtocolError::InvalidCommand("Empty command".into()))?
            .to_uppercase();

        match cmd.as_str() {
            "GET" => Self::parse_get(&mut tokens),
            "PUT" => Ok(Command::put(parse_object(&mut tokens)?)),
            "PUTFOREIGN" => Ok(Command::put_foreign(parse_object(&mut tokens)?)),
            "DEL" | "DELETE" => Self::parse_delete(&mut tokens),
            "BULK" => Self::parse_bulk(&mut tokens),
            "CHANGES" => Self::parse_changes(&mut tokens),
            "KEYS" => Self::parse_keys(&mut tokens),
            "REPLICATE" => Self::parse_replicate(&mut tokens),
            "UNREPLICATE" => Self::parse_unreplicate(&mut tokens),
            "PING" => Ok(Command::ping()),
            "QUIT" => Ok(Command::quit()),
            "INFO" => Ok(Command::info()),
            _ => Err(ProtocolError::InvalidCommand(format!("Unknown command: {}", cmd))),
        }
    }

    fn parse_get(tokens: &mut Tokenizer) -> ProtocolResult<Command> {
        let id = tokens
            .next()
            .ok_or_else(|| ProtocolError::MissingArgument("document_id".into()))?;
        Ok(Command::get(id.to_string()))
    }

    fn parse_delete(tokens: &mut Tokenizer) -> ProtocolResult<Command> {
        let id = tokens
            .next()
            .ok_or_else(|| ProtocolError::MissingArgument("document_id".into()))?;
        let rev = tokens
            .next()
            .ok_or_else(|| ProtocolError::MissingArgument("rev".into()))?;
        Ok(Command::delete(id.to_string(), rev.to_string()))
    }

    fn parse_bulk(tokens: &mut Tokenizer) -> ProtocolResult<Command> {
        let mut atomic = false;
        if tokens.peek().is_some_and(|t| t.eq_ignore_ascii_case("ATOMIC")) {
            tokens.next();
            atomic = true;
        }

        let json = tokens
            .rest()
            .ok_or_else(|| ProtocolError::MissingArgument("documents".into()))?;
        match parse_json(&json)? {
            Value::Array(docs) => Ok(Command::bulk(docs, atomic)),
            _ => Err(ProtocolError::InvalidArgument(
                "BULK expects a JSON array of documents".into(),
            )),
        }
    }

    fn parse_changes(tokens: &mut Tokenizer) -> ProtocolResult<Command> {
        let (since, continuous) = parse_feed_options(tokens)?;
        Ok(Command::changes(since, continuous))
    }

    fn parse_keys(tokens: &mut Tokenizer) -> ProtocolResult<Command> {
        let start = tokens.next().map(|s| s.to_string());
        let end = tokens.next().map(|s| s.to_string());
        Ok(Command::keys(start, end))
    }

    fn parse_replicate(tokens: &mut Tokenizer) -> ProtocolResult<Command> {
        let url = tokens
            .next()
            .ok_or_else(|| ProtocolError::MissingArgument("url".into()))?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ProtocolError::InvalidArgument(format!("Not an HTTP URL: {}", url)));
        }

        let (since, continuous) = parse_feed_options(tokens)?;
        Ok(Command::replicate(url.to_string(), since, continuous))
    }

    fn parse_unreplicate(tokens: &mut Tokenizer) -> ProtocolResult<Command> {
        let id = tokens
            .next()
            .ok_or_else(|| ProtocolError::MissingArgument("replication_id".into()))?;
        Ok(Command::unreplicate(id.to_string()))
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

/// `[SINCE <seq>] [CONTINUOUS]` in any order
fn parse_feed_options(tokens: &mut Tokenizer) -> ProtocolResult<(u64, bool)> {
    let mut since = 0;
    let mut continuous = false;

    while let Some(opt) = tokens.next() {
        match opt.to_uppercase().as_str() {
            "SINCE" => {
                let s = tokens
                    .next()
                    .ok_or_else(|| ProtocolError::MissingArgument("since value".into()))?;
                since = s
                    .parse()
                    .map_err(|_| ProtocolError::InvalidArgument(format!("Invalid sequence: {}", s)))?;
            }
            "CONTINUOUS" => continuous = true,
            _ => return Err(ProtocolError::InvalidArgument(format!("Unknown option: {}", opt))),
        }
    }

    Ok((since, continuous))
}

fn parse_json(s: &str) -> ProtocolResult<Value> {
    serde_json::from_str(s.trim()).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
}

fn parse_object(tokens: &mut Tokenizer) -> ProtocolResult<Value> {
    let json = tokens
        .rest()
        .ok_or_else(|| ProtocolError::MissingArgument("document".into()))?;
    match parse_json(&json)? {
        doc @ Value::Object(_) => Ok(doc),
        _ => Err(ProtocolError::InvalidArgument("Document must be a JSON object".into())),
    }
}

/// Simple tokenizer that handles quoted strings
struct Tokenizer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.input.len() && self.input[self.pos..].starts_with(' ') {
            self.pos += 1;
        }
    }

    fn next(&mut self) -> Option<&'a str> {
        self.skip_whitespace();
        if self.pos >= self.input.len() {
            return None;
        }

        let remaining = &self.input[self.pos..];

        if let Some(quoted) = remaining.strip_prefix('"') {
            if let Some(end) = quoted.find('"') {
                self.pos += end + 2;
                return Some(&quoted[..end]);
            }
        }

        let end = remaining.find(' ').unwrap_or(remaining.len());
        self.pos += end;
        Some(&remaining[..end])
    }

    fn peek(&mut self) -> Option<&'a str> {
        let pos = self.pos;
        let token = self.next();
        self.pos = pos;
        token
    }

    fn rest(&mut self) -> Option<String> {
        self.skip_whitespace();
        if self.pos >= self.input.len() {
            return None;
        }

        let remaining = self.input[self.pos..].to_string();
        self.pos = self.input.len();
        Some(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use serde_json::json;

    fn parse(line: &str) -> ProtocolResult<Command> {
        let mut parser = Parser::new();
        parser.feed(line.as_bytes()).unwrap();
        parser.feed(b"\r\n").unwrap();
        parser.parse().map(|c| c.unwrap())
    }

    #[test]
    fn test_parse_get() {
        let cmd = parse("GET user:123").unwrap();
        assert_eq!(cmd.kind, CommandKind::Get);
        assert_eq!(cmd.document_id, Some("user:123".to_string()));
    }

    #[test]
    fn test_parse_quoted_id() {
        let cmd = parse("get \"with space\"").unwrap();
        assert_eq!(cmd.document_id, Some("with space".to_string()));
    }

    #[test]
    fn test_parse_put() {
        let cmd = parse(r#"PUT {"_id": "a", "name": "Alice Smith"}"#).unwrap();
        assert_eq!(cmd.document_id, Some("a".to_string()));
        assert!(matches!(cmd.kind, CommandKind::Put { ref doc } if doc["name"] == json!("Alice Smith")));
    }

    #[test]
    fn test_parse_put_rejects_non_object() {
        assert!(matches!(parse("PUT [1,2]"), Err(ProtocolError::InvalidArgument(_))));
        assert!(matches!(parse("PUT {oops"), Err(ProtocolError::InvalidJson(_))));
        assert!(matches!(parse("PUT"), Err(ProtocolError::MissingArgument(_))));
    }

    #[test]
    fn test_parse_put_foreign() {
        let cmd = parse(r#"PUTFOREIGN {"_id": "b", "_rev": "3-abc"}"#).unwrap();
        assert!(matches!(cmd.kind, CommandKind::PutForeign { .. }));
    }

    #[test]
    fn test_parse_delete() {
        let cmd = parse("DEL a 2-abc").unwrap();
        assert_eq!(cmd.kind, CommandKind::Delete { rev: "2-abc".into() });
        assert!(matches!(parse("DEL a"), Err(ProtocolError::MissingArgument(_))));
    }

    #[test]
    fn test_parse_bulk() {
        let cmd = parse(r#"BULK [{"_id": "a"}, {"_id": "b"}]"#).unwrap();
        assert!(matches!(cmd.kind, CommandKind::Bulk { ref docs, atomic: false } if docs.len() == 2));

        let cmd = parse(r#"BULK atomic [{"_id": "a"}]"#).unwrap();
        assert!(matches!(cmd.kind, CommandKind::Bulk { atomic: true, .. }));

        assert!(parse(r#"BULK {"_id": "a"}"#).is_err());
    }

    #[test]
    fn test_parse_changes() {
        assert_eq!(parse("CHANGES").unwrap().kind, CommandKind::Changes { since: 0, continuous: false });
        assert_eq!(
            parse("CHANGES CONTINUOUS SINCE 42").unwrap().kind,
            CommandKind::Changes { since: 42, continuous: true }
        );
        assert!(matches!(parse("CHANGES SINCE x"), Err(ProtocolError::InvalidArgument(_))));
    }

    #[test]
    fn test_parse_keys() {
        assert_eq!(parse("KEYS").unwrap().kind, CommandKind::Keys { start: None, end: None });
        assert_eq!(
            parse("KEYS a m").unwrap().kind,
            CommandKind::Keys { start: Some("a".into()), end: Some("m".into()) }
        );
    }

    #[test]
    fn test_parse_replicate() {
        let cmd = parse("REPLICATE http://peer:5984/ SINCE 7 CONTINUOUS").unwrap();
        assert_eq!(
            cmd.kind,
            CommandKind::Replicate {
                url: "http://peer:5984/".into(),
                since: 7,
                continuous: true
            }
        );
        assert!(matches!(parse("REPLICATE ftp://x"), Err(ProtocolError::InvalidArgument(_))));

        let cmd = parse("UNREPLICATE r-1").unwrap();
        assert_eq!(cmd.kind, CommandKind::Unreplicate { replication_id: "r-1".into() });
    }

    #[test]
    fn test_parse_ping() {
        assert_eq!(parse("ping").unwrap().kind, CommandKind::Ping);
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(parse("SUBSCRIBE x"), Err(ProtocolError::InvalidCommand(_))));
    }

    #[test]
    fn test_incomplete_command() {
        let mut parser = Parser::new();
        parser.feed(b"GET user:123").unwrap();

        assert!(parser.parse().unwrap().is_none());

        parser.feed(b"\r\n").unwrap();
        assert!(parser.parse().unwrap().is_some());
    }

    #[test]
    fn test_pipelined_commands() {
        let mut parser = Parser::new();
        parser.feed(b"PING\r\nINFO\n").unwrap();
        assert_eq!(parser.parse().unwrap().unwrap().kind, CommandKind::Ping);
        assert_eq!(parser.parse().unwrap().unwrap().kind, CommandKind::Info);
        assert!(parser.parse().unwrap().is_none());
    }
}
