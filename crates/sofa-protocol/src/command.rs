//! Protocol command types

use serde_json::Value;

/// A parsed command
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub kind: CommandKind,
    pub document_id: Option<String>,
}

/// All supported commands
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    /// GET <id>
    Get,

    /// PUT <json>
    Put { doc: Value },

    /// PUTFOREIGN <json> - install the document's `_rev` verbatim
    PutForeign { doc: Value },

    /// DEL <id> <rev>
    Delete { rev: String },

    /// BULK [ATOMIC] <json-array>
    Bulk { docs: Vec<Value>, atomic: bool },

    /// CHANGES [SINCE <seq>] [CONTINUOUS]
    Changes { since: u64, continuous: bool },

    /// KEYS [start] [end]
    Keys {
        start: Option<String>,
        end: Option<String>,
    },

    /// REPLICATE <url> [SINCE <seq>] [CONTINUOUS]
    Replicate {
        url: String,
        since: u64,
        continuous: bool,
    },

    /// UNREPLICATE <replication-id>
    Unreplicate { replication_id: String },

    /// PING
    Ping,

    /// QUIT
    Quit,

    /// INFO
    Info,
}

impl Command {
    fn new(kind: CommandKind, document_id: Option<String>) -> Self {
        Command { kind, document_id }
    }

    pub fn get(id: String) -> Self {
        Self::new(CommandKind::Get, Some(id))
    }

    /// The document id is taken from the payload's `_id`, if any
    pub fn put(doc: Value) -> Self {
        let id = payload_id(&doc);
        Self::new(CommandKind::Put { doc }, id)
    }

    pub fn put_foreign(doc: Value) -> Self {
        let id = payload_id(&doc);
        Self::new(CommandKind::PutForeign { doc }, id)
    }

    pub fn delete(id: String, rev: String) -> Self {
        Self::new(CommandKind::Delete { rev }, Some(id))
    }

    pub fn bulk(docs: Vec<Value>, atomic: bool) -> Self {
        Self::new(CommandKind::Bulk { docs, atomic }, None)
    }

    pub fn changes(since: u64, continuous: bool) -> Self {
        Self::new(CommandKind::Changes { since, continuous }, None)
    }

    pub fn keys(start: Option<String>, end: Option<String>) -> Self {
        Self::new(CommandKind::Keys { start, end }, None)
    }

    pub fn replicate(url: String, since: u64, continuous: bool) -> Self {
        Self::new(
            CommandKind::Replicate {
                url,
                since,
                continuous,
            },
            None,
        )
    }

    pub fn unreplicate(replication_id: String) -> Self {
        Self::new(CommandKind::Unreplicate { replication_id }, None)
    }

    pub fn ping() -> Self {
        Self::new(CommandKind::Ping, None)
    }

    pub fn quit() -> Self {
        Self::new(CommandKind::Quit, None)
    }

    pub fn info() -> Self {
        Self::new(CommandKind::Info, None)
    }

    /// Short name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self.kind {
            CommandKind::Get => "get",
            CommandKind::Put { .. } => "put",
            CommandKind::PutForeign { .. } => "putforeign",
            CommandKind::Delete { .. } => "del",
            CommandKind::Bulk { .. } => "bulk",
            CommandKind::Changes { .. } => "changes",
            CommandKind::Keys { .. } => "keys",
            CommandKind::Replicate { .. } => "replicate",
            CommandKind::Unreplicate { .. } => "unreplicate",
            CommandKind::Ping => "ping",
            CommandKind::Quit => "quit",
            CommandKind::Info => "info",
        }
    }
}

fn payload_id(doc: &Value) -> Option<String> {
    doc.get("_id").and_then(Value::as_str).map(str::to_string)
}
