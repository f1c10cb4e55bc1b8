//! Sofa line protocol
//!
//! A text protocol in the style of Redis RESP for talking to a sofa store.
//!
//! ## Command Format
//! ```text
//! COMMAND [ARGUMENTS] [JSON PAYLOAD]
//! ```
//!
//! ## Response Format
//! ```text
//! +OK                      # Success
//! -ERR <code> <message>    # Error
//! $<length>\r\n<data>      # Bulk data (JSON documents)
//! *<count>\r\n<items>      # Array
//! :<integer>               # Integer
//! #<seq> <json>            # Change record
//! ```

pub mod command;
pub mod error;
pub mod parser;
pub mod response;

pub use command::{Command, CommandKind};
pub use error::{ProtocolError, ProtocolResult};
pub use parser::Parser;
pub use response::Response;
