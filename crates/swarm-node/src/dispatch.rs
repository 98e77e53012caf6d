//! Command dispatch for the local control channel.
//!
//! Requests are JSON objects with a single key naming the command:
//!
//! ```text
//! {"insert": {"doc1": "A"}}        -> {"insert": {"key", "value", "hash"}}
//! {"update": {"doc1": "B"}}        -> {"update": {"key", "value", "hash"}}
//! {"select": "doc1"}               -> {"select": {"_id", "content"}}
//! {"select_all": null}             -> {"select_all": [...]}
//! {"delete": "doc1"}               -> {"delete": {"_id", "content"}}
//! {"peers": null}                  -> {"peers": [...]}
//! {"ping": null}                   -> {"ping": {"<peer>": ms | null}}
//! {"pubsub": {"topic", "message"}} -> {"pubsub": {"topic", "sent"}}
//! ```
//!
//! Failures are rendered as `{"error": {"<context>": details}}` and never
//! escape the dispatcher.

use crate::error::{NodeError, Result};
use crate::network::Transport;
use crate::node::Node;
use serde_json::{json, Map, Value};
use swarm_log::Op;
use tracing::{debug, warn};

/// A parsed control command.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Insert { key: String, value: Value },
    Update { key: String, value: Value },
    Select(String),
    SelectAll,
    Delete(String),
    Peers,
    Ping,
    Pubsub { topic: String, message: Value },
}

impl Command {
    /// Parse a request message.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| NodeError::validation("Invalid message", json!({ "reason": e.to_string() })))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let object = match value {
            Value::Object(object) if object.len() == 1 => object,
            other => {
                return Err(NodeError::validation(
                    "Invalid message",
                    json!({ "expected": "an object with one command key", "got": other }),
                ))
            }
        };
        let Some((method, data)) = object.into_iter().next() else {
            return Err(NodeError::validation("Invalid message", Value::Null));
        };

        match method.as_str() {
            "insert" => {
                let (key, value) = key_value(data, "Insert Data validation failed")?;
                Ok(Command::Insert { key, value })
            }
            "update" => {
                let (key, value) = key_value(data, "Update Data validation failed")?;
                Ok(Command::Update { key, value })
            }
            "select" => Ok(Command::Select(key_arg(data, "Select key validation failed")?)),
            "select_all" => Ok(Command::SelectAll),
            "delete" => Ok(Command::Delete(key_arg(data, "Delete key validation failed")?)),
            "peers" => Ok(Command::Peers),
            "ping" => Ok(Command::Ping),
            "pubsub" => {
                let topic = data.get("topic").and_then(Value::as_str).unwrap_or_default();
                let message = data.get("message").cloned().unwrap_or(Value::Null);
                if topic.is_empty() || message.is_null() {
                    return Err(NodeError::validation("Pubsub data validation failed", json!({ "value": data })));
                }
                Ok(Command::Pubsub {
                    topic: topic.to_string(),
                    message,
                })
            }
            other => Err(NodeError::validation("Unknown command", json!({ "command": other }))),
        }
    }

    /// Name used as the response tag.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Insert { .. } => "insert",
            Command::Update { .. } => "update",
            Command::Select(_) => "select",
            Command::SelectAll => "select_all",
            Command::Delete(_) => "delete",
            Command::Peers => "peers",
            Command::Ping => "ping",
            Command::Pubsub { .. } => "pubsub",
        }
    }
}

/// `{key: value}` with exactly one non-empty key and a non-null value.
fn key_value(data: Value, context: &str) -> Result<(String, Value)> {
    let invalid = |data: &Value| NodeError::validation(context, json!({ "value": data }));
    let object = match &data {
        Value::Object(object) if object.len() == 1 => object,
        _ => return Err(invalid(&data)),
    };
    match object.iter().next() {
        Some((key, value)) if !key.is_empty() && !value.is_null() => Ok((key.clone(), value.clone())),
        _ => Err(invalid(&data)),
    }
}

fn key_arg(data: Value, context: &str) -> Result<String> {
    match data {
        Value::String(key) if !key.is_empty() => Ok(key),
        other => Err(NodeError::validation(context, json!({ "value": other }))),
    }
}

/// The stored document shape.
pub fn document(key: &str, content: Value) -> Value {
    json!({ "_id": key, "content": content })
}

/// A command result, tagged with the command that produced it.
#[derive(Debug)]
pub struct Response {
    pub command: &'static str,
    pub result: Result<Value>,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn to_value(&self) -> Value {
        match &self.result {
            Ok(value) => {
                let mut object = Map::new();
                object.insert(self.command.to_string(), value.clone());
                Value::Object(object)
            }
            Err(err) => error_value(err),
        }
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

/// `{"error": {"<context>": details}}` for an error.
pub fn error_value(err: &NodeError) -> Value {
    let (context, details) = match err {
        NodeError::Validation { context, details } => (context.clone(), details.clone()),
        NodeError::NotFound { key } => ("Document not found".to_string(), json!(key)),
        NodeError::NoChange { key, doc } => (
            "Data already up to date".to_string(),
            json!({ "doc": doc, "key": key }),
        ),
        NodeError::WriteRejected { author, key } => (
            "Write rejected".to_string(),
            json!({ "author": author, "key": key }),
        ),
        NodeError::NotReady(state) => ("Node not ready".to_string(), json!({ "state": state })),
        other => (other.kind().as_str().to_string(), json!(other.to_string())),
    };
    let mut inner = Map::new();
    inner.insert(context, details);
    json!({ "error": Value::Object(inner) })
}

/// Executes control commands against a node.
pub struct Dispatcher<T: Transport> {
    node: Node<T>,
}

impl<T: Transport> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(node: Node<T>) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &Node<T> {
        &self.node
    }

    /// Handle one raw request message and render the reply.
    pub async fn handle_text(&self, text: &str) -> String {
        let reply = match Command::parse(text) {
            Ok(command) => self.dispatch(command).await.to_value(),
            Err(err) => {
                debug!("rejected request: {}", err);
                error_value(&err)
            }
        };
        reply.to_string()
    }

    pub async fn dispatch(&self, command: Command) -> Response {
        let name = command.name();
        debug!(command = name, "control command");
        let result = self.execute(command).await;
        if let Err(err) = &result {
            match err.kind() {
                crate::error::ErrorKind::NotFound | crate::error::ErrorKind::NoChange => {
                    debug!(command = name, "{}", err)
                }
                _ => warn!(command = name, kind = %err.kind(), "{}", err),
            }
        }
        Response {
            command: name,
            result,
        }
    }

    async fn execute(&self, command: Command) -> Result<Value> {
        self.node.ensure_ready()?;
        let log = self.node.log();

        match command {
            Command::Insert { key, value } => {
                let doc = document(&key, value);
                let entry = self.node.append(Op::put(key.clone(), doc.clone()))?;
                Ok(json!({ "value": doc, "key": key, "hash": entry.hash }))
            }
            Command::Update { key, value } => {
                let current = log.get(&key).ok_or_else(|| NodeError::NotFound { key: key.clone() })?;
                let doc = document(&key, value);
                if current.get("content") == doc.get("content") {
                    return Err(NodeError::NoChange { key, doc });
                }
                let entry = self.node.append(Op::put(key.clone(), doc.clone()))?;
                Ok(json!({ "value": doc, "key": key, "hash": entry.hash }))
            }
            Command::Select(key) => log.get(&key).ok_or(NodeError::NotFound { key }),
            Command::SelectAll => Ok(Value::Array(log.scan().map(|(_, doc)| doc).collect())),
            Command::Delete(key) => {
                let current = log.get(&key).ok_or_else(|| NodeError::NotFound { key: key.clone() })?;
                self.node.append(Op::delete(key))?;
                Ok(current)
            }
            Command::Peers => {
                let peers = self.node.peers().await;
                Ok(serde_json::to_value(peers)?)
            }
            Command::Ping => {
                let rtts = self.node.ping().await;
                Ok(serde_json::to_value(rtts)?)
            }
            Command::Pubsub { topic, message } => {
                let payload = match &message {
                    Value::String(text) => text.clone().into_bytes(),
                    other => serde_json::to_vec(other)?,
                };
                let sent = self.node.publish(&topic, payload).await?;
                Ok(json!({ "topic": topic, "sent": sent }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse(r#"{"insert": {"doc1": "A"}}"#).unwrap(),
            Command::Insert {
                key: "doc1".into(),
                value: json!("A")
            }
        );
        assert_eq!(
            Command::parse(r#"{"select": "doc1"}"#).unwrap(),
            Command::Select("doc1".into())
        );
        assert_eq!(Command::parse(r#"{"select_all": null}"#).unwrap(), Command::SelectAll);
        assert_eq!(Command::parse(r#"{"peers": {}}"#).unwrap(), Command::Peers);
        assert_eq!(
            Command::parse(r#"{"pubsub": {"topic": "news", "message": "hi"}}"#).unwrap(),
            Command::Pubsub {
                topic: "news".into(),
                message: json!("hi")
            }
        );
    }

    #[test]
    fn test_parse_failures_are_validation_errors() {
        for bad in [
            "not json",
            "[]",
            r#"{"insert": {"a": 1}, "select": "a"}"#,
            r#"{"insert": {}}"#,
            r#"{"insert": {"a": null}}"#,
            r#"{"insert": {"": 1}}"#,
            r#"{"insert": {"a": 1, "b": 2}}"#,
            r#"{"delete": 5}"#,
            r#"{"pubsub": {"topic": "t"}}"#,
            r#"{"drop_table": null}"#,
        ] {
            let err = Command::parse(bad).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::Validation, "{}", bad);
        }
    }

    #[test]
    fn test_error_rendering() {
        let rendered = error_value(&NodeError::NotFound { key: "k".into() });
        assert_eq!(rendered, json!({ "error": { "Document not found": "k" } }));

        let rendered = error_value(&NodeError::NoChange {
            key: "k".into(),
            doc: document("k", json!(1)),
        });
        assert_eq!(
            rendered,
            json!({ "error": { "Data already up to date": { "doc": { "_id": "k", "content": 1 }, "key": "k" } } })
        );

        let err = Command::parse(r#"{"insert": {"a": null}}"#).unwrap_err();
        assert_eq!(
            error_value(&err),
            json!({ "error": { "Insert Data validation failed": { "value": { "a": null } } } })
        );
    }

    #[test]
    fn test_response_tagging() {
        let ok = Response {
            command: "select",
            result: Ok(document("a", json!("x"))),
        };
        assert!(ok.is_ok());
        assert_eq!(ok.to_value(), json!({ "select": { "_id": "a", "content": "x" } }));
    }
}
