//! Ask/answer: the request/response layer over reserved channels.
//!
//! An ask travels on channel `request` as `{question, data, id}`; the
//! reply comes back on channel `request_<id>` over the same connection
//! that carried the request. Correlation is by id alone, so replies may
//! arrive in any order across connections and still resolve the right
//! asker.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::Connection;

/// Reserved channel carrying ask envelopes.
pub(crate) const CHANNEL_REQUEST: &str = "request";

/// Reserved channel carrying discover-handshake payloads.
pub(crate) const CHANNEL_DISCOVER: &str = "discover";

/// Reply channel name for one request id.
pub(crate) fn reply_channel(id: u64) -> String {
    format!("request_{id}")
}

/// Wire shape of one ask.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AskEnvelope {
    pub question: String,
    pub data: Value,
    pub id: u64,
}

pub(crate) type QuestionFuture = Pin<Box<dyn Future<Output = Value>>>;
pub(crate) type QuestionHandler = Rc<dyn Fn(Value) -> QuestionFuture>;

/// Named question handlers. Last registration for a name wins.
#[derive(Default)]
pub(crate) struct QuestionRegistry {
    handlers: RefCell<HashMap<String, QuestionHandler>>,
}

impl QuestionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Value) -> Fut + 'static,
        Fut: Future<Output = Value> + 'static,
    {
        let boxed: QuestionHandler = Rc::new(move |data| Box::pin(handler(data)));
        self.handlers.borrow_mut().insert(name.to_string(), boxed);
    }

    pub(crate) fn get(&self, name: &str) -> Option<QuestionHandler> {
        self.handlers.borrow().get(name).cloned()
    }
}

/// Answer one inbound ask on the connection that carried it.
///
/// A registered handler runs as its own task so a slow answer never
/// stalls the connection's read loop. An unknown question gets an
/// explicit `null` reply immediately; the asker must resolve either
/// way.
pub(crate) fn answer(handler: Option<QuestionHandler>, conn: Rc<Connection>, envelope: AskEnvelope) {
    let channel = reply_channel(envelope.id);
    match handler {
        Some(handler) => {
            tokio::task::spawn_local(async move {
                let result = handler(envelope.data).await;
                if let Err(error) = conn.send(&channel, result) {
                    tracing::warn!(serial = conn.serial(), %error, "failed to encode reply");
                }
            });
        }
        None => {
            tracing::debug!(
                question = %envelope.question,
                "no handler registered, replying null"
            );
            if let Err(error) = conn.send(&channel, Value::Null) {
                tracing::warn!(serial = conn.serial(), %error, "failed to encode null reply");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_channel_name() {
        assert_eq!(reply_channel(0), "request_0");
        assert_eq!(reply_channel(41), "request_41");
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = AskEnvelope {
            question: "square".to_string(),
            data: json!(7),
            id: 3,
        };

        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(value, json!({"question": "square", "data": 7, "id": 3}));

        let back: AskEnvelope = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back.question, "square");
        assert_eq!(back.data, json!(7));
        assert_eq!(back.id, 3);
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let registry = QuestionRegistry::new();
        registry.register("q", |_| async { json!(1) });
        registry.register("q", |_| async { json!(2) });

        let handler = registry.get("q").expect("registered");
        assert_eq!(handler(json!(null)).await, json!(2));
    }

    #[test]
    fn test_unknown_question_has_no_handler() {
        let registry = QuestionRegistry::new();
        assert!(registry.get("missing").is_none());
    }
}
