//! Wire protocol frames. Every message is a JSON array whose first
//! element names the verb.

use crate::error::Error;
use crate::event::Event;
use crate::filter::Filter;
use anyhow::Result;
use serde_json::Value;
use tracing::warn;
use wspipe::MessageConverter;

/// Frames accepted from clients.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(Box<Event>),
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close(String),
    Auth(Box<Event>),
    Count {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// Anything that failed to parse or named an unknown verb; answered
    /// with a NOTICE by the dispatcher.
    Invalid { reason: String },
}

impl ClientMessage {
    pub fn from_json(text: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(text)
            .map_err(|_| Error::notice("invalid: message is not valid JSON"))?;
        let arr = value
            .as_array()
            .ok_or_else(|| Error::notice("invalid: message is not a JSON array"))?;
        let verb = arr
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| Error::notice("invalid: message has no command"))?;

        match verb {
            "EVENT" => {
                let event = arr
                    .get(1)
                    .ok_or_else(|| Error::notice("invalid: EVENT without an event object"))?;
                Ok(ClientMessage::Event(Box::new(Event::from_value(event)?)))
            }
            "REQ" => {
                let (subscription_id, filters) = parse_subscription(arr, "REQ")?;
                Ok(ClientMessage::Req {
                    subscription_id,
                    filters,
                })
            }
            "COUNT" => {
                let (subscription_id, filters) = parse_subscription(arr, "COUNT")?;
                Ok(ClientMessage::Count {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => {
                let subscription_id = arr
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::notice("invalid: CLOSE without a subscription id"))?;
                Ok(ClientMessage::Close(subscription_id.to_string()))
            }
            "AUTH" => {
                let event = arr
                    .get(1)
                    .ok_or_else(|| Error::notice("invalid: AUTH without an event object"))?;
                Ok(ClientMessage::Auth(Box::new(Event::from_value(event)?)))
            }
            other => Ok(ClientMessage::Invalid {
                reason: format!("unknown command: {other}"),
            }),
        }
    }
}

fn parse_subscription(arr: &[Value], verb: &str) -> Result<(String, Vec<Filter>), Error> {
    let subscription_id = arr
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::notice(format!("invalid: {verb} without a subscription id")))?
        .to_string();

    if arr.len() < 3 {
        return Err(Error::notice(format!("invalid: {verb} without filters")));
    }

    let filters = arr[2..]
        .iter()
        .map(Filter::from_value)
        .collect::<Result<Vec<_>, _>>()?;

    Ok((subscription_id, filters))
}

/// Frames emitted to clients.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    EndOfStoredEvents(String),
    Notice(String),
    Auth {
        challenge: String,
    },
    Count {
        subscription_id: String,
        count: usize,
    },
}

impl RelayMessage {
    pub fn ok<I: Into<String>, M: Into<String>>(event_id: I, accepted: bool, message: M) -> Self {
        RelayMessage::Ok {
            event_id: event_id.into(),
            accepted,
            message: message.into(),
        }
    }

    pub fn event<S: Into<String>>(subscription_id: S, event: Event) -> Self {
        RelayMessage::Event {
            subscription_id: subscription_id.into(),
            event: Box::new(event),
        }
    }

    pub fn eose<S: Into<String>>(subscription_id: S) -> Self {
        RelayMessage::EndOfStoredEvents(subscription_id.into())
    }

    pub fn notice<S: Into<String>>(message: S) -> Self {
        RelayMessage::Notice(message.into())
    }

    pub fn auth<S: Into<String>>(challenge: S) -> Self {
        RelayMessage::Auth {
            challenge: challenge.into(),
        }
    }

    pub fn count<S: Into<String>>(subscription_id: S, count: usize) -> Self {
        RelayMessage::Count {
            subscription_id: subscription_id.into(),
            count,
        }
    }

    pub fn as_json(&self) -> String {
        let value = match self {
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => serde_json::json!(["OK", event_id, accepted, message]),
            RelayMessage::Event {
                subscription_id,
                event,
            } => serde_json::json!(["EVENT", subscription_id, event]),
            RelayMessage::EndOfStoredEvents(subscription_id) => {
                serde_json::json!(["EOSE", subscription_id])
            }
            RelayMessage::Notice(message) => serde_json::json!(["NOTICE", message]),
            RelayMessage::Auth { challenge } => serde_json::json!(["AUTH", challenge]),
            RelayMessage::Count {
                subscription_id,
                count,
            } => serde_json::json!(["COUNT", subscription_id, {"count": count}]),
        };
        value.to_string()
    }
}

/// Bridges the wire's text frames and the typed protocol messages.
#[derive(Debug, Clone)]
pub struct NostrMessageConverter;

impl MessageConverter<ClientMessage, RelayMessage> for NostrMessageConverter {
    fn inbound_from_string(&self, message: String) -> Result<Option<ClientMessage>> {
        match ClientMessage::from_json(&message) {
            Ok(client_message) => Ok(Some(client_message)),
            Err(e) => {
                warn!("unparseable inbound frame: {}", e);
                Ok(Some(ClientMessage::Invalid {
                    reason: e.to_string(),
                }))
            }
        }
    }

    fn outbound_to_string(&self, message: RelayMessage) -> Result<String> {
        Ok(message.as_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::RelayKeys;
    use crate::test_utils::sign_test_event;

    #[test]
    fn parses_event_frame() {
        let keys = RelayKeys::generate();
        let event = sign_test_event(&keys, 1, vec![], "hello");
        let frame = serde_json::json!(["EVENT", event]).to_string();
        match ClientMessage::from_json(&frame).unwrap() {
            ClientMessage::Event(parsed) => assert_eq!(parsed.id, event.id),
            other => panic!("expected EVENT, got {:?}", other),
        }
    }

    #[test]
    fn parses_req_with_multiple_filters() {
        let frame = r#"["REQ", "sub1", {"kinds": [1]}, {"authors": ["ab"]}]"#;
        match ClientMessage::from_json(frame).unwrap() {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                assert_eq!(subscription_id, "sub1");
                assert_eq!(filters.len(), 2);
            }
            other => panic!("expected REQ, got {:?}", other),
        }
    }

    #[test]
    fn req_without_filters_is_an_error() {
        assert!(ClientMessage::from_json(r#"["REQ", "sub1"]"#).is_err());
    }

    #[test]
    fn unknown_verb_becomes_invalid() {
        match ClientMessage::from_json(r#"["PUBLISH", {}]"#).unwrap() {
            ClientMessage::Invalid { reason } => assert!(reason.contains("PUBLISH")),
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(ClientMessage::from_json("not json").is_err());
        assert!(ClientMessage::from_json("{}").is_err());
    }

    #[test]
    fn renders_wire_frames() {
        let ok = RelayMessage::ok("abcd", true, "");
        assert_eq!(ok.as_json(), r#"["OK","abcd",true,""]"#);

        let eose = RelayMessage::eose("sub");
        assert_eq!(eose.as_json(), r#"["EOSE","sub"]"#);

        let notice = RelayMessage::notice("oops");
        assert_eq!(notice.as_json(), r#"["NOTICE","oops"]"#);

        let auth = RelayMessage::auth("nonce");
        assert_eq!(auth.as_json(), r#"["AUTH","nonce"]"#);

        let count = RelayMessage::count("sub", 3);
        assert_eq!(count.as_json(), r#"["COUNT","sub",{"count":3}]"#);
    }

    #[test]
    fn converter_turns_garbage_into_invalid() {
        let converter = NostrMessageConverter;
        match converter.inbound_from_string("garbage".to_string()).unwrap() {
            Some(ClientMessage::Invalid { .. }) => {}
            other => panic!("expected Invalid, got {:?}", other),
        }
    }
}
