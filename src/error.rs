use crate::message::RelayMessage;
use crate::session::ConnectionState;
use anyhow::Result;
use snafu::{Backtrace, Snafu};
use tracing::{error, warn};
use wspipe::{InboundContext, SendMessage};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{message}"))]
    Notice {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("auth-required: {message}"))]
    AuthRequired {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("restricted: {message}"))]
    Restricted {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("duplicate: {message}"))]
    Duplicate {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("internal error: {message}"))]
    Internal {
        message: String,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn notice<S: Into<String>>(message: S) -> Self {
        Error::Notice {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn auth_required<S: Into<String>>(message: S) -> Self {
        Error::AuthRequired {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn restricted<S: Into<String>>(message: S) -> Self {
        Error::Restricted {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn duplicate<S: Into<String>>(message: S) -> Self {
        Error::Duplicate {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Self {
        Error::internal(format!("database error: {error}"))
    }
}

/// Identifies which client message an error is answering, which determines
/// the terminal wire message: event failures get `OK false`, everything
/// else gets a `NOTICE`.
pub enum ClientMessageId {
    Event(String),
    Subscription(String),
}

impl Error {
    fn to_messages_for_subscription(&self, state: &mut ConnectionState) -> Vec<RelayMessage> {
        match self {
            Error::Notice { message, .. }
            | Error::Restricted { message, .. }
            | Error::Duplicate { message, .. } => {
                warn!("rejected subscription: {}", message);
                vec![RelayMessage::notice(self.to_string())]
            }
            Error::AuthRequired { message, .. } => {
                warn!("subscription needs auth: {}", message);
                vec![
                    state.challenge_message(),
                    RelayMessage::notice(self.to_string()),
                ]
            }
            Error::Internal { message, .. } => {
                error!("internal error: {}", message);
                vec![RelayMessage::notice("internal error")]
            }
        }
    }

    fn to_messages_for_event(
        &self,
        state: &mut ConnectionState,
        event_id: String,
    ) -> Vec<RelayMessage> {
        match self {
            Error::Notice { .. } | Error::Restricted { .. } | Error::Duplicate { .. } => {
                vec![RelayMessage::ok(event_id, false, self.to_string())]
            }
            Error::AuthRequired { .. } => {
                vec![
                    state.challenge_message(),
                    RelayMessage::ok(event_id, false, self.to_string()),
                ]
            }
            Error::Internal { message, .. } => {
                error!("internal error: {}", message);
                vec![RelayMessage::ok(event_id, false, "error: internal error")]
            }
        }
    }

    /// Answers a failed client message with its terminal wire message(s).
    pub async fn respond<CM>(
        &self,
        ctx: &mut InboundContext<'_, ConnectionState, CM, RelayMessage>,
        client_message_id: ClientMessageId,
    ) -> Result<()>
    where
        CM: Send + Sync + 'static,
    {
        let messages = match client_message_id {
            ClientMessageId::Event(event_id) => self.to_messages_for_event(ctx.state, event_id),
            ClientMessageId::Subscription(_) => self.to_messages_for_subscription(ctx.state),
        };

        for message in messages {
            if let Err(e) = ctx.send_message(message).await {
                error!("failed to send error response: {:?}", e);
            }
        }
        Ok(())
    }
}
