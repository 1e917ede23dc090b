use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error as ThisError;

use crate::frame::Frame;

/// An unsolicited reply: a pub/sub notification arriving while no request is
/// pending on the connection.
#[derive(Clone, Debug, PartialEq)]
pub enum PushMessage {
    Message {
        channel: Bytes,
        payload: Bytes,
    },
    PatternMessage {
        pattern: Bytes,
        channel: Bytes,
        payload: Bytes,
    },
    Subscribed {
        channel: Bytes,
        subscriptions: i64,
    },
    PatternSubscribed {
        pattern: Bytes,
        subscriptions: i64,
    },
    Unsubscribed {
        channel: Bytes,
        subscriptions: i64,
    },
    PatternUnsubscribed {
        pattern: Bytes,
        subscriptions: i64,
    },
}

#[derive(Debug, ThisError)]
#[error("invalid subscription message: {frame}")]
pub struct InvalidPushMessage {
    pub frame: Frame,
}

impl PushMessage {
    /// Classifies a frame arriving with no pending request. It must be an
    /// array of 3 or 4 elements whose first element names one of the six
    /// push kinds, byte-for-byte. Anything else is a protocol violation and
    /// the caller is expected to tear the connection down.
    pub fn classify(frame: &Frame) -> Result<PushMessage, InvalidPushMessage> {
        let invalid = || InvalidPushMessage {
            frame: frame.clone(),
        };

        let items = match frame {
            Frame::Array(items) if items.len() == 3 || items.len() == 4 => items,
            _ => return Err(invalid()),
        };

        let kind = match &items[0] {
            Frame::Bulk(bytes) => bytes.as_ref(),
            _ => return Err(invalid()),
        };

        let bulk = |frame: &Frame| match frame {
            Frame::Bulk(bytes) => Some(bytes.clone()),
            _ => None,
        };
        let integer = |frame: &Frame| match frame {
            Frame::Integer(n) => Some(*n),
            _ => None,
        };

        let message = match (kind, items.len()) {
            (b"message", 3) => PushMessage::Message {
                channel: bulk(&items[1]).ok_or_else(invalid)?,
                payload: bulk(&items[2]).ok_or_else(invalid)?,
            },
            (b"pmessage", 4) => PushMessage::PatternMessage {
                pattern: bulk(&items[1]).ok_or_else(invalid)?,
                channel: bulk(&items[2]).ok_or_else(invalid)?,
                payload: bulk(&items[3]).ok_or_else(invalid)?,
            },
            (b"subscribe", 3) => PushMessage::Subscribed {
                channel: bulk(&items[1]).ok_or_else(invalid)?,
                subscriptions: integer(&items[2]).ok_or_else(invalid)?,
            },
            (b"psubscribe", 3) => PushMessage::PatternSubscribed {
                pattern: bulk(&items[1]).ok_or_else(invalid)?,
                subscriptions: integer(&items[2]).ok_or_else(invalid)?,
            },
            (b"unsubscribe", 3) => PushMessage::Unsubscribed {
                channel: bulk(&items[1]).ok_or_else(invalid)?,
                subscriptions: integer(&items[2]).ok_or_else(invalid)?,
            },
            (b"punsubscribe", 3) => PushMessage::PatternUnsubscribed {
                pattern: bulk(&items[1]).ok_or_else(invalid)?,
                subscriptions: integer(&items[2]).ok_or_else(invalid)?,
            },
            _ => return Err(invalid()),
        };

        Ok(message)
    }
}

/// Callback interface for subscription traffic. All methods default to
/// no-ops so implementors only override what they care about. Channel,
/// pattern and payload slices are byte-exact copies of the wire data.
pub trait SubscriptionListener: Send + Sync {
    fn on_message(&self, _channel: &[u8], _payload: &[u8]) {}
    fn on_pattern_message(&self, _pattern: &[u8], _channel: &[u8], _payload: &[u8]) {}
    fn on_subscribed(&self, _channel: &[u8], _subscriptions: i64) {}
    fn on_pattern_subscribed(&self, _pattern: &[u8], _subscriptions: i64) {}
    fn on_unsubscribed(&self, _channel: &[u8], _subscriptions: i64) {}
    fn on_pattern_unsubscribed(&self, _pattern: &[u8], _subscriptions: i64) {}
}

pub(crate) fn dispatch(message: &PushMessage, listeners: &[Arc<dyn SubscriptionListener>]) {
    for listener in listeners {
        match message {
            PushMessage::Message { channel, payload } => listener.on_message(channel, payload),
            PushMessage::PatternMessage {
                pattern,
                channel,
                payload,
            } => listener.on_pattern_message(pattern, channel, payload),
            PushMessage::Subscribed {
                channel,
                subscriptions,
            } => listener.on_subscribed(channel, *subscriptions),
            PushMessage::PatternSubscribed {
                pattern,
                subscriptions,
            } => listener.on_pattern_subscribed(pattern, *subscriptions),
            PushMessage::Unsubscribed {
                channel,
                subscriptions,
            } => listener.on_unsubscribed(channel, *subscriptions),
            PushMessage::PatternUnsubscribed {
                pattern,
                subscriptions,
            } => listener.on_pattern_unsubscribed(pattern, *subscriptions),
        }
    }
}
