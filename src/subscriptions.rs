use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use glob_match::glob_match;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::frame::Frame;

/// Server-side registry of channel and pattern subscribers.
///
/// Each connection registers one push sender; published messages are fanned
/// out as `message`/`pmessage` frames through it, interleaved by the
/// connection driver with its regular replies.
#[derive(Clone, Default)]
pub struct Subscriptions {
    sessions: Arc<Mutex<HashMap<Uuid, Session>>>,
}

struct Session {
    sender: UnboundedSender<Frame>,
    channels: HashSet<String>,
    patterns: HashSet<String>,
}

impl Session {
    fn new(sender: UnboundedSender<Frame>) -> Session {
        Session {
            sender,
            channels: HashSet::new(),
            patterns: HashSet::new(),
        }
    }

    fn count(&self) -> usize {
        self.channels.len() + self.patterns.len()
    }
}

impl Subscriptions {
    pub fn new() -> Subscriptions {
        Subscriptions::default()
    }

    /// Registers `session` for `channel`; returns the session's subscription
    /// count afterwards.
    pub fn subscribe(
        &self,
        session: Uuid,
        sender: &UnboundedSender<Frame>,
        channel: String,
    ) -> usize {
        let mut sessions = self.sessions.lock().unwrap();
        let entry = sessions
            .entry(session)
            .or_insert_with(|| Session::new(sender.clone()));
        entry.channels.insert(channel);
        entry.count()
    }

    pub fn psubscribe(
        &self,
        session: Uuid,
        sender: &UnboundedSender<Frame>,
        pattern: String,
    ) -> usize {
        let mut sessions = self.sessions.lock().unwrap();
        let entry = sessions
            .entry(session)
            .or_insert_with(|| Session::new(sender.clone()));
        entry.patterns.insert(pattern);
        entry.count()
    }

    pub fn unsubscribe(&self, session: Uuid, channel: &str) -> usize {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(&session) {
            Some(entry) => {
                entry.channels.remove(channel);
                entry.count()
            }
            None => 0,
        }
    }

    pub fn punsubscribe(&self, session: Uuid, pattern: &str) -> usize {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(&session) {
            Some(entry) => {
                entry.patterns.remove(pattern);
                entry.count()
            }
            None => 0,
        }
    }

    pub fn channels_of(&self, session: Uuid) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(&session)
            .map(|entry| entry.channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn patterns_of(&self, session: Uuid) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(&session)
            .map(|entry| entry.patterns.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Delivers `payload` to every exact-channel and matching-pattern
    /// subscriber. Returns the number of deliveries, which is what PUBLISH
    /// replies with. A client subscribed both ways receives the message
    /// twice, once per route, matching Redis semantics.
    pub fn publish(&self, channel: &str, payload: &Bytes) -> i64 {
        let sessions = self.sessions.lock().unwrap();
        let mut receivers = 0;

        for session in sessions.values() {
            if session.channels.contains(channel) {
                let frame = Frame::Array(vec![
                    Frame::Bulk(Bytes::from("message")),
                    Frame::Bulk(Bytes::copy_from_slice(channel.as_bytes())),
                    Frame::Bulk(payload.clone()),
                ]);
                if session.sender.send(frame).is_ok() {
                    receivers += 1;
                }
            }
            for pattern in &session.patterns {
                if glob_match(pattern, channel) {
                    let frame = Frame::Array(vec![
                        Frame::Bulk(Bytes::from("pmessage")),
                        Frame::Bulk(Bytes::copy_from_slice(pattern.as_bytes())),
                        Frame::Bulk(Bytes::copy_from_slice(channel.as_bytes())),
                        Frame::Bulk(payload.clone()),
                    ]);
                    if session.sender.send(frame).is_ok() {
                        receivers += 1;
                    }
                }
            }
        }

        receivers
    }

    /// Drops every subscription a disconnecting session holds.
    pub fn remove_session(&self, session: Uuid) {
        self.sessions.lock().unwrap().remove(&session);
    }
}
