/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Append-only, timestamped record of human-readable status lines.

Every producer (identity resolution, certificate resolution, transport status events) appends
through the same lock, so entry ids are strictly increasing and gap-free in append order.
 */

use chrono::Local;
use log::*;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const LISTENER_CAPACITY: usize = 256;

/// A single line of the event log
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogEntry {

    /// strictly increasing, starting at 1
    pub id: u64,

    /// local time of the append
    pub timestamp: String,

    /// human-readable text
    pub body: String,
}

struct EventLogState {
    entries: Vec<LogEntry>,
    next_id: u64,
}

/// Shared, cloneable handle to an append-only event log.
#[derive(Clone)]
pub struct EventLog {
    state: Arc<Mutex<EventLogState>>,
    listeners: broadcast::Sender<LogEntry>,
}

impl Default for EventLog {
    fn default() -> Self {
        EventLog::new()
    }
}

impl EventLog {

    /// Creates a new, empty event log
    pub fn new() -> Self {
        let (listeners, _) = broadcast::channel(LISTENER_CAPACITY);

        EventLog {
            state: Arc::new(Mutex::new(EventLogState {
                entries: Vec::new(),
                next_id: 1,
            })),
            listeners,
        }
    }

    /// Appends a line and returns the entry that was recorded
    pub fn append(&self, body: impl Into<String>) -> LogEntry {
        let body = body.into();
        info!("{}", body);

        let mut state = self.state.lock().unwrap();
        let entry = LogEntry {
            id: state.next_id,
            timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
            body,
        };

        state.next_id += 1;
        state.entries.push(entry.clone());

        // sent under the lock so listeners observe append order
        let _ = self.listeners.send(entry.clone());

        entry
    }

    /// Snapshot of every entry recorded so far
    pub fn entries(&self) -> Vec<LogEntry> {
        self.state.lock().unwrap().entries.clone()
    }

    /// Number of entries recorded so far
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// True if nothing has been appended yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if any entry body equals `body`
    pub fn contains(&self, body: &str) -> bool {
        self.state.lock().unwrap().entries.iter().any(|entry| entry.body == body)
    }

    /// Receives every entry appended after this call
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.listeners.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn verify_ids_are_gap_free(entries: &[LogEntry]) {
        for (index, entry) in entries.iter().enumerate() {
            assert_eq!((index + 1) as u64, entry.id);
        }
    }

    #[test]
    fn append_assigns_increasing_ids() {
        let log = EventLog::new();
        assert!(log.is_empty());

        let first = log.append("first");
        let second = log.append("second");

        assert_eq!(1, first.id);
        assert_eq!(2, second.id);
        assert_eq!(TIMESTAMP_FORMAT.len() + 2, first.timestamp.len());
        assert_eq!(vec![first, second], log.entries());
        assert!(log.contains("second"));
        assert!(!log.contains("third"));
    }

    #[test]
    fn concurrent_appends_are_gap_free() {
        let log = EventLog::new();

        let producers : Vec<_> = (0..8).map(|producer| {
            let log = log.clone();
            thread::spawn(move || {
                for line in 0..250 {
                    log.append(format!("producer {} line {}", producer, line));
                }
            })
        }).collect();

        for producer in producers {
            producer.join().unwrap();
        }

        let entries = log.entries();
        assert_eq!(2000, entries.len());
        verify_ids_are_gap_free(&entries);
    }

    #[tokio::test]
    async fn listeners_see_entries_in_append_order() {
        let log = EventLog::new();
        let mut listener = log.subscribe();

        log.append("one");
        log.append("two");

        assert_eq!("one", listener.recv().await.unwrap().body);
        assert_eq!(2, listener.recv().await.unwrap().id);
    }
}
