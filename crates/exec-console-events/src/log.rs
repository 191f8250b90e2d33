//! Per-channel reconciliation of replayed history with live events.

use serde::{Deserialize, Serialize};

use crate::protocol::ReplayEntry;

/// Where a log entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOrigin {
    /// Part of an initial replay batch (or a static log snapshot).
    Replayed,
    /// Streamed after the replay.
    Live,
}

/// Stream discriminator for differentiated rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// One immutable log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Locally assigned sequence number, strictly monotonic per channel.
    pub seq: u64,
    pub origin: LogOrigin,
    pub stream: LogStream,
    /// Epoch milliseconds; absent for replayed entries.
    pub timestamp: Option<i64>,
    pub text: String,
}

/// Ordered, de-duplicated log view of one channel.
///
/// A join yields exactly one replay batch, after which live entries append
/// in arrival order. A fresh replay (after a rejoin) is authoritative: it
/// supersedes whatever accumulated before the disconnection, while sequence
/// numbers keep counting up. History is best-effort: the server bounds the
/// replay batch and no gap recovery is attempted for events missed while
/// disconnected.
#[derive(Debug, Clone, Default)]
pub struct ChannelLog {
    entries: Vec<LogEntry>,
    next_seq: u64,
}

impl ChannelLog {
    /// Create an empty log.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 0,
        }
    }

    /// Apply the replay batch received after a successful join.
    ///
    /// Supersedes any entries accumulated before a disconnection; sequence
    /// numbers continue from the running counter so consumers can tell a
    /// fresh batch from the one it replaced.
    pub fn apply_replay(&mut self, batch: &[ReplayEntry]) {
        self.entries.clear();
        self.entries.reserve(batch.len());
        for entry in batch {
            let seq = self.take_seq();
            self.entries.push(LogEntry {
                seq,
                origin: LogOrigin::Replayed,
                stream: entry.stream,
                timestamp: None,
                text: entry.text.clone(),
            });
        }
    }

    /// Append a live entry in arrival order.
    pub fn push_live(&mut self, stream: LogStream, text: impl Into<String>, timestamp: Option<i64>) {
        let seq = self.take_seq();
        self.entries.push(LogEntry {
            seq,
            origin: LogOrigin::Live,
            stream,
            timestamp,
            text: text.into(),
        });
    }

    /// Entries in order.
    #[must_use]
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replay(lines: &[&str]) -> Vec<ReplayEntry> {
        lines
            .iter()
            .map(|text| ReplayEntry {
                stream: LogStream::Stdout,
                text: (*text).to_string(),
            })
            .collect()
    }

    fn texts(log: &ChannelLog) -> Vec<&str> {
        log.entries().iter().map(|e| e.text.as_str()).collect()
    }

    #[test]
    fn replay_then_live_order() {
        // Scenario: join, replay of two entries, then one live line.
        let mut log = ChannelLog::new();
        log.apply_replay(&replay(&["start", "loading"]));
        log.push_live(LogStream::Stdout, "step 1 done", Some(1_700_000_000_000));

        assert_eq!(texts(&log), vec!["start", "loading", "step 1 done"]);
        assert_eq!(log.entries()[0].origin, LogOrigin::Replayed);
        assert_eq!(log.entries()[2].origin, LogOrigin::Live);
    }

    #[test]
    fn replayed_entries_have_no_timestamp() {
        let mut log = ChannelLog::new();
        log.apply_replay(&replay(&["a"]));
        assert_eq!(log.entries()[0].timestamp, None);
    }

    #[test]
    fn live_entries_preserve_arrival_order() {
        let mut log = ChannelLog::new();
        log.apply_replay(&[]);
        for i in 0..5 {
            log.push_live(LogStream::Stdout, format!("line {i}"), None);
        }
        let expected: Vec<String> = (0..5).map(|i| format!("line {i}")).collect();
        assert_eq!(texts(&log), expected);
    }

    #[test]
    fn fresh_replay_supersedes_prior_entries() {
        let mut log = ChannelLog::new();
        log.apply_replay(&replay(&["old 1", "old 2"]));
        log.push_live(LogStream::Stdout, "old live", None);

        // Rejoin after a drop: the new batch replaces, not appends.
        log.apply_replay(&replay(&["fresh 1", "fresh 2", "fresh 3"]));
        assert_eq!(texts(&log), vec!["fresh 1", "fresh 2", "fresh 3"]);
    }

    #[test]
    fn sequence_numbers_monotonic_across_supersession() {
        let mut log = ChannelLog::new();
        log.apply_replay(&replay(&["a", "b"])); // seq 0, 1
        log.push_live(LogStream::Stderr, "c", None); // seq 2
        log.apply_replay(&replay(&["d"])); // seq 3

        assert_eq!(log.entries()[0].seq, 3);
        log.push_live(LogStream::Stdout, "e", None);
        assert_eq!(log.entries()[1].seq, 4);
    }

    #[test]
    fn stream_discriminators_kept() {
        let mut log = ChannelLog::new();
        log.push_live(LogStream::Stderr, "err", None);
        log.push_live(LogStream::System, "sys", None);
        assert_eq!(log.entries()[0].stream, LogStream::Stderr);
        assert_eq!(log.entries()[1].stream, LogStream::System);
    }

    #[test]
    fn empty_log() {
        let log = ChannelLog::new();
        assert!(log.is_empty());
        assert_eq!(log.len(), 0);
    }
}
