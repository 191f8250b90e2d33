//! Channel membership registry.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

use exec_console_events::ChannelId;

/// Membership state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipState {
    /// Join requested (or deferred); not yet acknowledged by the server.
    Pending,
    /// Join acknowledged; live events for the channel are trusted.
    Joined,
    /// Left, or demoted after an explicit teardown.
    Left,
}

struct Membership {
    state: MembershipState,
    last_joined_at: Option<Instant>,
}

/// Tracks which channels the link has joined, is joining, or has left.
///
/// Membership survives disconnects: after a drop every joined channel is
/// demoted to `Pending` and re-sent on the next successful negotiation, so
/// a channel is never considered live-ready until the server re-confirms it.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<ChannelId, Membership>>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record intent to join.
    ///
    /// Returns `false` when the channel is already pending or joined, which
    /// makes issuing join twice a no-op.
    pub fn want_join(&self, id: &str) -> bool {
        let mut channels = self.channels.write().unwrap();
        match channels.get_mut(id) {
            Some(membership)
                if matches!(
                    membership.state,
                    MembershipState::Pending | MembershipState::Joined
                ) =>
            {
                false
            }
            Some(membership) => {
                membership.state = MembershipState::Pending;
                true
            }
            None => {
                channels.insert(
                    id.to_string(),
                    Membership {
                        state: MembershipState::Pending,
                        last_joined_at: None,
                    },
                );
                true
            }
        }
    }

    /// Confirm membership on a server ack.
    ///
    /// Returns `false` for channels that are not tracked (or already left);
    /// such acks are stale and must be ignored.
    pub fn mark_joined(&self, id: &str) -> bool {
        let mut channels = self.channels.write().unwrap();
        match channels.get_mut(id) {
            Some(membership) if membership.state != MembershipState::Left => {
                membership.state = MembershipState::Joined;
                membership.last_joined_at = Some(Instant::now());
                true
            }
            _ => false,
        }
    }

    /// Mark a channel left. Returns `false` when it was not tracked.
    pub fn mark_left(&self, id: &str) -> bool {
        let mut channels = self.channels.write().unwrap();
        match channels.get_mut(id) {
            Some(membership) if membership.state != MembershipState::Left => {
                membership.state = MembershipState::Left;
                true
            }
            _ => false,
        }
    }

    /// Demote every pending or joined channel to `Pending`.
    ///
    /// Called when the connection is lost: live events for these channels
    /// are untrusted until the server acknowledges a fresh join.
    pub fn mark_all_pending(&self) {
        let mut channels = self.channels.write().unwrap();
        for membership in channels.values_mut() {
            if membership.state == MembershipState::Joined {
                membership.state = MembershipState::Pending;
            }
        }
    }

    /// Channels awaiting a (re)join, in no particular order.
    #[must_use]
    pub fn pending(&self) -> Vec<ChannelId> {
        let channels = self.channels.read().unwrap();
        channels
            .iter()
            .filter(|(_, m)| m.state == MembershipState::Pending)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Whether live events for the channel are currently trusted.
    #[must_use]
    pub fn is_joined(&self, id: &str) -> bool {
        self.state(id) == Some(MembershipState::Joined)
    }

    /// Whether the channel is pending or joined.
    #[must_use]
    pub fn is_tracked(&self, id: &str) -> bool {
        matches!(
            self.state(id),
            Some(MembershipState::Pending | MembershipState::Joined)
        )
    }

    /// Current membership state, if the channel was ever joined.
    #[must_use]
    pub fn state(&self, id: &str) -> Option<MembershipState> {
        self.channels.read().unwrap().get(id).map(|m| m.state)
    }

    /// Time of the last acknowledged join.
    #[must_use]
    pub fn last_joined_at(&self, id: &str) -> Option<Instant> {
        self.channels
            .read()
            .unwrap()
            .get(id)
            .and_then(|m| m.last_joined_at)
    }
}
