//! Named-vote arbitration for shared current-limit resolutions.
//!
//! A [`Votable`] resolves the minimum of all standing client votes. The
//! supervisor is one voter among several system components (thermal policy,
//! user policy, adaptive input current logic); it never assumes exclusive
//! ownership of a resolution, it only places and withdraws its own named
//! votes and observes the resolved value.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;
use tracing::debug;

/// Input-current-limit resolution name.
pub const DC_ICL_VOTABLE: &str = "dc-input-limit";
/// Input-suspend resolution name (vote 0 to suspend input).
pub const DISABLE_INPUT_VOTABLE: &str = "disable-input";
/// Transmit-current-limit resolution name.
pub const TX_ICL_VOTABLE: &str = "tx-input-limit";

/// Supervisor session vote.
pub const WLC_VOTER: &str = "wlc";
/// Over-current backoff vote.
pub const OCP_VOTER: &str = "wlc-ocp";
/// Host property-surface vote.
pub const USER_VOTER: &str = "wlc-user";
/// BPP ramp vote.
pub const RAMP_VOTER: &str = "wlc-ramp";
/// Default transmit-limit vote placed at startup.
pub const RTX_DEFAULT_VOTER: &str = "wlc-rtx-default";
/// Thermal policy voter (owned by another system component).
pub const THERMAL_VOTER: &str = "thermal";

/// Minimum-wins named-vote resolution.
pub struct Votable {
    name: &'static str,
    votes: Mutex<HashMap<&'static str, u32>>,
    tx: watch::Sender<Option<u32>>,
}

impl Votable {
    pub fn new(name: &'static str) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            name,
            votes: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Place or replace `client`'s vote.
    pub fn vote(&self, client: &'static str, value: u32) {
        let effective = {
            let mut votes = self.votes.lock().unwrap();
            votes.insert(client, value);
            votes.values().min().copied()
        };
        debug!("{}: {} votes {} -> {:?}", self.name, client, value, effective);
        self.tx.send_replace(effective);
    }

    /// Withdraw `client`'s vote. Withdrawing a vote that is not standing is
    /// a no-op.
    pub fn withdraw(&self, client: &'static str) {
        let (removed, effective) = {
            let mut votes = self.votes.lock().unwrap();
            let removed = votes.remove(client).is_some();
            (removed, votes.values().min().copied())
        };
        if removed {
            debug!("{}: {} withdrawn -> {:?}", self.name, client, effective);
            self.tx.send_replace(effective);
        }
    }

    /// Resolved value: the minimum standing vote, `None` when no votes stand.
    pub fn effective(&self) -> Option<u32> {
        self.votes.lock().unwrap().values().min().copied()
    }

    /// The vote a specific client has standing, if any.
    pub fn client_vote(&self, client: &str) -> Option<u32> {
        self.votes.lock().unwrap().get(client).copied()
    }

    /// Observe resolution changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<u32>> {
        self.tx.subscribe()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_wins() {
        let v = Votable::new("test");
        assert_eq!(v.effective(), None);
        v.vote(WLC_VOTER, 1_100_000);
        v.vote(THERMAL_VOTER, 500_000);
        assert_eq!(v.effective(), Some(500_000));
        v.vote(THERMAL_VOTER, 2_000_000);
        assert_eq!(v.effective(), Some(1_100_000));
    }

    #[test]
    fn withdraw_is_idempotent() {
        let v = Votable::new("test");
        v.vote(WLC_VOTER, 700_000);
        v.withdraw(WLC_VOTER);
        v.withdraw(WLC_VOTER);
        assert_eq!(v.effective(), None);
    }

    #[test]
    fn client_votes_are_tracked_separately() {
        let v = Votable::new("test");
        v.vote(WLC_VOTER, 700_000);
        v.vote(OCP_VOTER, 600_000);
        assert_eq!(v.client_vote(OCP_VOTER), Some(600_000));
        assert_eq!(v.client_vote(THERMAL_VOTER), None);
        assert_eq!(v.effective(), Some(600_000));
    }

    #[tokio::test]
    async fn subscribers_observe_resolution_changes() {
        let v = Votable::new("test");
        let mut rx = v.subscribe();
        assert_eq!(*rx.borrow(), None);

        v.vote(THERMAL_VOTER, 0);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Some(0));

        v.withdraw(THERMAL_VOTER);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), None);
    }
}
