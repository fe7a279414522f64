//! Process-wide configuration toggles, per the external interface contract.

use serde::{Deserialize, Serialize};

/// Default cap on stored messages per peer before the oldest are evicted.
pub const DEFAULT_MESSAGE_CAP: usize = 1000;

/// Default message retention window, in days.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Recognized process-wide configuration toggles and their defaults.
///
/// Loaded and persisted the same way the encrypted stores are: a plain
/// struct with a `Default` impl, round-tripped through [`crate::keystore`]-
/// wrapped storage by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Gates every write in [`crate::message::MessageStore`] and
    /// [`crate::contact::ContactStore`]. Off by default: nothing is
    /// written to disk until the user opts in.
    pub persistence_enabled: bool,
    /// When set, inbound messages from non-contacts are filtered before
    /// reaching the conversation engine.
    pub show_contacts_only: bool,
    /// When set, unsolicited contact-exchange requests are accepted
    /// automatically instead of requiring explicit confirmation.
    pub accept_friend_requests: bool,
    /// Retention cutoff, in days, applied by
    /// [`crate::message::MessageStore::apply_retention`].
    pub message_retention_days: u32,
    /// Per-peer message cap enforced after every save.
    pub message_cap: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            persistence_enabled: false,
            show_contacts_only: false,
            accept_friend_requests: false,
            message_retention_days: DEFAULT_RETENTION_DAYS,
            message_cap: DEFAULT_MESSAGE_CAP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_external_interface_contract() {
        let cfg = Config::default();
        assert!(!cfg.persistence_enabled);
        assert!(!cfg.show_contacts_only);
        assert!(!cfg.accept_friend_requests);
        assert_eq!(cfg.message_retention_days, 30);
        assert_eq!(cfg.message_cap, 1000);
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = Config {
            persistence_enabled: true,
            ..Config::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }
}
