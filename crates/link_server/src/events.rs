//! Domain events relayed to websocket peers.
//!
//! The in-engine script reports gameplay activity as named events. Instead of
//! a free-form string map, the names are a closed enumeration: every event the
//! bridge can relay is an [`EventKind`] with a stable numeric code that peers
//! receive alongside the name.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Every relayable event, with the numeric code sent on the wire.
///
/// Codes 1 through 17 are fixed by existing clients. `PlayerBreak` and
/// `PlayersUpdate` are emitted by the script as well and were appended
/// after them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PlayerSpawned,
    PlayerLeave,
    PlayerMessage,
    PlayerGamemodeChange,
    PlayerPlace,
    Weather,
    Death,
    Explosion,
    GameruleChange,
    ItemUse,
    ItemUseOn,
    PlayerInteractBlock,
    PlayerInteractEntity,
    Backup,
    Started,
    Stopped,
    Errored,
    PlayerBreak,
    PlayersUpdate,
}

impl EventKind {
    pub const ALL: [EventKind; 19] = [
        EventKind::PlayerSpawned,
        EventKind::PlayerLeave,
        EventKind::PlayerMessage,
        EventKind::PlayerGamemodeChange,
        EventKind::PlayerPlace,
        EventKind::Weather,
        EventKind::Death,
        EventKind::Explosion,
        EventKind::GameruleChange,
        EventKind::ItemUse,
        EventKind::ItemUseOn,
        EventKind::PlayerInteractBlock,
        EventKind::PlayerInteractEntity,
        EventKind::Backup,
        EventKind::Started,
        EventKind::Stopped,
        EventKind::Errored,
        EventKind::PlayerBreak,
        EventKind::PlayersUpdate,
    ];

    /// The event name used by the script and by subscribers.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::PlayerSpawned => "Player Spawned",
            EventKind::PlayerLeave => "Player Leave",
            EventKind::PlayerMessage => "Player Message",
            EventKind::PlayerGamemodeChange => "Player Gamemode Change",
            EventKind::PlayerPlace => "Player Place",
            EventKind::Weather => "Weather",
            EventKind::Death => "Death",
            EventKind::Explosion => "Explosion",
            EventKind::GameruleChange => "Gamerule Change",
            EventKind::ItemUse => "Item Use",
            EventKind::ItemUseOn => "Item Use On",
            EventKind::PlayerInteractBlock => "Player Interact Block",
            EventKind::PlayerInteractEntity => "Player Interact Entity",
            EventKind::Backup => "Backup",
            EventKind::Started => "Started",
            EventKind::Stopped => "Stopped",
            EventKind::Errored => "Errored",
            EventKind::PlayerBreak => "Player Break",
            EventKind::PlayersUpdate => "Players Update",
        }
    }

    pub fn code(self) -> u8 {
        match self {
            EventKind::PlayerSpawned => 1,
            EventKind::PlayerLeave => 2,
            EventKind::PlayerMessage => 3,
            EventKind::PlayerGamemodeChange => 4,
            EventKind::PlayerPlace => 5,
            EventKind::Weather => 6,
            EventKind::Death => 7,
            EventKind::Explosion => 8,
            EventKind::GameruleChange => 9,
            EventKind::ItemUse => 10,
            EventKind::ItemUseOn => 11,
            EventKind::PlayerInteractBlock => 12,
            EventKind::PlayerInteractEntity => 13,
            EventKind::Backup => 14,
            EventKind::Started => 15,
            EventKind::Stopped => 16,
            EventKind::Errored => 17,
            EventKind::PlayerBreak => 18,
            EventKind::PlayersUpdate => 19,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for EventKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        EventKind::from_name(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown event '{name}'")))
    }
}

/// A domain event ready to be relayed.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub kind: EventKind,
    pub data: Value,
}

impl DomainEvent {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self { kind, data }
    }

    /// Builds an event from a script event name; `None` for names outside the taxonomy.
    pub fn from_script(name: &str, payload: Option<Value>) -> Option<Self> {
        EventKind::from_name(name).map(|kind| Self::new(kind, payload.unwrap_or(Value::Null)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_unique_and_stable() {
        let mut codes: Vec<u8> = EventKind::ALL.iter().map(|k| k.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), EventKind::ALL.len());

        assert_eq!(EventKind::PlayerSpawned.code(), 1);
        assert_eq!(EventKind::Backup.code(), 14);
        assert_eq!(EventKind::Errored.code(), 17);
    }

    #[test]
    fn test_name_lookup() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(EventKind::from_name("World Initialized"), None);
        assert_eq!(EventKind::from_name("player spawned"), None);
    }

    #[test]
    fn test_from_script_defaults_to_null() {
        let event = DomainEvent::from_script("Weather", None).unwrap();
        assert_eq!(event.kind, EventKind::Weather);
        assert_eq!(event.data, Value::Null);
        assert!(DomainEvent::from_script("callback", None).is_none());
    }
}
