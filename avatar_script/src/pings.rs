//! Compact remote calls between a script and its peer copies.
//!
//! Every exposed function name gets a 16-bit id at load time. Peers running
//! the same script register the same names in the same order, so only the id
//! and the argument payload cross the wire.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use avatar_wire::WirePing;
use serde_json::Value;
use thiserror::Error;

use crate::lock;
use crate::participant::Participant;

pub type PingId = i16;
pub type PingPayload = Value;

/// First id handed out by a fresh table.
pub const FIRST_PING_ID: PingId = PingId::MIN;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PingError {
    #[error("ping id {0} is not registered")]
    UnknownId(PingId),
    #[error("ping '{0}' is not registered")]
    UnknownName(String),
    #[error("ping '{name}' (id {id}) does not name a function")]
    NotAFunction { id: PingId, name: String },
    #[error("ping table is full, cannot register '{0}'")]
    TableFull(String),
}

/// Outgoing call as it is handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Ping {
    pub id: PingId,
    pub payload: PingPayload,
}

impl From<Ping> for WirePing {
    fn from(ping: Ping) -> Self {
        WirePing {
            id: ping.id,
            args: ping.payload,
        }
    }
}

impl From<WirePing> for Ping {
    fn from(wire: WirePing) -> Self {
        Ping {
            id: wire.id,
            payload: wire.args,
        }
    }
}

/// Incoming call whose id has been resolved to a function name.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingPing {
    pub id: PingId,
    pub name: String,
    pub payload: PingPayload,
}

/// Bidirectional id ↔ name table with sequential allocation.
///
/// Registering a name twice hands out a second id that also resolves to it;
/// name lookups keep answering with the first one.
#[derive(Debug)]
pub struct PingTable {
    names: BTreeMap<PingId, String>,
    ids: HashMap<String, PingId>,
    next: Option<PingId>,
}

impl Default for PingTable {
    fn default() -> Self {
        Self {
            names: BTreeMap::new(),
            ids: HashMap::new(),
            next: Some(FIRST_PING_ID),
        }
    }
}

impl PingTable {
    pub fn register(&mut self, name: &str) -> Result<PingId, PingError> {
        let id = self
            .next
            .ok_or_else(|| PingError::TableFull(name.to_string()))?;
        self.next = id.checked_add(1);
        self.names.insert(id, name.to_string());
        if let Some(existing) = self.ids.get(name) {
            log::warn!("[avatar_script] ping '{name}' registered again as {id} (first id {existing})");
        } else {
            self.ids.insert(name.to_string(), id);
        }
        Ok(id)
    }

    pub fn name(&self, id: PingId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    pub fn id_of(&self, name: &str) -> Option<PingId> {
        self.ids.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Ping table plus the two queues of one instance.
#[derive(Debug, Default)]
pub struct PingChannel {
    table: Mutex<PingTable>,
    incoming: Mutex<VecDeque<IncomingPing>>,
    outgoing: Mutex<Vec<Ping>>,
}

impl PingChannel {
    pub fn register_name(&self, name: &str) -> Result<PingId, PingError> {
        lock(&self.table).register(name)
    }

    pub fn resolve(&self, id: PingId) -> Option<String> {
        lock(&self.table).name(id).map(str::to_string)
    }

    pub fn id_of(&self, name: &str) -> Option<PingId> {
        lock(&self.table).id_of(name)
    }

    pub fn registered(&self) -> usize {
        lock(&self.table).len()
    }

    /// Resolves `id` and queues the call for the next tick.
    pub fn submit_incoming(&self, id: PingId, payload: PingPayload) -> Result<(), PingError> {
        let name = self.resolve(id).ok_or(PingError::UnknownId(id))?;
        lock(&self.incoming).push_back(IncomingPing { id, name, payload });
        Ok(())
    }

    /// Queues a call to `name` on every peer copy.
    pub fn queue_outgoing(&self, name: &str, payload: PingPayload) -> Result<PingId, PingError> {
        let id = self
            .id_of(name)
            .ok_or_else(|| PingError::UnknownName(name.to_string()))?;
        lock(&self.outgoing).push(Ping { id, payload });
        Ok(id)
    }

    pub fn take_incoming(&self) -> VecDeque<IncomingPing> {
        std::mem::take(&mut *lock(&self.incoming))
    }

    pub fn take_outgoing(&self) -> Vec<Ping> {
        std::mem::take(&mut *lock(&self.outgoing))
    }

    pub fn pending_incoming(&self) -> usize {
        lock(&self.incoming).len()
    }

    pub fn pending_outgoing(&self) -> usize {
        lock(&self.outgoing).len()
    }
}

/// Ships a tick's worth of outgoing pings to the participant's peers.
pub trait PingTransport: Send + Sync {
    fn send_batch(&self, sender: &Participant, batch: Vec<Ping>);
}

impl fmt::Debug for dyn PingTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PingTransport")
    }
}

/// Transport for hosts without a network; batches are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTransport;

impl PingTransport for NullTransport {
    fn send_batch(&self, sender: &Participant, batch: Vec<Ping>) {
        log::debug!(
            "[avatar_script] dropping {} pings from {}",
            batch.len(),
            sender.id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_start_at_minimum_and_resolve_back() {
        let mut table = PingTable::default();
        let names = ["wave", "jump", "dance"];
        let ids: Vec<PingId> = names
            .iter()
            .map(|name| table.register(name).expect("room in table"))
            .collect();
        assert_eq!(ids, vec![i16::MIN, i16::MIN + 1, i16::MIN + 2]);
        for (id, name) in ids.iter().zip(names) {
            assert_eq!(table.name(*id), Some(name));
            assert_eq!(table.id_of(name), Some(*id));
        }
    }

    #[test]
    fn duplicate_names_leak_a_second_id() {
        let mut table = PingTable::default();
        let first = table.register("wave").expect("room in table");
        let second = table.register("wave").expect("room in table");
        assert_ne!(first, second);
        assert_eq!(table.name(first), Some("wave"));
        assert_eq!(table.name(second), Some("wave"));
        assert_eq!(table.id_of("wave"), Some(first));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn exhausted_table_refuses_instead_of_wrapping() {
        let mut table = PingTable::default();
        for index in 0..=u16::MAX as u32 {
            table
                .register(&format!("f{index}"))
                .expect("every 16-bit id is available once");
        }
        assert_eq!(
            table.register("overflow"),
            Err(PingError::TableFull("overflow".to_string()))
        );
        assert_eq!(table.name(i16::MIN), Some("f0"));
        assert_eq!(table.name(i16::MAX), Some("f65535"));
    }

    #[test]
    fn incoming_pings_keep_submission_order() {
        let channel = PingChannel::default();
        let a = channel.register_name("a").expect("register");
        let b = channel.register_name("b").expect("register");
        let c = channel.register_name("c").expect("register");
        for (id, n) in [(a, 1), (b, 2), (c, 3)] {
            channel.submit_incoming(id, json!(n)).expect("known id");
        }
        let drained: Vec<String> = channel
            .take_incoming()
            .into_iter()
            .map(|ping| ping.name)
            .collect();
        assert_eq!(drained, vec!["a", "b", "c"]);
        assert_eq!(channel.pending_incoming(), 0);
    }

    #[test]
    fn unknown_ids_and_names_are_rejected() {
        let channel = PingChannel::default();
        assert_eq!(
            channel.submit_incoming(12, Value::Null),
            Err(PingError::UnknownId(12))
        );
        assert_eq!(
            channel.queue_outgoing("nope", Value::Null),
            Err(PingError::UnknownName("nope".to_string()))
        );
    }

    #[test]
    fn outgoing_queue_drains_as_one_batch() {
        let channel = PingChannel::default();
        let id = channel.register_name("wave").expect("register");
        channel.queue_outgoing("wave", json!(1)).expect("queue");
        channel.queue_outgoing("wave", json!(2)).expect("queue");
        let batch = channel.take_outgoing();
        assert_eq!(
            batch,
            vec![
                Ping { id, payload: json!(1) },
                Ping { id, payload: json!(2) },
            ]
        );
        assert!(channel.take_outgoing().is_empty());
    }
}
