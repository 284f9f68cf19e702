// Per-wallet store of the (choice, salt) pairs needed to reveal. Every commit is
// written to a live map and an archive map; the archive outlives cleanup.
use crate::{
    room::Choice,
    storage::{
        SharedStore,
        write_json,
    },
};
use alloy_primitives::{
    Address,
    B256,
};
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::{
    Map,
    Value,
};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSecret {
    pub room_id: u64,
    pub stake_human: String,
    pub choice: Choice,
    pub salt: B256,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearOptions {
    pub preserve_archive: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredSecret {
    room_id: u64,
    stake_human: String,
    choice: u8,
    salt: String,
}

impl From<&CommitSecret> for StoredSecret {
    fn from(secret: &CommitSecret) -> Self {
        Self {
            room_id: secret.room_id,
            stake_human: secret.stake_human.clone(),
            choice: secret.choice.as_u8(),
            salt: format!("0x{}", hex::encode(secret.salt)),
        }
    }
}

impl StoredSecret {
    fn validate(self) -> Option<CommitSecret> {
        if self.room_id == 0 {
            return None;
        }
        Some(CommitSecret {
            room_id: self.room_id,
            stake_human: self.stake_human,
            choice: Choice::from_u8(self.choice)?,
            salt: parse_salt(&self.salt)?,
        })
    }
}

/// `0x` followed by exactly 64 hex digits.
pub fn parse_salt(raw: &str) -> Option<B256> {
    let digits = raw.strip_prefix("0x")?;
    if digits.len() != 64 {
        return None;
    }
    let bytes = hex::decode(digits).ok()?;
    Some(B256::from_slice(&bytes))
}

fn address_key(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}

fn live_key(address: &Address) -> String {
    format!("commit/{}", address_key(address))
}

fn archive_key(address: &Address) -> String {
    format!("commit_archive/{}", address_key(address))
}

pub struct CommitSecretStore {
    store: SharedStore,
}

impl CommitSecretStore {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn save(&self, address: &Address, secret: &CommitSecret) -> crate::Result<()> {
        self.upsert(&live_key(address), secret)
    }

    pub fn load(&self, address: &Address, room_id: u64) -> crate::Result<Option<CommitSecret>> {
        Ok(self.read_map(&live_key(address))?.remove(&room_id))
    }

    pub fn archive(&self, address: &Address, secret: &CommitSecret) -> crate::Result<()> {
        self.upsert(&archive_key(address), secret)
    }

    pub fn load_archived(
        &self,
        address: &Address,
        room_id: u64,
    ) -> crate::Result<Option<CommitSecret>> {
        Ok(self.read_map(&archive_key(address))?.remove(&room_id))
    }

    /// Live copy first, archive second.
    pub fn load_any(&self, address: &Address, room_id: u64) -> crate::Result<Option<CommitSecret>> {
        match self.load(address, room_id)? {
            Some(secret) => Ok(Some(secret)),
            None => self.load_archived(address, room_id),
        }
    }

    /// Store the live and the archived copy.
    pub fn record_commit(&self, address: &Address, secret: &CommitSecret) -> crate::Result<()> {
        self.save(address, secret)?;
        self.archive(address, secret)
    }

    pub fn clear(
        &self,
        address: &Address,
        room_id: u64,
        options: ClearOptions,
    ) -> crate::Result<()> {
        self.remove_entry(&live_key(address), room_id)?;
        if !options.preserve_archive {
            self.remove_entry(&archive_key(address), room_id)?;
        }
        Ok(())
    }

    pub fn live_room_ids(&self, address: &Address) -> crate::Result<Vec<u64>> {
        Ok(self.read_map(&live_key(address))?.into_keys().collect())
    }

    fn upsert(&self, key: &str, secret: &CommitSecret) -> crate::Result<()> {
        let mut map = self.read_map(key)?;
        map.insert(secret.room_id, secret.clone());
        self.write_map(key, &map)
    }

    fn remove_entry(&self, key: &str, room_id: u64) -> crate::Result<()> {
        let mut map = self.read_map(key)?;
        if map.remove(&room_id).is_some() {
            self.write_map(key, &map)?;
        }
        Ok(())
    }

    fn write_map(&self, key: &str, map: &BTreeMap<u64, CommitSecret>) -> crate::Result<()> {
        if map.is_empty() {
            return self.store.remove(key);
        }
        let stored: BTreeMap<String, StoredSecret> = map
            .iter()
            .map(|(room_id, secret)| (room_id.to_string(), StoredSecret::from(secret)))
            .collect();
        write_json(self.store.as_ref(), key, &stored)
    }

    /// Parse a stored map, healing it in place: malformed entries are dropped and
    /// a legacy single-record value becomes a one-entry map.
    fn read_map(&self, key: &str) -> crate::Result<BTreeMap<u64, CommitSecret>> {
        let Some(bytes) = self.store.get(key)? else {
            return Ok(BTreeMap::new());
        };
        let (map, dirty) = match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(object)) if is_single_record(&object) => {
                let secret = serde_json::from_value::<StoredSecret>(Value::Object(object))
                    .ok()
                    .and_then(StoredSecret::validate);
                let map: BTreeMap<u64, CommitSecret> = secret
                    .into_iter()
                    .map(|secret| (secret.room_id, secret))
                    .collect();
                (map, true)
            }
            Ok(Value::Object(object)) => {
                let total = object.len();
                let map: BTreeMap<u64, CommitSecret> = object
                    .into_iter()
                    .filter_map(|(id, value)| {
                        let id: u64 = id.parse().ok()?;
                        let secret = serde_json::from_value::<StoredSecret>(value)
                            .ok()?
                            .validate()?;
                        (secret.room_id == id).then_some((id, secret))
                    })
                    .collect();
                let dirty = map.len() != total;
                (map, dirty)
            }
            _ => (BTreeMap::new(), true),
        };
        if dirty {
            debug!(key, kept = map.len(), "rewriting commit secrets without malformed entries");
            self.write_map(key, &map)?;
        }
        Ok(map)
    }
}

fn is_single_record(object: &Map<String, Value>) -> bool {
    object.contains_key("room_id") && object.contains_key("salt")
}
