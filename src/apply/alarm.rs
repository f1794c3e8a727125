//! Persistent alarms raised by cluster members.

use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::storage::{Backend, BackendResult, Bucket};

const ALARM_PREFIX: &[u8] = b"alarm/";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlarmType {
    /// The backend exceeded its space quota; writes that add data are refused
    NoSpace,
    /// Data corruption was detected
    Corrupt,
}

impl AlarmType {
    fn as_str(self) -> &'static str {
        match self {
            AlarmType::NoSpace => "nospace",
            AlarmType::Corrupt => "corrupt",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "nospace" => Some(AlarmType::NoSpace),
            "corrupt" => Some(AlarmType::Corrupt),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AlarmMember {
    pub member_id: u64,
    pub alarm: AlarmType,
}

impl AlarmMember {
    fn storage_key(&self) -> Vec<u8> {
        let mut key = ALARM_PREFIX.to_vec();
        key.extend_from_slice(format!("{}/{}", self.member_id, self.alarm.as_str()).as_bytes());
        key
    }

    fn from_storage_key(key: &[u8]) -> Option<Self> {
        let rest = std::str::from_utf8(key.strip_prefix(ALARM_PREFIX)?).ok()?;
        let (member, alarm) = rest.split_once('/')?;
        Some(Self {
            member_id: member.parse().ok()?,
            alarm: AlarmType::parse(alarm)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlarmAction {
    Get,
    Activate,
    Deactivate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlarmRequest {
    pub action: AlarmAction,
    pub member_id: u64,
    /// `None` with [`AlarmAction::Get`] lists every alarm
    pub alarm: Option<AlarmType>,
}

/// Active alarms, mirrored in the backend's meta bucket so they survive restarts.
pub struct AlarmStore {
    backend: Arc<Backend>,
    active: RwLock<BTreeSet<AlarmMember>>,
}

impl AlarmStore {
    /// Loads the alarms recorded in the backend.
    pub fn new(backend: Arc<Backend>) -> BackendResult<Self> {
        let mut active = BTreeSet::new();
        {
            let rtx = backend.read_tx();
            let mut end = ALARM_PREFIX.to_vec();
            if let Some(last) = end.last_mut() {
                *last += 1;
            }
            for (key, _) in rtx.range(Bucket::Meta, ALARM_PREFIX, Some(end.as_slice()), 0)? {
                match AlarmMember::from_storage_key(&key) {
                    Some(member) => {
                        active.insert(member);
                    }
                    None => warn!(key = ?String::from_utf8_lossy(&key), "Ignoring malformed alarm"),
                }
            }
        }
        if !active.is_empty() {
            info!(count = active.len(), "Restored active alarms");
        }
        Ok(Self {
            backend,
            active: RwLock::new(active),
        })
    }

    /// Raises an alarm. Returns `None` if it was already active.
    pub fn activate(&self, member_id: u64, alarm: AlarmType) -> Option<AlarmMember> {
        let member = AlarmMember { member_id, alarm };
        let mut active = self.active.write();
        if !active.insert(member) {
            return None;
        }
        self.backend
            .batch_tx()
            .put(Bucket::Meta, &member.storage_key(), &[]);
        warn!(member_id, alarm = alarm.as_str(), "Alarm raised");
        Some(member)
    }

    /// Clears an alarm. Returns `None` if it was not active.
    pub fn deactivate(&self, member_id: u64, alarm: AlarmType) -> Option<AlarmMember> {
        let member = AlarmMember { member_id, alarm };
        let mut active = self.active.write();
        if !active.remove(&member) {
            return None;
        }
        self.backend
            .batch_tx()
            .delete(Bucket::Meta, &member.storage_key());
        info!(member_id, alarm = alarm.as_str(), "Alarm cleared");
        Some(member)
    }

    /// Active alarms of one type, or all of them.
    pub fn get(&self, alarm: Option<AlarmType>) -> Vec<AlarmMember> {
        self.active
            .read()
            .iter()
            .filter(|member| alarm.map_or(true, |a| member.alarm == a))
            .copied()
            .collect()
    }

    /// Whether any member has raised `alarm`.
    pub fn is_active(&self, alarm: AlarmType) -> bool {
        self.active.read().iter().any(|member| member.alarm == alarm)
    }
}
