//! per-volume write-ahead journal of metadata operations
//!
//! Entries live in a fixed ring of one-block slots (`slot = sequence % capacity`).
//! A mutating operation appends its entry before touching metadata and commits it
//! afterwards. Committed entries are trimmed from the tail by [Journal::checkpoint].
use std::collections::VecDeque;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    error::{FsError, FsResult},
    fs::FileKind,
    utils::{
        time_util::TimeDurationStruct,
        traits::{DigestInSelf, SerializeAndDigest},
    },
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalOperation {
    Create,
    Write,
    Delete,
    Rename,
    SetAttribute,
    Truncate,
}

/// what a journaled operation is about to change
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum JournalPayload {
    Create {
        parent: u64,
        name: String,
        inode: u64,
        kind: FileKind,
    },
    Write {
        inode: u64,
        offset: u64,
        length: u64,
        /// file size once the write is done
        new_size: u64,
    },
    Delete {
        parent: u64,
        name: String,
        inode: u64,
    },
    Rename {
        inode: u64,
        old_parent: u64,
        old_name: String,
        new_parent: u64,
        new_name: String,
    },
    SetAttribute {
        inode: u64,
        attributes: u32,
    },
    Truncate {
        inode: u64,
        new_size: u64,
    },
}

impl JournalPayload {
    pub fn operation(&self) -> JournalOperation {
        match self {
            JournalPayload::Create { .. } => JournalOperation::Create,
            JournalPayload::Write { .. } => JournalOperation::Write,
            JournalPayload::Delete { .. } => JournalOperation::Delete,
            JournalPayload::Rename { .. } => JournalOperation::Rename,
            JournalPayload::SetAttribute { .. } => JournalOperation::SetAttribute,
            JournalPayload::Truncate { .. } => JournalOperation::Truncate,
        }
    }
}

/// One record of a pending metadata mutation
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JournalEntry {
    /// ids are sequence numbers scoped by the volume id
    pub id: u64,
    pub volume_id: u64,
    pub operation: JournalOperation,
    pub timestamp: TimeDurationStruct,
    pub sequence: u64,
    pub payload: JournalPayload,
    pub committed: bool,
    pub digest: [u8; 32],
}

impl DigestInSelf for JournalEntry {
    fn digest_field(&mut self) -> &mut [u8; 32] {
        &mut self.digest
    }
}

impl SerializeAndDigest for JournalEntry {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JournalState {
    Stopped,
    Running,
}

#[derive(Debug)]
pub struct Journal {
    volume_id: u64,
    capacity: u64,
    state: JournalState,
    next_sequence: u64,
    entries: VecDeque<JournalEntry>,
}

impl Journal {
    pub fn new(volume_id: u64, capacity: u64) -> Self {
        Journal {
            volume_id,
            capacity,
            state: JournalState::Stopped,
            next_sequence: 1,
            entries: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn state(&self) -> JournalState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.entries.iter().filter(|e| !e.committed).count()
    }

    pub fn entries(&self) -> impl Iterator<Item = &JournalEntry> {
        self.entries.iter()
    }

    pub fn slot_of(&self, sequence: u64) -> u64 {
        sequence % self.capacity
    }

    /// slots between the oldest live entry and the next sequence number
    fn span(&self) -> u64 {
        match self.entries.front() {
            Some(oldest) => self.next_sequence - oldest.sequence,
            None => 0,
        }
    }

    /// Begin accepting entries.
    ///
    /// Returns the uncommitted entries left by an interrupted run, oldest first,
    /// for the volume to redo or discard.
    pub fn start(&mut self) -> Vec<JournalEntry> {
        self.state = JournalState::Running;
        let mut pending: Vec<JournalEntry> = self
            .entries
            .iter()
            .filter(|e| !e.committed)
            .cloned()
            .collect();
        pending.sort_unstable_by_key(|e| e.sequence);
        info!(
            "journal of volume {} started, {} entries to recover",
            self.volume_id,
            pending.len()
        );
        pending
    }

    /// commit everything pending and stop
    pub fn stop(&mut self) -> usize {
        let mut committed = 0;
        for entry in self.entries.iter_mut().filter(|e| !e.committed) {
            entry.committed = true;
            committed += 1;
        }
        self.checkpoint();
        self.state = JournalState::Stopped;
        info!(
            "journal of volume {} stopped, {committed} pending entries committed",
            self.volume_id
        );
        committed
    }

    /// stop without committing, as when the volume fails
    pub fn halt(&mut self) {
        self.state = JournalState::Stopped;
    }

    pub fn append(&mut self, payload: JournalPayload, now: TimeDurationStruct) -> FsResult<u64> {
        if self.state != JournalState::Running {
            return Err(FsError::InvalidDeviceState(format!(
                "journal of volume {} is stopped",
                self.volume_id
            )));
        }
        if self.span() >= self.capacity {
            self.checkpoint();
            if self.span() >= self.capacity {
                return Err(FsError::JournalFull);
            }
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        debug!(
            "journal {}: append #{sequence} {:?}",
            self.volume_id,
            payload.operation()
        );
        self.entries.push_back(JournalEntry {
            id: sequence,
            volume_id: self.volume_id,
            operation: payload.operation(),
            timestamp: now,
            sequence,
            payload,
            committed: false,
            digest: [0u8; 32],
        });
        Ok(sequence)
    }

    fn position(&self, sequence: u64) -> FsResult<usize> {
        self.entries
            .iter()
            .position(|e| e.sequence == sequence)
            .ok_or_else(|| FsError::NotFound(format!("journal entry {sequence}")))
    }

    pub fn commit(&mut self, sequence: u64) -> FsResult<()> {
        let position = self.position(sequence)?;
        self.entries[position].committed = true;
        Ok(())
    }

    /// drop an entry whose operation did not take place
    pub fn discard(&mut self, sequence: u64) -> FsResult<JournalEntry> {
        let position = self.position(sequence)?;
        self.entries
            .remove(position)
            .ok_or_else(|| FsError::NotFound(format!("journal entry {sequence}")))
    }

    /// trim the committed prefix, returning how many entries went away
    pub fn checkpoint(&mut self) -> usize {
        let mut trimmed = 0;
        while self.entries.front().is_some_and(|e| e.committed) {
            self.entries.pop_front();
            trimmed += 1;
        }
        if trimmed > 0 {
            debug!("journal {}: checkpoint trimmed {trimmed}", self.volume_id);
        }
        trimmed
    }

    /// every live entry encoded into its slot, `(slot, block)`
    pub fn encode_slots(&self, block_size: u32) -> Vec<(u64, Vec<u8>)> {
        self.entries
            .iter()
            .filter_map(|entry| {
                let mut entry = entry.clone();
                let mut block = vec![0u8; block_size as usize];
                match entry.serialize_into_slot(&mut block) {
                    Ok(_) => Some((self.slot_of(entry.sequence), block)),
                    Err(e) => {
                        warn!("journal entry {} does not fit a slot: {e}", entry.sequence);
                        None
                    }
                }
            })
            .collect()
    }

    /// the valid entries of a journal region, oldest first
    pub fn decode_slots(region: &[u8], block_size: u32) -> Vec<JournalEntry> {
        let mut entries: Vec<JournalEntry> = region
            .chunks_exact(block_size as usize)
            .filter(|slot| slot.iter().any(|b| *b != 0))
            .filter_map(|slot| {
                <JournalEntry as SerializeAndDigest>::deserialize(slot)
                    .ok()
                    .map(|(e, _)| e)
            })
            .collect();
        entries.sort_unstable_by_key(|e| e.sequence);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn truncate(inode: u64) -> JournalPayload {
        JournalPayload::Truncate { inode, new_size: 0 }
    }

    fn running(capacity: u64) -> Journal {
        let mut journal = Journal::new(1, capacity);
        assert!(journal.start().is_empty());
        journal
    }

    #[test]
    fn test_sequence_numbers_increase() -> anyhow::Result<()> {
        let mut journal = running(8);
        let a = journal.append(truncate(20), TimeDurationStruct::default())?;
        let b = journal.append(truncate(21), TimeDurationStruct::default())?;
        assert!(b > a);
        journal.commit(a)?;
        assert_eq!(journal.pending(), 1);
        assert!(matches!(journal.commit(99), Err(FsError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_stopped_journal_refuses_entries() {
        let mut journal = Journal::new(1, 8);
        assert!(matches!(
            journal.append(truncate(20), TimeDurationStruct::default()),
            Err(FsError::InvalidDeviceState(_))
        ));
    }

    #[test]
    fn test_full_ring_checkpoints_then_fails() -> anyhow::Result<()> {
        let mut journal = running(2);
        let a = journal.append(truncate(20), TimeDurationStruct::default())?;
        let b = journal.append(truncate(21), TimeDurationStruct::default())?;
        journal.commit(a)?;
        // the committed tail makes room
        let c = journal.append(truncate(22), TimeDurationStruct::default())?;
        assert_eq!(journal.len(), 2);
        assert_ne!(journal.slot_of(b), journal.slot_of(c));
        assert!(matches!(
            journal.append(truncate(23), TimeDurationStruct::default()),
            Err(FsError::JournalFull)
        ));
        // commits out of order only trim up to the first pending entry
        journal.commit(c)?;
        assert_eq!(journal.checkpoint(), 0);
        journal.commit(b)?;
        assert_eq!(journal.checkpoint(), 2);
        Ok(())
    }

    #[test]
    fn test_restart_returns_pending_entries_in_order() -> anyhow::Result<()> {
        let mut journal = running(8);
        let a = journal.append(truncate(20), TimeDurationStruct::default())?;
        let b = journal.append(truncate(21), TimeDurationStruct::default())?;
        let c = journal.append(truncate(22), TimeDurationStruct::default())?;
        journal.commit(b)?;
        journal.halt();

        let pending = journal.start();
        assert_eq!(
            pending.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![a, c]
        );
        journal.discard(c)?;
        assert_eq!(journal.stop(), 1);
        assert!(journal.is_empty());
        Ok(())
    }

    #[test]
    fn test_slots_survive_encoding() -> anyhow::Result<()> {
        let mut journal = running(4);
        for inode in 20..23 {
            journal.append(truncate(inode), TimeDurationStruct::default())?;
        }
        let mut region = vec![0u8; 4 * 512];
        for (slot, block) in journal.encode_slots(512) {
            let at = slot as usize * 512;
            region[at..at + 512].copy_from_slice(&block);
        }
        // a torn slot is skipped
        region[512 * 3 + 1] ^= 0xff;
        let decoded = Journal::decode_slots(&region, 512);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].sequence, 1);
        assert_eq!(decoded[1].payload, truncate(21));
        Ok(())
    }
}
