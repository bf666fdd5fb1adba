//! Aggregation cursors
//!
//! Cursors live in an arena of slots. A cursor id packs the slot number
//! with the slot's generation, so an id outlives neither its cursor nor a
//! reuse of the slot. Each cursor also remembers the generation of the
//! index it was opened on; an index dropped and recreated under the same
//! name invalidates the old cursors.
//!
//! A cursor is checked out for the duration of a read, which keeps reads
//! on one cursor strictly sequential.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time;

use crate::pipeline::Pipeline;
use crate::{Error, Result};

/// A suspended aggregation
pub struct Cursor {
    pub index: String,
    pub index_generation: u64,
    pub pipeline: Pipeline,
    /// Rows per read when the read names no COUNT
    pub count: usize,
    pub max_idle: Duration,
    /// Per-read timeout; 0 disables
    pub timeout_ms: u64,
}

enum Entry {
    Idle { cursor: Box<Cursor>, expires: Instant },
    /// Checked out by a reader
    Busy { index: String },
}

impl Entry {
    fn index(&self) -> &str {
        match self {
            Entry::Idle { cursor, .. } => &cursor.index,
            Entry::Busy { index } => index,
        }
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl Arena {
    fn resolve(&mut self, id: u64) -> Option<&mut Slot> {
        let (slot, generation) = split_id(id)?;
        self.slots
            .get_mut(slot)
            .filter(|s| s.generation == generation && s.entry.is_some())
    }

    fn release(&mut self, slot: usize) {
        if let Some(s) = self.slots.get_mut(slot) {
            if s.entry.take().is_some() {
                s.generation = s.generation.wrapping_add(1);
                self.free.push(slot);
            }
        }
    }

    fn count_for(&self, index: &str) -> usize {
        self.slots
            .iter()
            .filter_map(|s| s.entry.as_ref())
            .filter(|e| e.index() == index)
            .count()
    }
}

fn make_id(slot: usize, generation: u32) -> u64 {
    ((generation as u64) << 32) | (slot as u64 + 1)
}

fn split_id(id: u64) -> Option<(usize, u32)> {
    let low = (id & 0xFFFF_FFFF) as usize;
    if low == 0 {
        return None;
    }
    Some((low - 1, (id >> 32) as u32))
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CursorStats {
    pub global_idle: usize,
    pub global_total: usize,
    pub index_capacity: usize,
    pub index_total: usize,
}

/// Registry of open cursors
pub struct CursorTable {
    arena: Mutex<Arena>,
    max_per_index: usize,
}

impl CursorTable {
    pub fn new(max_per_index: usize) -> Self {
        Self {
            arena: Mutex::new(Arena::default()),
            max_per_index,
        }
    }

    /// Park a cursor and return its id (never 0).
    pub fn open(&self, cursor: Cursor) -> Result<u64> {
        let mut arena = self.arena.lock();
        if self.max_per_index > 0 && arena.count_for(&cursor.index) >= self.max_per_index {
            return Err(Error::bad_argument(format!(
                "Too many cursors allocated for index {}",
                cursor.index
            )));
        }
        let slot = match arena.free.pop() {
            Some(slot) => slot,
            None => {
                arena.slots.push(Slot::default());
                arena.slots.len() - 1
            }
        };
        let expires = Instant::now() + cursor.max_idle;
        let generation = arena.slots[slot].generation;
        arena.slots[slot].entry = Some(Entry::Idle {
            cursor: Box::new(cursor),
            expires,
        });
        Ok(make_id(slot, generation))
    }

    /// Take a cursor out for reading. Idle cursors past their deadline and
    /// cursors of a dropped index generation are removed here.
    pub fn checkout(&self, index: &str, index_generation: u64, id: u64) -> Result<Box<Cursor>> {
        let mut arena = self.arena.lock();
        let slot_no = split_id(id).map(|(s, _)| s);
        let slot = arena.resolve(id).ok_or(Error::CursorNotFound(id))?;
        let entry = slot.entry.take().ok_or(Error::CursorNotFound(id))?;
        let cursor = match entry {
            Entry::Busy { index: owner } => {
                slot.entry = Some(Entry::Busy { index: owner });
                return Err(Error::bad_argument(format!("Cursor {id} is busy")));
            }
            Entry::Idle { cursor, expires } => {
                let valid = cursor.index == index
                    && cursor.index_generation == index_generation
                    && Instant::now() < expires;
                if !valid {
                    if cursor.index != index {
                        // Another index's cursor stays where it is.
                        slot.entry = Some(Entry::Idle { cursor, expires });
                        return Err(Error::CursorNotFound(id));
                    }
                    if let Some(n) = slot_no {
                        arena.release(n);
                    }
                    return Err(Error::CursorNotFound(id));
                }
                cursor
            }
        };
        slot.entry = Some(Entry::Busy {
            index: index.to_string(),
        });
        Ok(cursor)
    }

    /// Return a cursor after a read; its idle deadline restarts now.
    pub fn checkin(&self, id: u64, cursor: Box<Cursor>) {
        let mut arena = self.arena.lock();
        if let Some(slot) = arena.resolve(id) {
            if matches!(slot.entry, Some(Entry::Busy { .. })) {
                let expires = Instant::now() + cursor.max_idle;
                slot.entry = Some(Entry::Idle { cursor, expires });
            }
        }
    }

    /// Forget a cursor, whether idle or checked out.
    pub fn remove(&self, id: u64) -> bool {
        let mut arena = self.arena.lock();
        if arena.resolve(id).is_none() {
            return false;
        }
        if let Some((slot, _)) = split_id(id) {
            arena.release(slot);
        }
        true
    }

    /// `CURSOR DEL`
    pub fn delete(&self, index: &str, id: u64) -> Result<()> {
        let mut arena = self.arena.lock();
        let owned = arena
            .resolve(id)
            .and_then(|s| s.entry.as_ref())
            .is_some_and(|e| e.index() == index);
        if !owned {
            return Err(Error::CursorNotFound(id));
        }
        if let Some((slot, _)) = split_id(id) {
            arena.release(slot);
        }
        Ok(())
    }

    /// Drop every cursor of `index`.
    pub fn purge_index(&self, index: &str) -> usize {
        let mut arena = self.arena.lock();
        let doomed: Vec<usize> = arena
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.entry.as_ref().is_some_and(|e| e.index() == index))
            .map(|(i, _)| i)
            .collect();
        for slot in &doomed {
            arena.release(*slot);
        }
        doomed.len()
    }

    /// Remove idle cursors whose deadline is before `now`.
    pub fn reap(&self, now: Instant) -> usize {
        let mut arena = self.arena.lock();
        let expired: Vec<usize> = arena
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(&s.entry, Some(Entry::Idle { expires, .. }) if *expires <= now))
            .map(|(i, _)| i)
            .collect();
        for slot in &expired {
            arena.release(*slot);
        }
        expired.len()
    }

    pub fn stats(&self, index: &str) -> CursorStats {
        let arena = self.arena.lock();
        let entries = || arena.slots.iter().filter_map(|s| s.entry.as_ref());
        CursorStats {
            global_idle: entries().filter(|e| matches!(e, Entry::Idle { .. })).count(),
            global_total: entries().count(),
            index_capacity: self.max_per_index,
            index_total: entries().filter(|e| e.index() == index).count(),
        }
    }

    /// Sweep idle cursors on a coarse tick until the table is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let table = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = time::interval(every);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(table) = table.upgrade() else {
                    break;
                };
                let reaped = table.reap(Instant::now());
                if reaped > 0 {
                    tracing::debug!(reaped, "Reaped idle cursors");
                }
            }
        })
    }
}
