// Per-target history rings for the debug inspector.
//
// The service owns its buffers exclusively. Pushes arrive from the
// tick thread through on_slot_write; mapping changes arrive from the
// editor and must be externally synchronized (stop-the-world for the
// swap). There is no locking here on purpose.
//
// Only scalar continuous signals are sampleable: fields, bools,
// shapes and anything with stride != 1 are silently rejected.

use std::collections::{HashMap, VecDeque};

use crate::debug::EdgeMapper;
use crate::ir::Slot;
use crate::types::{CanonType, Payload, Temporality, Term};

pub const MAX_TRACKED_KEYS: usize = 32;
pub const DEFAULT_CAPACITY: usize = 128;

pub struct HistoryEntry {
    key: String,
    slot: Option<Slot>,
    ty: CanonType,
    buf: Vec<f32>,
    write_index: u64,
    filled: bool,
    pinned: bool,
}

impl HistoryEntry {
    fn new(key: &str, slot: Slot, ty: CanonType, capacity: usize, pinned: bool) -> HistoryEntry {
        HistoryEntry {
            key: String::from(key),
            slot: Some(slot),
            ty,
            buf: vec![0.0; capacity],
            write_index: 0,
            filled: false,
            pinned,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn slot(&self) -> Option<Slot> {
        self.slot
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    // Monotonically unbounded; the physical position is the index
    // modulo capacity.
    pub fn write_index(&self) -> u64 {
        self.write_index
    }

    pub fn filled(&self) -> bool {
        self.filled
    }

    pub fn pinned(&self) -> bool {
        self.pinned
    }

    pub fn latest(&self) -> Option<f32> {
        if self.write_index == 0 {
            return None;
        }
        let cap = self.buf.len() as u64;
        Some(self.buf[((self.write_index - 1) % cap) as usize])
    }

    // Samples oldest-first. Before the ring fills this is a prefix.
    pub fn samples(&self) -> Vec<f32> {
        let cap = self.buf.len() as u64;
        if !self.filled {
            return self.buf[..self.write_index as usize].to_vec();
        }
        let start = (self.write_index % cap) as usize;
        let mut out = Vec::with_capacity(self.buf.len());
        out.extend_from_slice(&self.buf[start..]);
        out.extend_from_slice(&self.buf[..start]);
        out
    }

    fn push(&mut self, value: f32) {
        let cap = self.buf.len() as u64;
        self.buf[(self.write_index % cap) as usize] = value;
        self.write_index += 1;
        if self.write_index >= cap {
            self.filled = true;
        }
    }

    fn reset(&mut self, capacity: usize) {
        self.buf = vec![0.0; capacity];
        self.write_index = 0;
        self.filled = false;
    }
}

fn sampleable(ty: &CanonType) -> bool {
    if ty.is_field() {
        return false;
    }
    if ty.extent.temporality != Term::Fixed(Temporality::Continuous) {
        return false;
    }
    match ty.payload {
        Term::Fixed(Payload::Float) | Term::Fixed(Payload::Int) => {}
        _ => return false,
    }
    ty.stride().map_or(false, |s| s == 1)
}

pub struct HistoryService {
    entries: HashMap<String, HistoryEntry>,
    // Insertion order; eviction walks it front to back.
    order: VecDeque<String>,
    by_slot: HashMap<u32, Vec<String>>,
    capacity: usize,
}

impl HistoryService {
    pub fn new() -> HistoryService {
        HistoryService::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> HistoryService {
        HistoryService {
            entries: HashMap::new(),
            order: VecDeque::new(),
            by_slot: HashMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, key: &str) -> Option<&HistoryEntry> {
        self.entries.get(key)
    }

    // Begin tracking a port or edge key. Unsampleable and unresolved
    // targets are rejected silently (the inspector simply shows no
    // sparkline). Returns whether the key is tracked afterwards.
    pub fn track(&mut self, key: &str, mapper: &EdgeMapper, pinned: bool) -> bool {
        let binding = match mapper
            .port_map
            .get(key)
            .or_else(|| mapper.edge_map.get(key))
        {
            Some(b) => b.clone(),
            None => return false,
        };
        if !sampleable(&binding.ty) {
            return false;
        }

        if let Some(existing) = self.entries.get_mut(key) {
            existing.pinned = existing.pinned || pinned;
            existing.slot = Some(binding.slot);
            return true;
        }

        if self.entries.len() >= MAX_TRACKED_KEYS && !self.evict_one() {
            return false;
        }

        let entry = HistoryEntry::new(key, binding.slot, binding.ty, self.capacity, pinned);
        self.by_slot
            .entry(binding.slot.0)
            .or_insert_with(Vec::new)
            .push(String::from(key));
        self.order.push_back(String::from(key));
        self.entries.insert(String::from(key), entry);
        true
    }

    pub fn untrack(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
            for keys in self.by_slot.values_mut() {
                keys.retain(|k| k != key);
            }
            self.by_slot.retain(|_, keys| !keys.is_empty());
        }
    }

    fn evict_one(&mut self) -> bool {
        let victim = self
            .order
            .iter()
            .find(|k| self.entries.get(*k).map_or(false, |e| !e.pinned))
            .cloned();
        match victim {
            Some(key) => {
                self.untrack(&key);
                true
            }
            None => false,
        }
    }

    // Tick-thread push: fan one slot write out to every observer.
    pub fn on_slot_write(&mut self, slot: Slot, value: f32) {
        let keys = match self.by_slot.get(&slot.0) {
            Some(keys) => keys.clone(),
            None => return,
        };
        for key in keys {
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.push(value);
            }
        }
    }

    // Editor-side re-resolution after a recompile. A target whose
    // slot disappeared is kept but paused; a target whose type
    // changed gets a fresh buffer.
    pub fn on_mapping_changed(&mut self, mapper: &EdgeMapper) {
        let capacity = self.capacity;
        self.by_slot.clear();
        let keys: Vec<String> = self.order.iter().cloned().collect();
        for key in keys {
            let entry = match self.entries.get_mut(&key) {
                Some(e) => e,
                None => continue,
            };
            let binding = mapper.port_map.get(&key).or_else(|| mapper.edge_map.get(&key));
            match binding {
                None => {
                    entry.slot = None;
                }
                Some(b) if !sampleable(&b.ty) => {
                    entry.slot = None;
                }
                Some(b) => {
                    if b.ty != entry.ty {
                        entry.ty = b.ty;
                        entry.reset(capacity);
                    }
                    entry.slot = Some(b.slot);
                    self.by_slot
                        .entry(b.slot.0)
                        .or_insert_with(Vec::new)
                        .push(key.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::{EdgeBinding, EdgeMapper};
    use std::collections::HashMap;

    fn mapper_with(ports: &[(&str, u32, CanonType)]) -> EdgeMapper {
        let mut port_map = HashMap::new();
        for (key, slot, ty) in ports {
            port_map.insert(
                String::from(*key),
                EdgeBinding {
                    slot: Slot(*slot),
                    ty: *ty,
                    cardinality: crate::types::Cardinality::One,
                },
            );
        }
        EdgeMapper {
            edge_map: HashMap::new(),
            port_map,
            unmapped: Vec::new(),
        }
    }

    fn float() -> CanonType {
        CanonType::new(Payload::Float)
    }

    #[test]
    fn test_ring_arithmetic() {
        let mapper = mapper_with(&[("a:out", 0, float())]);
        let mut h = HistoryService::with_capacity(4);
        assert!(h.track("a:out", &mapper, false));

        for i in 0..3 {
            h.on_slot_write(Slot(0), i as f32);
        }
        let e = h.entry("a:out").unwrap();
        assert_eq!(e.write_index(), 3);
        assert!(!e.filled());
        assert_eq!(e.latest(), Some(2.0));
        assert_eq!(e.samples(), vec![0.0, 1.0, 2.0]);

        for i in 3..6 {
            h.on_slot_write(Slot(0), i as f32);
        }
        let e = h.entry("a:out").unwrap();
        assert_eq!(e.write_index(), 6);
        assert!(e.filled());
        // Most recent value sits at (N-1) mod capacity.
        assert_eq!(e.latest(), Some(5.0));
        assert_eq!(e.samples(), vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_rejects_unsampleable_targets() {
        let field = CanonType::field(
            Payload::Float,
            crate::types::Unit::None,
            crate::types::InstanceId(0),
            crate::types::Domain::Default,
        );
        let mapper = mapper_with(&[
            ("f:out", 0, field),
            ("v:out", 2, CanonType::new(Payload::Vec2)),
            ("b:out", 4, CanonType::new(Payload::Bool)),
            ("ok:out", 5, float()),
        ]);
        let mut h = HistoryService::new();
        assert!(!h.track("f:out", &mapper, false));
        assert!(!h.track("v:out", &mapper, false));
        assert!(!h.track("b:out", &mapper, false));
        assert!(!h.track("missing:out", &mapper, false));
        assert!(h.track("ok:out", &mapper, false));
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn test_fifo_eviction_skips_pinned() {
        let ports: Vec<(String, u32, CanonType)> = (0..40)
            .map(|i| (format!("b{:02}:out", i), i, float()))
            .collect();
        let refs: Vec<(&str, u32, CanonType)> = ports
            .iter()
            .map(|(k, s, t)| (k.as_str(), *s, *t))
            .collect();
        let mapper = mapper_with(&refs);

        let mut h = HistoryService::new();
        // First target is pinned (hover), the rest are not.
        assert!(h.track("b00:out", &mapper, true));
        for i in 1..MAX_TRACKED_KEYS {
            assert!(h.track(&format!("b{:02}:out", i), &mapper, false));
        }
        assert_eq!(h.len(), MAX_TRACKED_KEYS);

        // One over the cap: the oldest unpinned entry goes.
        assert!(h.track("b32:out", &mapper, false));
        assert_eq!(h.len(), MAX_TRACKED_KEYS);
        assert!(h.entry("b00:out").is_some());
        assert!(h.entry("b01:out").is_none());
        assert!(h.entry("b32:out").is_some());
    }

    #[test]
    fn test_mapping_change_pauses_and_resets() {
        let mapper = mapper_with(&[("a:out", 0, float()), ("b:out", 1, float())]);
        let mut h = HistoryService::with_capacity(4);
        assert!(h.track("a:out", &mapper, false));
        assert!(h.track("b:out", &mapper, false));
        h.on_slot_write(Slot(0), 1.0);
        h.on_slot_write(Slot(1), 2.0);

        // Recompile: a's slot moved and changed type, b vanished.
        let int_ty = CanonType::new(Payload::Int);
        let next = mapper_with(&[("a:out", 7, int_ty)]);
        h.on_mapping_changed(&next);

        let a = h.entry("a:out").unwrap();
        assert_eq!(a.slot(), Some(Slot(7)));
        assert_eq!(a.write_index(), 0);
        assert!(!a.filled());

        let b = h.entry("b:out").unwrap();
        assert_eq!(b.slot(), None);
        // Paused, not dropped: the old samples survive.
        assert_eq!(b.latest(), Some(2.0));

        // Writes to the stale slot no longer reach b.
        h.on_slot_write(Slot(1), 9.0);
        assert_eq!(h.entry("b:out").unwrap().write_index(), 1);
    }

    #[test]
    fn test_retrack_existing_updates_pin() {
        let mapper = mapper_with(&[("a:out", 0, float())]);
        let mut h = HistoryService::new();
        assert!(h.track("a:out", &mapper, false));
        h.on_slot_write(Slot(0), 5.0);
        assert!(h.track("a:out", &mapper, true));
        let e = h.entry("a:out").unwrap();
        assert!(e.pinned());
        // Re-tracking keeps the buffer.
        assert_eq!(e.latest(), Some(5.0));
    }
}
