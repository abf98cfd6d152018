use std::collections::VecDeque;
use std::fmt;

use kurbo::Size;

use crate::canvas::{Layer, LayerId, LayerStack, LayerTransform, TiledImage};
use crate::error::{EngineError, Result};
use crate::settings::EngineSettings;

// ============================================================================
// STACK SNAPSHOT: independent deep copy of every layer
// ============================================================================

/// Whole-stack copy: transforms, names, identities and pixels.  Buffers are
/// deep-copied, so nothing here aliases a live layer.
#[derive(Clone, Debug, PartialEq)]
pub struct StackSnapshot {
    pub frame: Size,
    pub active_layer: Option<LayerId>,
    pub layers: Vec<LayerSnapshot>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LayerSnapshot {
    pub id: LayerId,
    pub name: String,
    pub transform: LayerTransform,
    pub pixels: TiledImage,
}

impl StackSnapshot {
    pub fn capture(stack: &LayerStack) -> Self {
        Self {
            frame: stack.frame(),
            active_layer: stack.active_layer_id(),
            layers: stack
                .layers()
                .map(|l| LayerSnapshot {
                    id: l.id(),
                    name: l.name.clone(),
                    transform: *l.transform(),
                    pixels: l.pixels().deep_clone(),
                })
                .collect(),
        }
    }

    /// Replace the stack's layers with fresh copies of this snapshot.  The
    /// snapshot itself stays reusable; on error the stack is untouched.
    pub fn restore_into(&self, stack: &mut LayerStack) -> Result<()> {
        let layers = self
            .layers
            .iter()
            .map(|snap| Layer::from_parts(snap.id, snap.name.clone(), snap.pixels.deep_clone(), snap.transform))
            .collect::<Result<Vec<Layer>>>()?;
        stack.replace_layers(self.frame, layers, self.active_layer)
    }

    pub fn memory_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.pixels.memory_bytes() + l.name.len()).sum()
    }
}

// ============================================================================
// SNAPSHOT MANAGER: bounded linear history
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotId(u64);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Tool session a snapshot belongs to, for rollback without restoring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum SessionTag {
    #[default]
    Normal,
    /// Move, rotate, scale, resize or flip gestures on one layer.
    Transform,
    MagicWand,
}

struct Entry {
    id: SnapshotId,
    tag: SessionTag,
    description: String,
    snapshot: StackSnapshot,
    memory: usize,
}

/// Ordered snapshot history.  Oldest entries are evicted beyond the count
/// or memory cap.  History is linear: restoring truncates everything after
/// the restored entry.
pub struct SnapshotManager {
    entries: VecDeque<Entry>,
    next_id: u64,
    capacity: usize,
    /// Optional memory cap in bytes.
    max_memory_bytes: Option<usize>,
    /// Running memory total across all entries.
    total_memory: usize,
}

impl Default for SnapshotManager {
    fn default() -> Self {
        Self::new(20)
    }
}

impl SnapshotManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 1,
            capacity: capacity.max(1),
            max_memory_bytes: Some(256 * 1024 * 1024),
            total_memory: 0,
        }
    }

    pub fn with_memory_limit(mut self, max_memory_bytes: Option<usize>) -> Self {
        self.max_memory_bytes = max_memory_bytes;
        self
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::new(settings.snapshot_capacity)
            .with_memory_limit(Some(settings.snapshot_memory_mb.saturating_mul(1024 * 1024)))
    }

    pub fn snapshot(&mut self, stack: &LayerStack) -> Result<SnapshotId> {
        self.snapshot_tagged(stack, SessionTag::Normal, "Snapshot")
    }

    /// Deep-copy the stack and append it to the history.
    pub fn snapshot_tagged(&mut self, stack: &LayerStack, tag: SessionTag, description: &str) -> Result<SnapshotId> {
        let snapshot = StackSnapshot::capture(stack);
        let memory = snapshot.memory_bytes();
        if let Some(max) = self.max_memory_bytes
            && memory > max
        {
            return Err(EngineError::CapacityExceeded(format!(
                "snapshot needs {memory} bytes, history limit is {max}"
            )));
        }

        let id = SnapshotId(self.next_id);
        self.next_id += 1;
        self.total_memory += memory;
        self.entries.push_back(Entry {
            id,
            tag,
            description: description.to_string(),
            snapshot,
            memory,
        });
        self.prune();
        log::debug!("snapshot {id} ({description}, {tag:?}): {memory} bytes");
        Ok(id)
    }

    /// Prune old entries to stay within limits.
    fn prune(&mut self) {
        while self.entries.len() > self.capacity {
            self.evict_front();
        }
        if let Some(max_bytes) = self.max_memory_bytes {
            while self.total_memory > max_bytes && self.entries.len() > 1 {
                self.evict_front();
            }
        }
    }

    fn evict_front(&mut self) {
        if let Some(removed) = self.entries.pop_front() {
            self.total_memory = self.total_memory.saturating_sub(removed.memory);
        }
    }

    fn position(&self, id: SnapshotId) -> Result<usize> {
        self.entries
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| EngineError::invalid(format!("unknown snapshot {id}")))
    }

    /// Restore `id` and drop every later entry.  On error neither the stack
    /// nor the history changes.
    pub fn restore(&mut self, stack: &mut LayerStack, id: SnapshotId) -> Result<()> {
        let idx = self.position(id)?;
        self.entries[idx].snapshot.restore_into(stack)?;
        while self.entries.len() > idx + 1 {
            if let Some(removed) = self.entries.pop_back() {
                self.total_memory = self.total_memory.saturating_sub(removed.memory);
            }
        }
        log::debug!("restored snapshot {id}");
        Ok(())
    }

    /// Step back one entry: restore the snapshot before the latest.
    /// Returns `None` when there is nothing to go back to.
    pub fn undo(&mut self, stack: &mut LayerStack) -> Result<Option<SnapshotId>> {
        if self.entries.len() < 2 {
            return Ok(None);
        }
        let id = self.entries[self.entries.len() - 2].id;
        self.restore(stack, id)?;
        Ok(Some(id))
    }

    /// Drop every snapshot of a tool session without restoring.
    pub fn dispose(&mut self, tag: SessionTag) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.tag != tag);
        self.total_memory = self.entries.iter().map(|e| e.memory).sum();
        let removed = before - self.entries.len();
        if removed > 0 {
            log::debug!("disposed {removed} {tag:?} snapshot(s)");
        }
        removed
    }

    pub fn get(&self, id: SnapshotId) -> Option<&StackSnapshot> {
        self.entries.iter().find(|e| e.id == id).map(|e| &e.snapshot)
    }

    pub fn latest(&self) -> Option<SnapshotId> {
        self.entries.back().map(|e| e.id)
    }

    /// (id, tag, description), oldest first.
    pub fn history(&self) -> Vec<(SnapshotId, SessionTag, String)> {
        self.entries.iter().map(|e| (e.id, e.tag, e.description.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn memory_usage(&self) -> usize {
        self.total_memory
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_memory = 0;
    }
}

#[cfg(test)]
mod tests {
    use image::Rgba;
    use kurbo::Point;

    use super::*;

    fn stack_with(n: u8) -> (LayerStack, Vec<LayerId>) {
        let mut s = LayerStack::new(Size::new(20.0, 20.0)).unwrap();
        let ids = (0..n)
            .map(|i| {
                s.add_layer(TiledImage::new_filled(8, 8, Rgba([i * 30, 0, 0, 255])).unwrap(), None)
                    .unwrap()
            })
            .collect();
        (s, ids)
    }

    #[test]
    fn restore_round_trips_after_mutation() {
        let (mut s, ids) = stack_with(3);
        s.set_active_layer(Some(ids[1])).unwrap();
        let mut history = SnapshotManager::default();
        let snap = history.snapshot(&s).unwrap();
        let before = StackSnapshot::capture(&s);

        s.swap_order(ids[0], ids[2]).unwrap();
        s.set_position(ids[1], Some(Point::new(4.0, 4.0))).unwrap();
        s.get(ids[0]).unwrap().pixels_mut().put_pixel(0, 0, Rgba([1, 1, 1, 1]));
        s.remove_layer(ids[2]).unwrap();

        history.restore(&mut s, snap).unwrap();
        assert_eq!(StackSnapshot::capture(&s), before);
        assert_eq!(s.active_layer_id(), Some(ids[1]));
    }

    #[test]
    fn snapshot_does_not_alias_live_buffers() {
        let (s, ids) = stack_with(1);
        let mut history = SnapshotManager::default();
        let snap = history.snapshot(&s).unwrap();
        s.get(ids[0]).unwrap().pixels_mut().put_pixel(2, 2, Rgba([0, 0, 0, 0]));
        let stored = history.get(snap).unwrap();
        assert_eq!(stored.layers[0].pixels.get_pixel(2, 2)[3], 255);
    }

    #[test]
    fn restore_truncates_later_entries() {
        let (mut s, ids) = stack_with(2);
        let mut history = SnapshotManager::default();
        let first = history.snapshot(&s).unwrap();
        s.toggle_visibility(ids[0]).unwrap();
        let second = history.snapshot(&s).unwrap();
        history.restore(&mut s, first).unwrap();
        assert_eq!(history.len(), 1);
        assert!(matches!(history.restore(&mut s, second), Err(EngineError::InvalidArgument(_))));
        assert!(s.get(ids[0]).unwrap().is_visible());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let (s, _) = stack_with(1);
        let mut history = SnapshotManager::new(2);
        let a = history.snapshot(&s).unwrap();
        let b = history.snapshot(&s).unwrap();
        let c = history.snapshot(&s).unwrap();
        assert!(history.get(a).is_none());
        assert_eq!(history.history().iter().map(|h| h.0).collect::<Vec<_>>(), vec![b, c]);
    }

    #[test]
    fn oversized_snapshot_is_rejected() {
        let (s, _) = stack_with(2);
        let mut history = SnapshotManager::new(5).with_memory_limit(Some(1024));
        assert!(matches!(history.snapshot(&s), Err(EngineError::CapacityExceeded(_))));
        assert!(history.is_empty());
        assert_eq!(history.memory_usage(), 0);
    }

    #[test]
    fn unclamped_memory_setting_saturates() {
        let settings = EngineSettings {
            snapshot_memory_mb: usize::MAX,
            ..EngineSettings::default()
        };
        let (s, _) = stack_with(1);
        let mut history = SnapshotManager::from_settings(&settings);
        assert!(history.snapshot(&s).is_ok());
    }

    #[test]
    fn dispose_drops_session_without_restoring() {
        let (mut s, ids) = stack_with(1);
        let mut history = SnapshotManager::default();
        history.snapshot(&s).unwrap();
        history.snapshot_tagged(&s, SessionTag::MagicWand, "wand").unwrap();
        s.toggle_visibility(ids[0]).unwrap();
        history.snapshot_tagged(&s, SessionTag::MagicWand, "wand").unwrap();
        assert_eq!(history.dispose(SessionTag::MagicWand), 2);
        assert_eq!(history.len(), 1);
        assert!(!s.get(ids[0]).unwrap().is_visible());
    }

    #[test]
    fn undo_steps_back_one_entry() {
        let (mut s, ids) = stack_with(1);
        let mut history = SnapshotManager::default();
        assert_eq!(history.undo(&mut s).unwrap(), None);
        let first = history.snapshot(&s).unwrap();
        s.set_rotation(ids[0], 1.0).unwrap();
        history.snapshot(&s).unwrap();
        assert_eq!(history.undo(&mut s).unwrap(), Some(first));
        assert_eq!(s.get(ids[0]).unwrap().rotation(), 0.0);
        assert_eq!(history.latest(), Some(first));
    }
}
