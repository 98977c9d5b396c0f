use super::Arena;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

struct Attachment {
    arena: Arc<Arena>,
    refs: usize,
}

/// Named arena segments shared between the components of a process.
///
/// The first component to ask for a segment creates it and learns that it
/// did, which is its cue to populate the segment (for example from a
/// snapshot file). Later components attach to the existing one. A segment
/// disappears when its last attachment detaches.
#[derive(Default)]
pub struct SegmentRegistry {
    segments: Mutex<HashMap<String, Attachment>>,
}

impl SegmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches to the named segment, creating it if needed. The flag is true
    /// when this call created the segment.
    pub fn attach_or_create(
        &self,
        name: &str,
        initial_size: usize,
        max_size: usize,
    ) -> (Arc<Arena>, bool) {
        let mut segments = self.segments.lock();
        if let Some(att) = segments.get_mut(name) {
            att.refs += 1;
            return (Arc::clone(&att.arena), false);
        }

        let arena = Arc::new(Arena::new(name, initial_size, max_size));
        segments.insert(
            name.to_string(),
            Attachment {
                arena: Arc::clone(&arena),
                refs: 1,
            },
        );
        tracing::debug!(segment = name, "Created arena segment");
        (arena, true)
    }

    /// Drops one attachment. Returns true if the segment was destroyed.
    pub fn detach(&self, name: &str) -> bool {
        let mut segments = self.segments.lock();
        let destroy = match segments.get_mut(name) {
            Some(att) => {
                att.refs = att.refs.saturating_sub(1);
                att.refs == 0
            }
            None => return false,
        };

        if destroy {
            segments.remove(name);
            tracing::debug!(segment = name, "Destroyed arena segment");
        }
        destroy
    }

    pub fn attachments(&self, name: &str) -> usize {
        self.segments.lock().get(name).map_or(0, |att| att.refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ChunkAllocator;

    #[test]
    fn test_first_attach_creates() {
        let registry = SegmentRegistry::new();

        let (first, created) = registry.attach_or_create("texts", 64, 1024);
        assert!(created);

        let (second, created) = registry.attach_or_create("texts", 64, 1024);
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.attachments("texts"), 2);
    }

    #[test]
    fn test_last_detach_destroys() {
        let registry = SegmentRegistry::new();
        let (arena, _) = registry.attach_or_create("data", 64, 1024);
        let handle = arena.allocate(8).unwrap();

        let (again, created) = registry.attach_or_create("data", 64, 1024);
        assert!(!created);
        assert!(again.resolve(handle).is_ok());

        assert!(!registry.detach("data"));
        assert!(registry.detach("data"));
        assert_eq!(registry.attachments("data"), 0);
        assert!(!registry.detach("data"));

        // A fresh segment starts empty
        let (fresh, created) = registry.attach_or_create("data", 64, 1024);
        assert!(created);
        assert!(fresh.resolve(handle).is_err());
    }
}
