use std::collections::HashMap;

/// Stable integer slots for blobs and weight-bearing layers.
///
/// Slots are handed out in first-seen order and never released, so the order in which a
/// compilation touches names is part of the generated code's contract. Cloning gives an
/// independent snapshot that can seed a separate compilation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexTables {
    blobs: HashMap<String, usize>,
    // Every registered name, aliases included, in registration order.
    blob_order: Vec<(String, usize)>,
    blob_count: usize,
    layers: HashMap<String, usize>,
    layer_names: Vec<String>,
}

impl IndexTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing slot of `name`, or the next free one.
    pub fn blob_slot(&mut self, name: &str) -> usize {
        if let Some(&slot) = self.blobs.get(name) {
            return slot;
        }
        let slot = self.blob_count;
        self.blob_count += 1;
        self.blobs.insert(name.to_string(), slot);
        self.blob_order.push((name.to_string(), slot));
        slot
    }

    /// Makes `name` resolve to the slot of `to` without allocating. `to` is registered first if
    /// needed. A name that already has a slot keeps it.
    pub fn alias_blob(&mut self, name: &str, to: &str) -> usize {
        if let Some(&slot) = self.blobs.get(name) {
            return slot;
        }
        let slot = self.blob_slot(to);
        self.blobs.insert(name.to_string(), slot);
        self.blob_order.push((name.to_string(), slot));
        slot
    }

    pub fn lookup_blob(&self, name: &str) -> Option<usize> {
        self.blobs.get(name).copied()
    }

    pub fn layer_slot(&mut self, name: &str) -> usize {
        if let Some(&slot) = self.layers.get(name) {
            return slot;
        }
        let slot = self.layer_names.len();
        self.layers.insert(name.to_string(), slot);
        self.layer_names.push(name.to_string());
        slot
    }

    pub fn lookup_layer(&self, name: &str) -> Option<usize> {
        self.layers.get(name).copied()
    }

    pub fn blob_count(&self) -> usize {
        self.blob_count
    }

    pub fn layer_count(&self) -> usize {
        self.layer_names.len()
    }

    /// Registered blob names with their slots, aliases included, in registration order.
    pub fn blobs(&self) -> impl Iterator<Item = (&str, usize)> {
        self.blob_order.iter().map(|(n, s)| (n.as_str(), *s))
    }

    pub fn layer_names(&self) -> &[String] {
        &self.layer_names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_slots_are_first_seen() {
        let mut t = IndexTables::new();
        assert_eq!(t.blob_slot("data"), 0);
        assert_eq!(t.blob_slot("conv1"), 1);
        assert_eq!(t.blob_slot("data"), 0);
        assert_eq!(t.blob_count(), 2);
    }

    #[test]
    fn test_alias_shares_slot() {
        let mut t = IndexTables::new();
        t.blob_slot("a");
        assert_eq!(t.alias_blob("a_reshape", "a"), 0);
        assert_eq!(t.blob_count(), 1);
        assert_eq!(t.lookup_blob("a_reshape"), Some(0));
        // Already registered names keep their own slot.
        t.blob_slot("b");
        assert_eq!(t.alias_blob("b", "a"), 1);
        let names: Vec<_> = t.blobs().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "a_reshape", "b"]);
    }

    #[test]
    fn test_layer_slots_idempotent() {
        let mut t = IndexTables::new();
        assert_eq!(t.layer_slot("conv1"), 0);
        assert_eq!(t.layer_slot("fc"), 1);
        assert_eq!(t.layer_slot("conv1"), 0);
        assert_eq!(t.layer_count(), 2);
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut t = IndexTables::new();
        t.blob_slot("data");
        let mut fork = t.clone();
        fork.blob_slot("extra");
        assert_eq!(t.blob_count(), 1);
        assert_eq!(fork.blob_count(), 2);
    }
}
