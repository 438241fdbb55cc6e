use super::Handle;

/// Slot storage for scene assets. Removed slots stay vacant so outstanding
/// handles never alias a newer asset.
pub struct AssetCache<T> {
    items: Vec<Option<T>>,
}

impl<T> AssetCache<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn insert(&mut self, item: T) -> Handle<T> {
        let index = self.items.len();
        self.items.push(Some(item));
        Handle::new(index)
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.items.get(handle.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.items.get_mut(handle.index()).and_then(Option::as_mut)
    }

    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        self.items.get_mut(handle.index()).and_then(Option::take)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(index, item)| item.as_ref().map(|item| (Handle::new(index), item)))
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [Option<T>] {
        &mut self.items
    }

    /// Number of live assets.
    pub fn len(&self) -> usize {
        self.items.iter().filter(|item| item.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for AssetCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_slots_are_not_reused() {
        let mut cache = AssetCache::new();
        let a = cache.insert("a");
        assert_eq!(cache.remove(a), Some("a"));
        let b = cache.insert("b");

        assert_ne!(a, b);
        assert!(cache.get(a).is_none());
        assert_eq!(cache.get(b), Some(&"b"));
        assert_eq!(cache.len(), 1);
    }
}
