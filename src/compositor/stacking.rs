//! Stacking order
//!
//! Window ids bottom-to-top. Index 0 is the bottom of the stack and is
//! drawn first.

#[derive(Debug, Default, Clone)]
pub struct StackingOrder {
    ids: Vec<u32>,
}

impl StackingOrder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.ids.contains(&id)
    }

    pub fn position(&self, id: u32) -> Option<usize> {
        self.ids.iter().position(|&w| w == id)
    }

    /// Bottom-to-top iteration
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = u32> + '_ {
        self.ids.iter().copied()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.ids
    }

    /// Place `id` on top, moving it if already present.
    pub fn push_top(&mut self, id: u32) {
        self.remove(id);
        self.ids.push(id);
    }

    /// Place `id` at the bottom, moving it if already present.
    pub fn insert_bottom(&mut self, id: u32) {
        self.remove(id);
        self.ids.insert(0, id);
    }

    /// Place `id` directly above `sibling`. Returns false (and leaves the
    /// order untouched) when `sibling` is not in the list.
    pub fn insert_above(&mut self, id: u32, sibling: u32) -> bool {
        if id == sibling || !self.contains(sibling) {
            return false;
        }
        self.remove(id);
        match self.position(sibling) {
            Some(pos) => {
                self.ids.insert(pos + 1, id);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: u32) -> bool {
        match self.position(id) {
            Some(pos) => {
                self.ids.remove(pos);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_restack() {
        let mut order = StackingOrder::new();
        order.push_top(1);
        order.push_top(2);
        order.push_top(3);
        assert_eq!(order.as_slice(), &[1, 2, 3]);

        assert!(order.insert_above(3, 1));
        assert_eq!(order.as_slice(), &[1, 3, 2]);

        order.insert_bottom(2);
        assert_eq!(order.as_slice(), &[2, 1, 3]);

        order.push_top(2);
        assert_eq!(order.as_slice(), &[1, 3, 2]);
    }

    #[test]
    fn test_insert_above_unknown_sibling_is_rejected() {
        let mut order = StackingOrder::new();
        order.push_top(1);
        order.push_top(2);
        assert!(!order.insert_above(1, 99));
        assert!(!order.insert_above(1, 1));
        assert_eq!(order.as_slice(), &[1, 2]);
    }

    #[test]
    fn test_remove() {
        let mut order = StackingOrder::new();
        order.push_top(1);
        order.push_top(2);
        assert!(order.remove(1));
        assert!(!order.remove(1));
        assert_eq!(order.as_slice(), &[2]);
        assert_eq!(order.len(), 1);
    }
}
