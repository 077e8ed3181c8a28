/// Fixed-capacity ring buffer. Storage is allocated once in `new`; pushing
/// past capacity overwrites the oldest element.
#[derive(Debug, Clone)]
pub struct Ring<T: Copy + Default> {
    items: Vec<T>,
    head: usize,
    len: usize,
}

impl<T: Copy + Default> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: vec![T::default(); capacity.max(1)],
            head: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the evicted element when the ring was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let cap = self.items.len();
        let slot = (self.head + self.len) % cap;
        if self.len < cap {
            self.items[slot] = item;
            self.len += 1;
            None
        } else {
            let old = std::mem::replace(&mut self.items[self.head], item);
            self.head = (self.head + 1) % cap;
            Some(old)
        }
    }

    /// Element `index` counted from the oldest.
    pub fn get(&self, index: usize) -> Option<T> {
        (index < self.len).then(|| self.items[(self.head + index) % self.items.len()])
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = T> + '_ {
        (0..self.len).map(move |i| self.items[(self.head + i) % self.items.len()])
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrites_oldest_when_full() {
        let mut ring = Ring::new(3);
        assert_eq!(ring.push(1), None);
        ring.push(2);
        assert_eq!(ring.push(3), None);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.push(4), Some(1));
        assert_eq!(ring.iter().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(ring.iter().rev().collect::<Vec<_>>(), vec![4, 3, 2]);
        assert_eq!(ring.get(2), Some(4));
        assert_eq!(ring.get(0), Some(2));
        assert_eq!(ring.get(3), None);
    }

    #[test]
    fn never_grows() {
        let mut ring = Ring::new(4);
        for i in 0..100 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.iter().collect::<Vec<_>>(), vec![96, 97, 98, 99]);
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.get(0), None);
    }
}
