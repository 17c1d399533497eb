//! Sparse descriptor table with lowest-free reuse.

use std::collections::BTreeSet;

use crate::resource::Resource;

/// A guest-visible handle to an open [`Resource`].
pub type Descriptor = usize;

/// The open resources of one process, indexed by descriptor.
///
/// Invariants:
/// - an open descriptor always has an occupied slot;
/// - `free` holds exactly the empty slots below `slots.len()`;
/// - `insert` reuses the lowest free slot before growing the table.
#[derive(Default)]
pub struct DescriptorTable {
    slots: Vec<Option<Box<dyn Resource>>>,
    free: BTreeSet<Descriptor>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a resource and return its descriptor.
    pub fn insert(&mut self, resource: Box<dyn Resource>) -> Descriptor {
        if let Some(fd) = self.free.pop_first() {
            self.slots[fd] = Some(resource);
            return fd;
        }
        self.slots.push(Some(resource));
        self.slots.len() - 1
    }

    /// The resource behind an open descriptor.
    pub fn get_mut(&mut self, fd: Descriptor) -> Option<&mut Box<dyn Resource>> {
        self.slots.get_mut(fd).and_then(Option::as_mut)
    }

    /// Empty a slot, returning what was there.
    ///
    /// Removing an already-empty or out-of-range descriptor is a no-op that
    /// returns `None`; it never touches another slot.
    pub fn remove(&mut self, fd: Descriptor) -> Option<Box<dyn Resource>> {
        let resource = self.slots.get_mut(fd)?.take()?;
        self.free.insert(fd);
        Some(resource)
    }

    pub fn is_open(&self, fd: Descriptor) -> bool {
        matches!(self.slots.get(fd), Some(Some(_)))
    }

    /// Number of open descriptors.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots, open or free.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Open descriptors in ascending order.
    pub fn descriptors(&self) -> impl Iterator<Item = Descriptor> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(fd, slot)| slot.as_ref().map(|_| fd))
    }

    /// Take every open resource out of the table, leaving it empty.
    pub fn drain(&mut self) -> Vec<(Descriptor, Box<dyn Resource>)> {
        let drained = std::mem::take(&mut self.slots)
            .into_iter()
            .enumerate()
            .filter_map(|(fd, slot)| slot.map(|resource| (fd, resource)))
            .collect();
        self.free.clear();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    struct Named(&'static str);

    impl Resource for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            Ok(data.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn named(name: &'static str) -> Box<dyn Resource> {
        Box::new(Named(name))
    }

    #[test]
    fn descriptors_grow_sequentially() {
        let mut table = DescriptorTable::new();
        assert_eq!(table.insert(named("a")), 0);
        assert_eq!(table.insert(named("b")), 1);
        assert_eq!(table.insert(named("c")), 2);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn lowest_free_slot_is_reused_first() {
        let mut table = DescriptorTable::new();
        for name in ["a", "b", "c", "d"] {
            table.insert(named(name));
        }
        table.remove(3).unwrap();
        table.remove(1).unwrap();
        table.remove(2).unwrap();

        assert_eq!(table.insert(named("e")), 1);
        assert_eq!(table.insert(named("f")), 2);
        assert_eq!(table.insert(named("g")), 3);
        assert_eq!(table.insert(named("h")), 4);
        assert_eq!(table.capacity(), 5);
    }

    #[test]
    fn double_remove_does_not_double_book_slot() {
        let mut table = DescriptorTable::new();
        let fd = table.insert(named("x"));
        assert!(table.remove(fd).is_some());
        assert!(table.remove(fd).is_none());

        assert_eq!(table.insert(named("y")), fd);
        assert_eq!(table.insert(named("z")), fd + 1);
    }

    #[test]
    fn out_of_range_is_none() {
        let mut table = DescriptorTable::new();
        assert!(table.get_mut(0).is_none());
        assert!(table.remove(42).is_none());
        assert!(!table.is_open(7));
    }

    #[test]
    fn open_descriptors_are_unique_under_churn() {
        let mut table = DescriptorTable::new();
        let mut open: Vec<Descriptor> = Vec::new();

        for round in 0..50usize {
            if round % 3 == 2 && !open.is_empty() {
                let fd = open.remove(round % open.len());
                table.remove(fd).unwrap();
            } else {
                let fd = table.insert(named("r"));
                assert!(!open.contains(&fd));
                let lowest_free = (0..).find(|i| !open.contains(i)).unwrap();
                assert_eq!(fd, lowest_free);
                open.push(fd);
            }
        }
        assert_eq!(table.len(), open.len());

        let mut listed: Vec<_> = table.descriptors().collect();
        open.sort_unstable();
        listed.sort_unstable();
        assert_eq!(listed, open);
    }

    #[test]
    fn drain_empties_table() {
        let mut table = DescriptorTable::new();
        table.insert(named("a"));
        table.insert(named("b"));
        table.remove(0);

        let drained = table.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, 1);
        assert_eq!(drained[0].1.name(), "b");
        assert!(table.is_empty());
        assert_eq!(table.insert(named("c")), 0);
    }
}
