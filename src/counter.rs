//! RegularFileCounter: the coordinate system shared by client and server.
//!
//! Only regular files with a nonzero size receive a number, assigned from
//! zero in archive order. Both sides derive it independently from the same
//! archive, so the rule here is a protocol invariant: changing it breaks every
//! bitmap already in flight.

use tar::EntryType;

/// True if an entry of this kind and size is addressable by the bitmap.
pub fn is_counted(kind: EntryType, size: u64) -> bool {
    kind == EntryType::Regular && size > 0
}

#[derive(Debug, Default, Clone)]
pub struct RegularFileCounter {
    next: u64,
}

impl RegularFileCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number the entry if it is counted; uncounted entries leave the
    /// sequence untouched.
    pub fn assign(&mut self, kind: EntryType, size: u64) -> Option<u64> {
        if !is_counted(kind, size) {
            return None;
        }
        let value = self.next;
        self.next += 1;
        Some(value)
    }

    /// How many values have been handed out.
    pub fn count(&self) -> u64 {
        self.next
    }
}
