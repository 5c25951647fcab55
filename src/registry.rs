use core::fmt;
use core::ops::BitOr;
use std::collections::VecDeque;

/// State bits for a tracked allocation.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AllocFlags(u32);

impl AllocFlags {
    pub const ACTIVE: AllocFlags = AllocFlags(0x01);
    pub const FREED: AllocFlags = AllocFlags(0x02);
    pub const GUARDED: AllocFlags = AllocFlags(0x04);
    pub const ZEROED: AllocFlags = AllocFlags(0x08);
    pub const ALIGNED: AllocFlags = AllocFlags(0x10);
    pub const TRACKED: AllocFlags = AllocFlags(0x20);

    const NAMES: [(AllocFlags, &'static str); 6] = [
        (AllocFlags::ACTIVE, "ACTIVE"),
        (AllocFlags::FREED, "FREED"),
        (AllocFlags::GUARDED, "GUARDED"),
        (AllocFlags::ZEROED, "ZEROED"),
        (AllocFlags::ALIGNED, "ALIGNED"),
        (AllocFlags::TRACKED, "TRACKED"),
    ];

    pub const fn empty() -> Self {
        AllocFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: AllocFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: AllocFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: AllocFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for AllocFlags {
    type Output = AllocFlags;

    fn bitor(self, rhs: AllocFlags) -> AllocFlags {
        AllocFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for AllocFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for &(flag, name) in AllocFlags::NAMES.iter() {
            if self.contains(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "(empty)")?;
        }
        Ok(())
    }
}

/// What the registry knows about one allocation.
///
/// Addresses are kept as plain integers; the registry never dereferences
/// them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationRecord {
    /// The pointer handed to the caller.
    pub user: usize,
    /// The block returned by the host allocator.
    pub original: usize,
    /// Bytes requested by the caller.
    pub size: usize,
    /// Bytes requested from the host, framing included.
    pub block_size: usize,
    pub flags: AllocFlags,
}

/// A stable handle to a registry slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

/// A slot plus the generation of the record it held when the ticket was
/// taken. A ticket goes stale once that record is forgotten and the slot
/// reused, even if the new record has the same address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ticket {
    pub id: SlotId,
    generation: u64,
}

struct Entry {
    record: AllocationRecord,
    generation: u64,
    prev: Option<SlotId>,
    next: Option<SlotId>,
    retired: bool,
}

/// A `Registry` tracks every allocation handed out by the safety layer.
///
/// Records live in an arena of slots. Live records form a doubly linked list
/// threaded through the arena by [`SlotId`](struct.SlotId.html), newest
/// first. Freed records are *retired*: unlinked from the live list and kept
/// in a bounded queue so that a second free or a late validation can still
/// be recognised. When the queue is full the oldest retired record is
/// forgotten and its slot reused.
///
/// It maintains a few internal invariants:
///
/// - `head` has no `prev`; for every live entry, `next.prev` points back.
/// - A slot is live, retired, or vacant (`None` and listed in `vacant`).
/// - At most one live or retired record exists per user address.
///
/// The registry is not synchronised itself; the allocator keeps it behind a
/// lock.
pub struct Registry {
    slots: Vec<Option<Entry>>,
    vacant: Vec<usize>,
    head: Option<SlotId>,
    live: usize,
    retired: VecDeque<SlotId>,
    retired_capacity: usize,
    next_generation: u64,
}

pub struct LiveIter<'reg> {
    registry: &'reg Registry,
    next: Option<SlotId>,
}

impl<'reg> Iterator for LiveIter<'reg> {
    type Item = (SlotId, &'reg AllocationRecord);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;
        let entry = self.registry.entry(id)?;
        self.next = entry.next;
        Some((id, &entry.record))
    }
}

impl<'reg> IntoIterator for &'reg Registry {
    type Item = (SlotId, &'reg AllocationRecord);
    type IntoIter = LiveIter<'reg>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_live()
    }
}

impl fmt::Display for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Registry(")?;
        let mut start = true;
        for (_, record) in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "Record({:#x}, {})", record.user, record.size)?;
        }

        write!(f, "; {} retired)", self.retired.len())
    }
}

/// Validity contains a representation of all invalid states found in a
/// Registry.
#[derive(Default, Debug)]
pub struct Validity {
    /// Live entries whose `prev` does not point at the entry before them.
    pub broken_links: usize,
    /// Links that point at a vacant or retired slot.
    pub dangling: usize,
    /// Whether the counted live length disagrees with the tracked one.
    pub length_mismatch: bool,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.broken_links == 0 && self.dangling == 0 && !self.length_mismatch
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

impl Registry {
    pub fn new(retired_capacity: usize) -> Self {
        Registry {
            slots: Vec::new(),
            vacant: Vec::new(),
            head: None,
            live: 0,
            retired: VecDeque::with_capacity(retired_capacity),
            retired_capacity,
            next_generation: 0,
        }
    }

    fn entry(&self, id: SlotId) -> Option<&Entry> {
        self.slots.get(id.0)?.as_ref()
    }

    fn entry_mut(&mut self, id: SlotId) -> Option<&mut Entry> {
        self.slots.get_mut(id.0)?.as_mut()
    }

    /// Track a new allocation. Any retired record for the same user address
    /// is dropped first: the host has handed that address out again.
    pub fn insert(&mut self, record: AllocationRecord) -> SlotId {
        if let Some(pos) = self
            .retired
            .iter()
            .position(|&id| self.entry(id).map(|e| e.record.user) == Some(record.user))
        {
            if let Some(stale) = self.retired.remove(pos) {
                self.vacate(stale);
            }
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        let entry = Entry {
            record,
            generation,
            prev: None,
            next: self.head,
            retired: false,
        };
        let id = match self.vacant.pop() {
            Some(index) => {
                self.slots[index] = Some(entry);
                SlotId(index)
            }
            None => {
                self.slots.push(Some(entry));
                SlotId(self.slots.len() - 1)
            }
        };

        if let Some(old_head) = self.head {
            if let Some(e) = self.entry_mut(old_head) {
                e.prev = Some(id);
            }
        }
        self.head = Some(id);
        self.live += 1;
        id
    }

    // Cut a live entry out of the list.
    fn unlink(&mut self, id: SlotId) {
        let (prev, next) = match self.entry_mut(id) {
            Some(e) if !e.retired => (e.prev.take(), e.next.take()),
            _ => return,
        };

        match prev {
            Some(p) => {
                if let Some(e) = self.entry_mut(p) {
                    e.next = next;
                }
            }
            None => self.head = next,
        }
        if let Some(n) = next {
            if let Some(e) = self.entry_mut(n) {
                e.prev = prev;
            }
        }
        self.live -= 1;
    }

    fn vacate(&mut self, id: SlotId) -> Option<AllocationRecord> {
        let entry = self.slots.get_mut(id.0)?.take()?;
        self.vacant.push(id.0);
        Some(entry.record)
    }

    /// Move a live record to the retired queue, evicting the oldest retired
    /// record if the queue is full.
    pub fn retire(&mut self, id: SlotId) {
        match self.entry(id) {
            Some(e) if !e.retired => {}
            _ => return,
        }
        self.unlink(id);

        if self.retired_capacity == 0 {
            self.vacate(id);
            return;
        }
        if let Some(e) = self.entry_mut(id) {
            e.retired = true;
        }
        self.retired.push_back(id);
        while self.retired.len() > self.retired_capacity {
            if let Some(oldest) = self.retired.pop_front() {
                self.vacate(oldest);
            }
        }
    }

    /// Forget a record entirely, live or retired.
    pub fn remove(&mut self, id: SlotId) -> Option<AllocationRecord> {
        let retired = self.entry(id)?.retired;
        if retired {
            if let Some(pos) = self.retired.iter().position(|&r| r == id) {
                self.retired.remove(pos);
            }
        } else {
            self.unlink(id);
        }
        self.vacate(id)
    }

    /// Find the record whose user pointer is `addr`, live records first,
    /// then retired ones from newest to oldest.
    pub fn find_by_user(&self, addr: usize) -> Option<SlotId> {
        if let Some((id, _)) = self.iter_live().find(|(_, r)| r.user == addr) {
            return Some(id);
        }
        self.retired
            .iter()
            .rev()
            .copied()
            .find(|&id| self.entry(id).map(|e| e.record.user) == Some(addr))
    }

    pub fn get(&self, id: SlotId) -> Option<&AllocationRecord> {
        self.entry(id).map(|e| &e.record)
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut AllocationRecord> {
        self.entry_mut(id).map(|e| &mut e.record)
    }

    /// A ticket for the record now in `id`.
    pub fn ticket(&self, id: SlotId) -> Option<Ticket> {
        self.entry(id).map(|e| Ticket {
            id,
            generation: e.generation,
        })
    }

    /// The record a ticket was taken for, if it is still live.
    pub fn redeem(&self, ticket: Ticket) -> Option<&AllocationRecord> {
        match self.entry(ticket.id) {
            Some(e) if e.generation == ticket.generation && !e.retired => Some(&e.record),
            _ => None,
        }
    }

    pub fn iter_live(&self) -> LiveIter<'_> {
        LiveIter {
            registry: self,
            next: self.head,
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    /// Walk the live list and check its links.
    pub fn validity(&self) -> Validity {
        let mut validity = Validity::default();
        let mut previous: Option<SlotId> = None;
        let mut cursor = self.head;
        let mut counted = 0;

        while let Some(id) = cursor {
            let entry = match self.entry(id) {
                Some(e) if !e.retired => e,
                _ => {
                    validity.dangling += 1;
                    break;
                }
            };
            if entry.prev != previous {
                validity.broken_links += 1;
            }
            counted += 1;
            if counted > self.slots.len() {
                // A cycle; every further step would be a repeat.
                validity.broken_links += 1;
                break;
            }
            previous = Some(id);
            cursor = entry.next;
        }

        validity.length_mismatch = counted != self.live;
        for &id in &self.retired {
            match self.entry(id) {
                Some(e) if e.retired => {}
                _ => validity.dangling += 1,
            }
        }
        validity
    }
}
