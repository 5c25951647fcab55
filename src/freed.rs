/// A fixed-size ring of recently freed user addresses.
///
/// Once full, each insertion overwrites the oldest entry; entries are never
/// removed otherwise. Membership is only a hint: an address can be handed
/// out again by the host after it was recorded here.
pub struct FreedCache {
    ring: Vec<usize>,
    capacity: usize,
    pos: usize,
}

impl FreedCache {
    pub fn new(capacity: usize) -> Self {
        FreedCache {
            ring: Vec::with_capacity(capacity),
            capacity,
            pos: 0,
        }
    }

    /// Record a freed address.
    pub fn record(&mut self, addr: usize) {
        if self.capacity == 0 {
            return;
        }
        if self.ring.len() < self.capacity {
            self.ring.push(addr);
        } else {
            self.ring[self.pos] = addr;
        }
        self.pos = (self.pos + 1) % self.capacity;
    }

    /// Check if an address was recently freed (linear scan).
    pub fn contains(&self, addr: usize) -> bool {
        self.ring.iter().any(|&a| a == addr)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}
