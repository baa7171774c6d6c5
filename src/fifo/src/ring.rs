//! Fixed-capacity record ring backing one fifo direction.

/// Tail points at the first readable record, head at the next write slot.
/// `tail == head` means empty; capacity is a power of two and one physical
/// slot is kept free to distinguish full from empty.
pub(crate) struct Ring<T> {
    tail: usize,
    head: usize,
    buf: Vec<T>,
}

#[inline]
fn wrap_index(index: usize, size: usize) -> usize {
    // size is always a power of 2
    debug_assert!(size.is_power_of_two());
    index & (size - 1)
}

impl<T: Copy + Default> Ring<T> {
    /// `depth` is the number of usable slots; the physical buffer is the next
    /// power of two above it.
    pub(crate) fn new(depth: usize) -> Self {
        assert!(depth > 0);
        let cap = (depth + 1).next_power_of_two();
        Ring {
            tail: 0,
            head: 0,
            buf: vec![T::default(); cap],
        }
    }

    #[inline]
    fn cap(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    fn wrap_add(&self, idx: usize, addend: usize) -> usize {
        wrap_index(idx.wrapping_add(addend), self.cap())
    }

    pub(crate) fn len(&self) -> usize {
        self.head.wrapping_sub(self.tail) & (self.cap() - 1)
    }

    pub(crate) fn avail(&self) -> usize {
        self.cap() - self.len() - 1
    }

    /// Returns false when the ring is full.
    pub(crate) fn push(&mut self, record: T) -> bool {
        if self.avail() == 0 {
            return false;
        }
        let head = self.head;
        self.buf[head] = record;
        self.head = self.wrap_add(head, 1);
        true
    }

    /// Copy out up to `out.len()` records, advancing the tail.
    pub(crate) fn pop_into(&mut self, out: &mut [T]) -> usize {
        let count = out.len().min(self.len());
        for slot in out.iter_mut().take(count) {
            *slot = self.buf[self.tail];
            self.tail = self.wrap_add(self.tail, 1);
        }
        count
    }
}
