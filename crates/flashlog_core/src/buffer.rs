//! In-memory staging buffer for buffered sessions.

/// A fixed-capacity circular byte buffer.
///
/// Producers append whole `log` calls; the flush job drains everything at
/// once. An append either fits completely or changes nothing.
#[derive(Debug)]
pub struct ActiveBuffer {
    storage: Box<[u8]>,
    head: usize,
    len: usize,
}

impl ActiveBuffer {
    /// Creates a buffer backed by `storage`. Its contents are ignored.
    #[must_use]
    pub fn new(storage: Vec<u8>) -> Self {
        Self {
            storage: storage.into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    /// Creates a zeroed buffer of `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(vec![0u8; capacity])
    }

    /// Returns the total capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Returns the number of staged bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the free space.
    #[must_use]
    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    /// Appends `data` if it fits entirely. Returns false otherwise.
    pub fn push(&mut self, data: &[u8]) -> bool {
        if data.len() > self.free() {
            return false;
        }
        let cap = self.capacity();
        let tail = (self.head + self.len) % cap.max(1);
        let first = data.len().min(cap - tail);
        self.storage[tail..tail + first].copy_from_slice(&data[..first]);
        self.storage[..data.len() - first].copy_from_slice(&data[first..]);
        self.len += data.len();
        true
    }

    /// Removes and returns up to `max` staged bytes, oldest first.
    pub fn take(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.len);
        let cap = self.capacity();
        let first = n.min(cap - self.head);
        let mut out = Vec::with_capacity(n);
        out.extend_from_slice(&self.storage[self.head..self.head + first]);
        out.extend_from_slice(&self.storage[..n - first]);
        self.len -= n;
        self.head = if self.len == 0 {
            0
        } else {
            (self.head + n) % cap
        };
        out
    }

    /// Removes and returns every staged byte in append order.
    pub fn drain(&mut self) -> Vec<u8> {
        self.take(self.len)
    }
}
