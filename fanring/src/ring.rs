use crate::error::RingError;

/// Position of one reader inside the ring.
///
/// `pos` indexes into the ring storage, `lap` counts how often the cursor
/// has wrapped from the end of the storage back to the start. The writer
/// keeps the same pair, so "caught up" and "one lap behind" stay
/// distinguishable even when the positions coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pos: usize,
    lap: u64,
}

impl Cursor {
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn lap(&self) -> u64 {
        self.lap
    }
}

/// Cyclic byte storage with a single writer head.
///
/// The writer appends through [`Ring::reserve`] / [`Ring::commit`]; readers
/// consume through [`Ring::readable`] / [`Ring::advance`] at their own
/// pace. Committing past a lagging reader repairs that reader's cursor, so
/// a cursor never points into bytes that no longer exist.
#[derive(Debug)]
pub struct Ring {
    data: Box<[u8]>,
    head: usize,
    lap: u64,
}

impl Ring {
    pub fn new(capacity: usize) -> Result<Self, RingError> {
        if capacity == 0 {
            return Err(RingError::ZeroCapacity);
        }
        Ok(Ring {
            data: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            lap: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Current write position, always within `[0, capacity)`.
    pub fn head(&self) -> usize {
        self.head
    }

    /// How many times the head has wrapped back to the start.
    pub fn lap(&self) -> u64 {
        self.lap
    }

    /// The contiguous free span at the head, up to the end of the storage.
    /// Never empty. A write crossing the wrap boundary takes two
    /// reserve/commit rounds.
    pub fn reserve(&mut self) -> &mut [u8] {
        let head = self.head;
        &mut self.data[head..]
    }

    /// Publish `n` bytes previously copied into [`Ring::reserve`], and
    /// repair every reader the write ran over.
    ///
    /// A reader is lapped when it trails the head by a full lap and its
    /// position falls at or inside the span just written; the span holds
    /// the bytes the reader would have read next. Such a reader is snapped
    /// to the end of the write, i.e. exactly onto the new head, losing the
    /// overwritten history but continuing with fresh data.
    pub fn commit<'a, I>(&mut self, n: usize, readers: I)
    where
        I: IntoIterator<Item = &'a mut Cursor>,
    {
        assert!(n <= self.data.len() - self.head, "commit past end of storage");
        if n == 0 {
            return;
        }
        let end = self.head + n;
        for cursor in readers {
            if cursor.lap < self.lap && cursor.pos <= end {
                cursor.pos = end;
                cursor.lap = self.lap;
                if cursor.pos == self.data.len() {
                    cursor.pos = 0;
                    cursor.lap += 1;
                }
            }
        }
        self.head = end;
        if self.head == self.data.len() {
            self.head = 0;
            self.lap += 1;
        }
    }

    /// The contiguous span `cursor` may consume right now.
    ///
    /// The span never crosses the wrap boundary: a reader in the previous
    /// lap sees bytes up to the end of the storage and picks up the rest,
    /// from the start, on its next call.
    pub fn readable(&self, cursor: &Cursor) -> &[u8] {
        let end = if cursor.pos < self.head {
            self.head
        } else if cursor.pos == self.head && cursor.lap == self.lap {
            cursor.pos
        } else {
            self.data.len()
        };
        &self.data[cursor.pos..end]
    }

    /// Move a reader forward over `n` consumed bytes.
    pub fn advance(&self, cursor: &mut Cursor, n: usize) {
        debug_assert!(n <= self.readable(cursor).len(), "advance past readable span");
        cursor.pos += n;
        if cursor.pos == self.data.len() {
            cursor.pos = 0;
            cursor.lap += 1;
        }
    }

    /// A new reader starts at the head, one lap back, so it replays
    /// whatever the storage still holds before catching up to live data.
    /// Before the first wrap there is no full lap of history yet and the
    /// reader starts caught up.
    pub fn attach(&self) -> Cursor {
        Cursor {
            pos: self.head,
            lap: self.lap.saturating_sub(1),
        }
    }
}
