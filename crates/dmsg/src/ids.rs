//! Circuit id allocation.
//!
//! Circuit ids are 16-bit and scoped to one physical connection. The parity
//! of an id encodes which side of the link allocated it, so the two ends
//! never race for the same id:
//!
//! - even: allocated by the client (client-initiated circuits)
//! - odd: allocated by the relay (circuits relayed *to* this client)
//!
//! Each side owns one [`IdSpace`] over its parity. Slots are tracked in a
//! bitmap; allocation scans forward from a cursor so recently released ids
//! are not reused immediately.

use crate::error::{Error, Result};

/// Number of ids of one parity
pub const IDS_PER_PARITY: usize = 1 << 15;

const WORDS: usize = IDS_PER_PARITY / 64;

/// Which half of the id space a side allocates from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    /// Even ids, allocated by the client end of a link
    Even,
    /// Odd ids, allocated by the relay end of a link
    Odd,
}

impl Parity {
    /// Parity of a given id
    #[must_use]
    pub fn of(id: u16) -> Self {
        if id & 1 == 0 { Self::Even } else { Self::Odd }
    }

    fn bit(self) -> u16 {
        match self {
            Self::Even => 0,
            Self::Odd => 1,
        }
    }
}

/// Bitmap allocator over one parity of the 16-bit circuit id space
#[derive(Clone)]
pub struct IdSpace {
    parity: Parity,
    used: Box<[u64; WORDS]>,
    in_use: usize,
    cursor: usize,
}

impl IdSpace {
    /// Create an empty id space for `parity`
    #[must_use]
    pub fn new(parity: Parity) -> Self {
        Self {
            parity,
            used: Box::new([0u64; WORDS]),
            in_use: 0,
            cursor: 0,
        }
    }

    /// The parity this space allocates
    #[must_use]
    pub fn parity(&self) -> Parity {
        self.parity
    }

    /// Number of ids currently allocated
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Whether `id` is currently allocated
    #[must_use]
    pub fn contains(&self, id: u16) -> bool {
        if Parity::of(id) != self.parity {
            return false;
        }
        let slot = usize::from(id >> 1);
        self.used[slot / 64] & (1 << (slot % 64)) != 0
    }

    /// Allocate the next free id, wrapping around the space
    ///
    /// # Errors
    ///
    /// Returns [`Error::IdsExhausted`] when every id of this parity is in use.
    pub fn allocate(&mut self) -> Result<u16> {
        if self.in_use == IDS_PER_PARITY {
            return Err(Error::IdsExhausted);
        }

        // Scan whole words starting at the cursor's word; the bit offset is
        // respected only for the first word so the scan wraps exactly once.
        let start_word = self.cursor / 64;
        for step in 0..=WORDS {
            let word = (start_word + step) % WORDS;
            let mut free = !self.used[word];
            if step == 0 {
                free &= u64::MAX << (self.cursor % 64);
            }
            if free != 0 {
                let bit = free.trailing_zeros() as usize;
                let slot = word * 64 + bit;
                self.used[word] |= 1 << bit;
                self.in_use += 1;
                self.cursor = (slot + 1) % IDS_PER_PARITY;
                return Ok(self.id_of(slot));
            }
        }

        Err(Error::IdsExhausted)
    }

    /// Mark a specific id as used (no-op for ids of the other parity)
    ///
    /// Returns false if the id was already in use.
    pub fn insert(&mut self, id: u16) -> bool {
        if Parity::of(id) != self.parity || self.contains(id) {
            return false;
        }
        let slot = usize::from(id >> 1);
        self.used[slot / 64] |= 1 << (slot % 64);
        self.in_use += 1;
        true
    }

    /// Release an id so it can be allocated again
    ///
    /// Returns false if the id was not allocated.
    pub fn release(&mut self, id: u16) -> bool {
        if !self.contains(id) {
            return false;
        }
        let slot = usize::from(id >> 1);
        self.used[slot / 64] &= !(1 << (slot % 64));
        self.in_use -= 1;
        true
    }

    #[allow(clippy::cast_possible_truncation)]
    fn id_of(&self, slot: usize) -> u16 {
        ((slot as u16) << 1) | self.parity.bit()
    }
}

impl std::fmt::Debug for IdSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdSpace")
            .field("parity", &self.parity)
            .field("in_use", &self.in_use)
            .field("cursor", &self.cursor)
            .finish()
    }
}
