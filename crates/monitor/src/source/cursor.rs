//! In-memory cursor for one source handle (no disk persistence).

/// Remembers the highest sequence handed to the session and refuses anything
/// at or below it. A start cursor counts as already delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceGate {
    last: Option<u64>,
}

impl SequenceGate {
    pub fn new(start_after: Option<u64>) -> Self {
        Self { last: start_after }
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }

    /// Returns `true` and advances when `sequence` is new. Events without a
    /// sequence marker cannot be compared and are always admitted.
    pub fn admit(&mut self, sequence: Option<u64>) -> bool {
        let Some(sequence) = sequence else {
            return true;
        };
        match self.last {
            Some(last) if sequence <= last => false,
            _ => {
                self.last = Some(sequence);
                true
            }
        }
    }
}
