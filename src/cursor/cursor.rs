//! Forward cursor over a snapshot

use crate::cursor::schema::split_composite;
use crate::error::{CursorError, CursorResult};
use rocksdb::{DBRawIteratorWithThreadMode, DB};

/// Where a new cursor starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position<'a> {
    /// First pair in the store
    Begin,
    /// Past the last pair
    End,
    /// First pair whose key is `>=` the given key
    LowerBound(&'a [u8]),
    /// Exactly this pair, or `End` if it is absent
    AtKeyValue(&'a [u8], &'a [u8]),
}

/// Forward-only cursor yielding `(key, value)` pairs in ascending order.
///
/// Borrows the [`Snapshot`](crate::cursor::Snapshot) it was opened from.
pub struct Cursor<'s> {
    iter: DBRawIteratorWithThreadMode<'s, DB>,
    key_width: usize,
    at_end: bool,
}

impl<'s> Cursor<'s> {
    pub(crate) fn new(
        iter: DBRawIteratorWithThreadMode<'s, DB>,
        key_width: usize,
        at_end: bool,
    ) -> Self {
        Self {
            iter,
            key_width,
            at_end,
        }
    }

    pub fn is_end(&self) -> bool {
        self.at_end || !self.iter.valid()
    }

    /// The pair under the cursor
    pub fn current(&self) -> CursorResult<(&[u8], &[u8])> {
        if self.is_end() {
            self.iter.status()?;
            return Err(CursorError::NoCurrentElement);
        }

        let composite = self.iter.key().ok_or(CursorError::NoCurrentElement)?;
        split_composite(composite, self.key_width).ok_or_else(|| {
            CursorError::Corrupt(format!(
                "stored key of {} bytes is shorter than key width {}",
                composite.len(),
                self.key_width
            ))
        })
    }

    /// Step to the next pair; fails at end
    pub fn advance(&mut self) -> CursorResult<()> {
        if self.is_end() {
            return Err(CursorError::NoCurrentElement);
        }
        self.iter.next();
        self.iter.status()?;
        Ok(())
    }
}

impl Iterator for Cursor<'_> {
    type Item = CursorResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_end() {
            // Surface an iterator error once, then stay at end
            if let Err(e) = self.iter.status() {
                if !self.at_end {
                    self.at_end = true;
                    return Some(Err(e.into()));
                }
            }
            return None;
        }

        let pair = match self.current() {
            Ok((key, value)) => (key.to_vec(), value.to_vec()),
            Err(e) => {
                self.at_end = true;
                return Some(Err(e));
            }
        };
        self.iter.next();
        Some(Ok(pair))
    }
}
