//! Packed 4-bit dependency counters
//!
//! Two counters per byte, the even operator in the low nibble. The table is
//! written by the host at frame send and decremented by the remote cores as
//! predecessors complete, so every access is a byte-wide atomic.

use crate::error::{Result, SchedError};
use std::sync::atomic::{AtomicU8, Ordering};
use xpu_proto::limits::{counter_bytes, COUNTER_MAX};

/// Dependency counter table for one model in one slot
pub struct DepCounters {
    bytes: Box<[AtomicU8]>,
    len: usize,
}

impl std::fmt::Debug for DepCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepCounters")
            .field("len", &self.len)
            .field("values", &self.snapshot())
            .finish()
    }
}

impl Clone for DepCounters {
    fn clone(&self) -> Self {
        let bytes = self
            .bytes
            .iter()
            .map(|b| AtomicU8::new(b.load(Ordering::Acquire)))
            .collect();
        Self {
            bytes,
            len: self.len,
        }
    }
}

impl DepCounters {
    /// Table of `len` zero counters
    pub fn new(len: usize) -> Self {
        let bytes = (0..counter_bytes(len)).map(|_| AtomicU8::new(0)).collect();
        Self { bytes, len }
    }

    /// Table holding `values`
    ///
    /// # Errors
    ///
    /// Returns an error if any value does not fit in four bits.
    pub fn from_values(values: &[u8]) -> Result<Self> {
        let table = Self::new(values.len());
        for (i, v) in values.iter().enumerate() {
            table.set(i, *v)?;
        }
        Ok(table)
    }

    /// Number of counters
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the table is empty
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    const fn locate(index: usize) -> (usize, u32) {
        (index / 2, if index % 2 == 0 { 0 } else { 4 })
    }

    /// Current value of counter `index`
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn get(&self, index: usize) -> u8 {
        assert!(index < self.len, "Counter index {index} out of range");
        let (byte, shift) = Self::locate(index);
        (self.bytes[byte].load(Ordering::Acquire) >> shift) & COUNTER_MAX
    }

    /// Overwrite counter `index`
    ///
    /// # Errors
    ///
    /// Returns an error for an out-of-range index or a value above 15.
    pub fn set(&self, index: usize, value: u8) -> Result<()> {
        if index >= self.len {
            return Err(SchedError::protocol(format!(
                "counter index {index} out of range ({} operators)",
                self.len
            )));
        }
        if value > COUNTER_MAX {
            return Err(SchedError::exhausted(
                format!("dependency count {value} of operator {index}"),
                usize::from(COUNTER_MAX),
            ));
        }
        let (byte, shift) = Self::locate(index);
        let mask = COUNTER_MAX << shift;
        let _ = self.bytes[byte].fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| {
            Some((b & !mask) | (value << shift))
        });
        Ok(())
    }

    /// Decrement counter `index`, returning the new value
    ///
    /// # Errors
    ///
    /// Decrementing a counter that is already zero means a predecessor
    /// reported twice; that is a protocol violation and the counter is left
    /// untouched.
    pub fn decrement(&self, index: usize) -> Result<u8> {
        if index >= self.len {
            return Err(SchedError::protocol(format!(
                "decrement of operator {index} out of range ({} operators)",
                self.len
            )));
        }
        let (byte, shift) = Self::locate(index);
        let result = self.bytes[byte].fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| {
            let current = (b >> shift) & COUNTER_MAX;
            (current > 0).then(|| b - (1 << shift))
        });
        match result {
            Ok(previous) => Ok(((previous >> shift) & COUNTER_MAX) - 1),
            Err(_) => Err(SchedError::protocol(format!(
                "counter of operator {index} decremented below zero"
            ))),
        }
    }

    /// Copy every counter from `template`
    ///
    /// # Panics
    ///
    /// Panics if the tables have different lengths.
    pub fn reset_from(&self, template: &Self) {
        assert_eq!(self.len, template.len, "Counter table size mismatch");
        for (dst, src) in self.bytes.iter().zip(template.bytes.iter()) {
            dst.store(src.load(Ordering::Acquire), Ordering::Release);
        }
    }

    /// Unpacked values
    pub fn snapshot(&self) -> Vec<u8> {
        (0..self.len).map(|i| self.get(i)).collect()
    }

    /// Counters that have not reached zero
    pub fn residue(&self) -> usize {
        (0..self.len).filter(|i| self.get(*i) != 0).count()
    }

    /// Packed bytes as stored in shared memory
    pub fn packed(&self) -> Vec<u8> {
        self.bytes.iter().map(|b| b.load(Ordering::Acquire)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nibbles_are_packed_low_first() {
        let t = DepCounters::from_values(&[1, 2, 15]).unwrap();
        assert_eq!(t.packed(), vec![0x21, 0x0F]);
        assert_eq!(t.snapshot(), vec![1, 2, 15]);
    }

    #[test]
    fn decrement_touches_only_its_nibble() {
        let t = DepCounters::from_values(&[3, 5]).unwrap();
        assert_eq!(t.decrement(1).unwrap(), 4);
        assert_eq!(t.snapshot(), vec![3, 4]);
    }

    #[test]
    fn decrement_below_zero_is_rejected() {
        let t = DepCounters::from_values(&[1, 7]).unwrap();
        assert_eq!(t.decrement(0).unwrap(), 0);
        assert!(matches!(t.decrement(0), Err(SchedError::Protocol { .. })));
        assert_eq!(t.snapshot(), vec![0, 7]);
    }

    #[test]
    fn values_above_fifteen_do_not_fit() {
        assert!(matches!(
            DepCounters::from_values(&[16]),
            Err(SchedError::ResourceExhausted { capacity: 15, .. })
        ));
    }

    #[test]
    fn reset_restores_template() {
        let template = DepCounters::from_values(&[1, 2, 2]).unwrap();
        let live = template.clone();
        live.decrement(0).unwrap();
        live.decrement(2).unwrap();
        assert_eq!(live.residue(), 2);
        live.reset_from(&template);
        assert_eq!(live.snapshot(), vec![1, 2, 2]);
    }

    #[test]
    fn concurrent_decrements_on_shared_byte() {
        let t = std::sync::Arc::new(DepCounters::from_values(&[15, 15]).unwrap());
        let handles: Vec<_> = (0..2)
            .map(|i| {
                let t = std::sync::Arc::clone(&t);
                std::thread::spawn(move || {
                    for _ in 0..15 {
                        t.decrement(i).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(t.snapshot(), vec![0, 0]);
    }
}
