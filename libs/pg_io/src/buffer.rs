//! Growable byte buffer with used/limit/remains semantics (spec §3, §4.1).
//!
//! Three cursors over one contiguous region: `size` (capacity), `used`
//! (valid byte count) and an optional `limit` (<= size) that caps writes.
//! `limit` constrains the writable window only; it never affects `used`.

use pg_util::CoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    used: usize,
    limit: Option<usize>,
}

impl Buffer {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size],
            used: 0,
            limit: None,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let used = bytes.len();
        Self {
            data: bytes,
            used,
            limit: None,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    fn effective_capacity(&self) -> usize {
        match self.limit {
            Some(limit) => limit.min(self.data.len()),
            None => self.data.len(),
        }
    }

    /// Bytes still writable before hitting `limit` (or `size` if unset).
    pub fn remains(&self) -> usize {
        self.effective_capacity().saturating_sub(self.used)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.used]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.used]
    }

    /// Pointer (as a mutable slice) to the remaining writable region.
    pub fn remains_mut(&mut self) -> &mut [u8] {
        let cap = self.effective_capacity();
        &mut self.data[self.used..cap]
    }

    /// Append `src` fully. Errors if it would exceed the effective capacity.
    pub fn cat(&mut self, src: &[u8]) -> Result<(), CoreError> {
        self.cat_sub(src, 0, src.len())
    }

    /// Append `n` bytes from `src` starting at `offset`.
    pub fn cat_sub(&mut self, src: &[u8], offset: usize, n: usize) -> Result<(), CoreError> {
        if self.remains() < n {
            return Err(CoreError::Assert(format!(
                "buffer overflow: remains={} requested={}",
                self.remains(),
                n
            )));
        }
        let dst_start = self.used;
        self.data[dst_start..dst_start + n].copy_from_slice(&src[offset..offset + n]);
        self.used += n;
        Ok(())
    }

    /// Resize the backing storage to `n`, preserving `used` bytes.
    /// Shrinking below `used` fails.
    pub fn resize(&mut self, n: usize) -> Result<(), CoreError> {
        if n < self.used {
            return Err(CoreError::Assert(format!(
                "cannot resize buffer below used bytes ({} < {})",
                n, self.used
            )));
        }
        self.data.resize(n, 0);
        Ok(())
    }

    pub fn limit_set(&mut self, n: usize) {
        self.limit = Some(n);
    }

    pub fn limit_clear(&mut self) {
        self.limit = None;
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Force the used-count directly (e.g. after writing through
    /// `remains_mut()` via an external I/O call).
    pub fn used_set(&mut self, n: usize) -> Result<(), CoreError> {
        if n > self.effective_capacity() {
            return Err(CoreError::Assert(format!(
                "used_set({n}) exceeds effective capacity {}",
                self.effective_capacity()
            )));
        }
        self.used = n;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.used = 0;
    }

    pub fn hex(&self) -> String {
        self.as_slice().iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cat_accumulates_used_bytes() {
        let mut buf = Buffer::new(16);
        buf.cat(b"abc").unwrap();
        buf.cat(b"de").unwrap();
        assert_eq!(buf.used(), 5);
        assert_eq!(buf.as_slice(), b"abcde");
        assert_eq!(buf.remains(), 11);
    }

    #[test]
    fn cat_over_capacity_fails() {
        let mut buf = Buffer::new(4);
        assert!(buf.cat(b"abcde").is_err());
    }

    #[test]
    fn limit_constrains_remains_but_not_used() {
        let mut buf = Buffer::new(16);
        buf.cat(b"abcd").unwrap();
        buf.limit_set(6);
        assert_eq!(buf.remains(), 2);
        assert_eq!(buf.used(), 4);
        buf.limit_clear();
        assert_eq!(buf.remains(), 12);
    }

    #[test]
    fn resize_preserves_used_bytes() {
        let mut buf = Buffer::new(4);
        buf.cat(b"abcd").unwrap();
        buf.resize(8).unwrap();
        assert_eq!(buf.used(), 4);
        assert_eq!(buf.as_slice(), b"abcd");
        assert_eq!(buf.size(), 8);
    }

    #[test]
    fn resize_below_used_fails() {
        let mut buf = Buffer::new(8);
        buf.cat(b"abcd").unwrap();
        assert!(buf.resize(2).is_err());
    }

    #[test]
    fn cat_sequence_invariant() {
        // ∀ buffer b, sequence of cat(x_i): b.used = Σ|x_i| (bounded by size)
        let mut buf = Buffer::new(64);
        let chunks: &[&[u8]] = &[b"a", b"bb", b"ccc", b"dddd"];
        let mut total = 0;
        for c in chunks {
            buf.cat(c).unwrap();
            total += c.len();
        }
        assert_eq!(buf.used(), total);
    }
}
