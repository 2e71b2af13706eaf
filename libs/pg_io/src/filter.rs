//! Filter / filter group (spec §3, §4.1).
//!
//! A [`Filter`] consumes input in a loop and writes transformed bytes to
//! an output [`Buffer`]. `feed(None, ..)` signals end-of-input (flush):
//! the filter must emit whatever it has buffered and flip [`Filter::done`].
//! A filter that cannot consume all of the input it was handed (because
//! `output` ran out of room) simply reports a smaller `consumed` count;
//! the caller is expected to re-present the unconsumed remainder before
//! handing over anything new — this is the spec's "same input again"
//! rule, expressed here as ordinary slice bookkeeping rather than a flag.

use pg_util::CoreError;

use crate::buffer::Buffer;

#[derive(Debug, Clone)]
pub enum FilterResult {
    /// SHA-1/SHA-256 style digest produced by a hash filter.
    Digest(Vec<u8>),
}

pub trait Filter: Send {
    fn feed(&mut self, input: Option<&[u8]>, output: &mut Buffer) -> Result<usize, CoreError>;

    /// True once this filter has flushed and has no more output to give.
    fn done(&self) -> bool;

    /// Side-channel result (e.g. a computed checksum), available once `done()`.
    fn result(&self) -> Option<FilterResult> {
        None
    }

    fn name(&self) -> &'static str;
}

/// Ordered pipeline of filters, frozen after [`FilterGroup::open`].
pub struct FilterGroup {
    filters: Vec<Box<dyn Filter>>,
    opened: bool,
}

impl Default for FilterGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterGroup {
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            opened: false,
        }
    }

    /// Append a filter. Panics if called after [`open`](Self::open) — the
    /// spec requires filters to be frozen once the group opens.
    pub fn add(&mut self, filter: Box<dyn Filter>) -> &mut Self {
        assert!(!self.opened, "cannot add filters to an opened FilterGroup");
        self.filters.push(filter);
        self
    }

    pub fn open(&mut self) -> &mut Self {
        self.opened = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// The group is done only when every filter is done (spec §4.1, step 4).
    pub fn done(&self) -> bool {
        self.filters.iter().all(|f| f.done())
    }

    pub fn results(&self) -> Vec<(&'static str, Option<FilterResult>)> {
        self.filters.iter().map(|f| (f.name(), f.result())).collect()
    }

    /// Cascade `input` (or a flush signal, if `None`) through every filter
    /// in order, appending the final stage's output to `output`. Each
    /// intermediate stage is materialized in full before being handed to
    /// the next filter — the inter-filter "scratch buffer" of spec §4.1.
    pub fn process(&mut self, input: Option<&[u8]>, output: &mut Buffer) -> Result<(), CoreError> {
        let mut stage: Option<Vec<u8>> = input.map(|s| s.to_vec());

        for filter in self.filters.iter_mut() {
            if filter.done() {
                // Already flushed: nothing more to give downstream from here.
                stage = None;
                continue;
            }

            let mut produced: Vec<u8> = Vec::new();
            let mut scratch = Buffer::new(scratch_capacity(stage.as_deref()));

            match stage.as_deref() {
                Some(mut remaining) => {
                    while !remaining.is_empty() {
                        if scratch.remains() == 0 {
                            scratch.resize(scratch.size() * 2 + 64)?;
                        }
                        let consumed = filter.feed(Some(remaining), &mut scratch)?;
                        produced.extend_from_slice(scratch.as_slice());
                        scratch.clear();
                        remaining = &remaining[consumed..];
                        if consumed == 0 {
                            // Filter made no progress on non-empty input and
                            // reported no room needed: avoid spinning forever.
                            break;
                        }
                    }
                }
                None => {
                    // Flush: one call is enough for every filter in this
                    // crate's implementations (they fully drain on flush).
                    filter.feed(None, &mut scratch)?;
                    produced.extend_from_slice(scratch.as_slice());
                }
            }

            stage = Some(produced);
        }

        if let Some(bytes) = stage {
            if output.remains() < bytes.len() {
                output.resize(output.used() + bytes.len())?;
            }
            output.cat(&bytes)?;
        }
        Ok(())
    }
}

fn scratch_capacity(input: Option<&[u8]>) -> usize {
    input.map(|b| b.len() + 64).unwrap_or(64).max(64)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pass-through filter used only to exercise group cascading in tests.
    struct Identity {
        done: bool,
    }

    impl Filter for Identity {
        fn feed(&mut self, input: Option<&[u8]>, output: &mut Buffer) -> Result<usize, CoreError> {
            match input {
                Some(bytes) => {
                    output.cat(bytes)?;
                    Ok(bytes.len())
                }
                None => {
                    self.done = true;
                    Ok(0)
                }
            }
        }
        fn done(&self) -> bool {
            self.done
        }
        fn name(&self) -> &'static str {
            "identity"
        }
    }

    #[test]
    fn chained_identity_filters_round_trip_chunked_input() {
        // ∀ filter group over [F_1..F_n], input I: concatenated outputs
        // equal F_n∘...∘F_1(I) regardless of how I is chunked.
        let mut group = FilterGroup::new();
        group.add(Box::new(Identity { done: false }));
        group.add(Box::new(Identity { done: false }));
        group.open();

        let mut out = Buffer::new(256);
        for chunk in [b"hello ".as_slice(), b"world".as_slice()] {
            group.process(Some(chunk), &mut out).unwrap();
        }
        while !group.done() {
            group.process(None, &mut out).unwrap();
        }
        assert_eq!(out.as_slice(), b"hello world");
    }
}
