//! I/O read / I/O write: an opaque stream with a driver (socket, TLS
//! session, HTTP body, in-memory) and an attached filter group (spec §3, §4.1).

use pg_util::CoreError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buffer::Buffer;
use crate::filter::FilterGroup;

const DRIVER_CHUNK: usize = 64 * 1024;

/// Async byte source with an attached filter chain.
pub struct IoRead<R> {
    driver: R,
    group: FilterGroup,
    driver_eof: bool,
    closed: bool,
}

impl<R: AsyncRead + Unpin> IoRead<R> {
    pub fn new(driver: R, group: FilterGroup) -> Self {
        Self {
            driver,
            group,
            driver_eof: false,
            closed: false,
        }
    }

    /// Blocking-style read: fills `out` until it is full or the stream
    /// (post-filter) hits EOF. Returns the number of bytes newly added to
    /// `out` this call (0 means EOF was reached with nothing left to give).
    pub async fn read(&mut self, out: &mut Buffer) -> Result<usize, CoreError> {
        if self.closed {
            return Err(CoreError::Assert("read on closed IoRead".into()));
        }
        let start_used = out.used();

        while out.remains() > 0 && !self.group.done() {
            if self.driver_eof {
                self.group.process(None, out)?;
                if !self.group.done() {
                    // Filters are required to fully drain on one flush call
                    // (see FilterGroup::process); if not, stop rather than spin.
                    break;
                }
                break;
            }

            let want = out.remains().min(DRIVER_CHUNK);
            let mut raw = vec![0u8; want];
            let n = self
                .driver
                .read(&mut raw)
                .await
                .map_err(|e| CoreError::io("read", "<stream>", e))?;

            if n == 0 {
                self.driver_eof = true;
                continue;
            }
            self.group.process(Some(&raw[..n]), out)?;
        }

        Ok(out.used() - start_used)
    }

    /// Non-blocking-style read: returns as soon as any bytes arrive (or
    /// on EOF), rather than filling `out` completely.
    pub async fn read_some(&mut self, out: &mut Buffer) -> Result<usize, CoreError> {
        let start_used = out.used();
        if out.remains() == 0 || self.group.done() {
            return Ok(0);
        }

        if self.driver_eof {
            self.group.process(None, out)?;
            return Ok(out.used() - start_used);
        }

        let want = out.remains().min(DRIVER_CHUNK);
        let mut raw = vec![0u8; want];
        let n = self
            .driver
            .read(&mut raw)
            .await
            .map_err(|e| CoreError::io("read", "<stream>", e))?;

        if n == 0 {
            self.driver_eof = true;
            self.group.process(None, out)?;
        } else {
            self.group.process(Some(&raw[..n]), out)?;
        }
        Ok(out.used() - start_used)
    }

    /// Read a line (through the filter chain), scanning for `\n`. Fails
    /// if no line terminator is found before `out` fills up.
    pub async fn read_line(&mut self, out: &mut Buffer) -> Result<(), CoreError> {
        loop {
            if let Some(pos) = out.as_slice().iter().position(|&b| b == b'\n') {
                let _ = pos;
                return Ok(());
            }
            if out.remains() == 0 {
                return Err(CoreError::Format("line exceeds buffer capacity".into()));
            }
            let before = out.used();
            let n = self.read_some(out).await?;
            if n == 0 && out.used() == before {
                return Err(CoreError::Format("EOF before line terminator".into()));
            }
        }
    }

    pub fn is_eof(&self) -> bool {
        self.driver_eof && self.group.done()
    }

    pub fn group(&self) -> &FilterGroup {
        &self.group
    }
}

/// Async byte sink with an attached filter chain.
pub struct IoWrite<W> {
    driver: W,
    group: FilterGroup,
    staged: Buffer,
    closed: bool,
}

impl<W: AsyncWrite + Unpin> IoWrite<W> {
    pub fn new(driver: W, group: FilterGroup, stage_capacity: usize) -> Self {
        Self {
            driver,
            group,
            staged: Buffer::new(stage_capacity.max(4096)),
            closed: false,
        }
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<(), CoreError> {
        if self.closed {
            return Err(CoreError::Assert("write on closed IoWrite".into()));
        }
        self.group.process(Some(buf), &mut self.staged)?;
        self.flush_staged_if_full().await
    }

    async fn flush_staged_if_full(&mut self) -> Result<(), CoreError> {
        if self.staged.remains() == 0 {
            self.flush_staged().await?;
        }
        Ok(())
    }

    async fn flush_staged(&mut self) -> Result<(), CoreError> {
        if self.staged.used() > 0 {
            self.driver
                .write_all(self.staged.as_slice())
                .await
                .map_err(|e| CoreError::io("write", "<stream>", e))?;
            self.staged.clear();
        }
        Ok(())
    }

    /// Flush the filter group with `input = null` until it reports done,
    /// then flush the driver (spec §4.1).
    pub async fn close(&mut self) -> Result<(), CoreError> {
        if self.closed {
            return Ok(());
        }
        while !self.group.done() {
            self.group.process(None, &mut self.staged)?;
            self.flush_staged().await?;
        }
        self.flush_staged().await?;
        self.driver
            .flush()
            .await
            .map_err(|e| CoreError::io("flush", "<stream>", e))?;
        self.closed = true;
        Ok(())
    }

    pub fn group(&self) -> &FilterGroup {
        &self.group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::hash::{HashAlgorithm, HashFilter};

    #[tokio::test]
    async fn write_then_read_round_trips_through_in_memory_driver() {
        let mut sink: Vec<u8> = Vec::new();
        {
            let mut w = IoWrite::new(&mut sink, FilterGroup::new(), 64);
            w.write(b"hello ").await.unwrap();
            w.write(b"world").await.unwrap();
            w.close().await.unwrap();
        }
        assert_eq!(sink, b"hello world");

        let mut r = IoRead::new(sink.as_slice(), FilterGroup::new());
        let mut out = Buffer::new(64);
        r.read(&mut out).await.unwrap();
        assert_eq!(out.as_slice(), b"hello world");
    }

    #[tokio::test]
    async fn write_computes_hash_via_attached_filter() {
        let mut sink: Vec<u8> = Vec::new();
        let mut group = FilterGroup::new();
        group.add(Box::new(HashFilter::new(HashAlgorithm::Sha1)));
        group.open();

        let mut w = IoWrite::new(&mut sink, group, 64);
        w.write(b"hello world").await.unwrap();
        w.close().await.unwrap();

        assert_eq!(sink, b"hello world");
        let results = w.group().results();
        assert_eq!(results.len(), 1);
    }
}
