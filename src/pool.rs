/// Owned receive buffer. It lives in the pool, in exactly one connection
/// queue, or with the consumer while it is unpacked; it is moved, never shared.
pub(crate) struct RxBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl RxBuffer {
    /// Copy a datagram in; callers guarantee it fits.
    pub(crate) fn fill(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(self.data.len());
        self.data[..len].copy_from_slice(&bytes[..len]);
        self.len = len;
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PoolError {
    Exhausted,
}

/// Lazily grown pool of fixed-size buffers with a hard ceiling.
pub(crate) struct RxBufferPool {
    free: Vec<Box<[u8]>>,
    outstanding: usize,
    max: usize,
    buffer_size: usize,
}

impl RxBufferPool {
    pub(crate) fn new(buffer_size: usize, max: usize) -> Self {
        Self {
            free: Vec::new(),
            outstanding: 0,
            max,
            buffer_size,
        }
    }

    pub(crate) fn acquire(&mut self) -> Result<RxBuffer, PoolError> {
        let data = match self.free.pop() {
            Some(data) => data,
            None if self.outstanding < self.max => vec![0u8; self.buffer_size].into_boxed_slice(),
            None => return Err(PoolError::Exhausted),
        };
        self.outstanding += 1;
        Ok(RxBuffer { data, len: 0 })
    }

    pub(crate) fn release(&mut self, buffer: RxBuffer) {
        debug_assert!(self.outstanding > 0, "release without acquire");
        self.outstanding = self.outstanding.saturating_sub(1);
        self.free.push(buffer.data);
    }

    /// Buffers currently queued on connections or held by consumers.
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub(crate) fn allocated(&self) -> usize {
        self.outstanding + self.free.len()
    }

    /// Return idle memory once a query is gone, keeping `keep` buffers warm.
    pub(crate) fn prune(&mut self, keep: usize) {
        self.free.truncate(keep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling() {
        let mut pool = RxBufferPool::new(16, 2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.acquire().err(), Some(PoolError::Exhausted));
        assert_eq!(pool.outstanding(), 2);
        pool.release(a);
        let c = pool.acquire().unwrap();
        assert_eq!(pool.allocated(), 2);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.outstanding(), 0);
        pool.prune(1);
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn test_fill() {
        let mut pool = RxBufferPool::new(4, 1);
        let mut buffer = pool.acquire().unwrap();
        buffer.fill(b"abc");
        assert_eq!(buffer.as_slice(), b"abc");
        buffer.fill(b"toolong");
        assert_eq!(buffer.as_slice(), b"tool");
        pool.release(buffer);
    }
}
