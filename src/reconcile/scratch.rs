//! Reusable image buffers with scoped release.

use bytes::BytesMut;
use parking_lot::Mutex;

/// Pool of reusable byte buffers. A `Scratch` checked out of the pool
/// returns its buffer on drop, so every exit path releases it.
pub struct ScratchPool {
    free: Mutex<Vec<BytesMut>>,
}

impl ScratchPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Check out a cleared buffer with at least `size` bytes of capacity.
    pub fn get(&self, size: usize) -> Scratch<'_> {
        let mut buf = self.free.lock().pop().unwrap_or_default();
        buf.clear();
        if buf.capacity() < size {
            buf.reserve(size - buf.capacity());
        }
        Scratch {
            pool: self,
            buf: Some(buf),
        }
    }

    fn put_back(&self, buf: BytesMut) {
        self.free.lock().push(buf);
    }
}

impl Default for ScratchPool {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Scratch<'a> {
    pool: &'a ScratchPool,
    buf: Option<BytesMut>,
}

impl Scratch<'_> {
    pub fn buf(&self) -> &BytesMut {
        self.buf.as_ref().unwrap()
    }

    pub fn buf_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().unwrap()
    }
}

impl std::ops::Deref for Scratch<'_> {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf()
    }
}

impl std::ops::DerefMut for Scratch<'_> {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf_mut()
    }
}

impl Drop for Scratch<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put_back(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_recycled() {
        let pool = ScratchPool::new();
        {
            let mut s = pool.get(64);
            s.extend_from_slice(b"scratch data");
            assert!(s.capacity() >= 64);
        }
        let s = pool.get(16);
        assert!(s.is_empty());
        assert!(s.capacity() >= 64);
    }

    #[test]
    fn released_on_early_exit() {
        let pool = ScratchPool::new();
        fn fails(pool: &ScratchPool) -> Result<(), ()> {
            let _s = pool.get(32);
            Err(())
        }
        assert!(fails(&pool).is_err());
        assert_eq!(pool.free.lock().len(), 1);
    }
}
