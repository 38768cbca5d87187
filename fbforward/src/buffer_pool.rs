//! Fixed-size buffer pool shared by the TCP and UDP forwarders, so copy
//! loops don't allocate per read.

use parking_lot::Mutex;

pub struct BufferPool {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn take(&self) -> Vec<u8> {
        self.free.lock().pop().unwrap_or_else(|| vec![0u8; self.size])
    }

    pub fn give(&self, mut buf: Vec<u8>) {
        if buf.len() != self.size {
            buf.resize(self.size, 0);
        }
        let mut free = self.free.lock();
        if free.len() < 64 {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reused_buffer_has_requested_size() {
        let pool = BufferPool::new(32 * 1024);
        let buf = pool.take();
        assert_eq!(buf.len(), 32 * 1024);
        pool.give(buf);
        let buf2 = pool.take();
        assert_eq!(buf2.len(), 32 * 1024);
    }
}
