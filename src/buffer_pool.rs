use bytes::BytesMut;
use std::sync::Mutex;
use tracing::{debug, trace};

/// Free-list pool of fixed-capacity packet buffers, shared by the receive
///  path and the send-side serialization scratch. Buffers in excess of the
///  configured pool size are discarded when returned.
pub struct BufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        BufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn get_from_pool(&self) -> BytesMut {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(self.buf_size)
    }

    pub fn return_to_pool(&self, mut buffer: BytesMut) {
        if buffer.capacity() != self.buf_size {
            // Reassembly output and other odd-sized buffers are not pooled.
            trace!("discarding buffer with foreign capacity {}", buffer.capacity());
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        } else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_returned_buffer_is_cleared() {
        let pool = BufferPool::new(10, 10);

        let mut buf = pool.get_from_pool();
        buf.put_u8(1);
        pool.return_to_pool(buf);

        assert!(pool.get_from_pool().is_empty());
    }

    #[test]
    fn test_pool_cap_is_respected() {
        let pool = BufferPool::new(10, 1);

        pool.return_to_pool(BytesMut::with_capacity(10));
        pool.return_to_pool(BytesMut::with_capacity(10));

        assert_eq!(pool.buffers.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_foreign_capacity_not_pooled() {
        let pool = BufferPool::new(10, 4);

        pool.return_to_pool(BytesMut::with_capacity(64));

        assert_eq!(pool.buffers.lock().unwrap().len(), 0);
    }
}
