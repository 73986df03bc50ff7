//! # File handle in, iterator out.
//!
//! A [`Filerator`] is a [`std::io::Write`] sink whose every `write` call comes out of the
//! paired [`FileChunks`] iterator as one chunk. The writer never blocks, so it can sit on
//! the loop side or on any thread; the iterator blocks and belongs on a pool thread.
//!
//! ```text
//! writeln!(filerator, ..) ─► [unbounded channel] ─► FileChunks::next() on BlockingPool
//! filerator.close()       ─► channel closed       ─► iterator ends once drained
//! ```

use std::io;
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::error::PoolError;

/// Writable end of a byte stream that is read back as an iterator.
pub struct Filerator {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

/// Blocking iterator over the chunks written to a [`Filerator`].
pub struct FileChunks {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Iterator for FileChunks {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.blocking_recv()
    }
}

impl Default for Filerator {
    fn default() -> Self {
        Self::new()
    }
}

impl Filerator {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Hands the chunk iterator out once.
    pub fn chunks(&self) -> Result<FileChunks, PoolError> {
        self.rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|rx| FileChunks { rx })
            .ok_or(PoolError::AlreadyConsuming)
    }

    /// Ends the iteration after whatever was written so far. Later writes fail.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "filerator closed"))?;
        tx.send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "filerator reader dropped"))?;
        Ok(buf.len())
    }
}

impl io::Write for Filerator {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Shared writers, e.g. several threads holding an `Arc<Filerator>`.
impl io::Write for &Filerator {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threads::BlockingPool;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lines_written_on_a_thread_come_back_in_order() {
        let pool = BlockingPool::new(2);
        pool.start();
        let file = Arc::new(Filerator::new());
        let chunks = file.chunks().unwrap();
        let reader = tokio::spawn({
            let pool = pool.clone();
            async move {
                pool.run(move || {
                    chunks
                        .map(|c| String::from_utf8(c).unwrap_or_default())
                        .collect::<String>()
                })
                .await
            }
        });

        let writer = {
            let file = Arc::clone(&file);
            std::thread::spawn(move || {
                for i in 0..10 {
                    writeln!(&*file, "line {i}").unwrap();
                    std::thread::sleep(Duration::from_millis(2));
                }
                file.close();
            })
        };

        let text = reader.await.unwrap().unwrap();
        writer.join().unwrap();
        let expected: String = (0..10).map(|i| format!("line {i}\n")).collect();
        assert_eq!(text, expected);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[test]
    fn each_write_is_one_chunk() {
        let mut file = Filerator::new();
        let chunks = file.chunks().unwrap();
        file.write_all(b"abc").unwrap();
        file.write_all(b"").unwrap();
        file.write_all(b"de").unwrap();
        file.close();
        // Already closed, so the iterator ends without blocking.
        assert_eq!(chunks.collect::<Vec<_>>(), vec![b"abc".to_vec(), b"de".to_vec()]);
    }

    #[test]
    fn writes_after_close_fail() {
        let mut file = Filerator::new();
        file.close();
        assert!(file.is_closed());
        let err = file.write(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(matches!(file.chunks().map(|_| ()), Ok(())));
        assert!(matches!(file.chunks(), Err(PoolError::AlreadyConsuming)));
    }
}
