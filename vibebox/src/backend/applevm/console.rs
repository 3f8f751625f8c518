//! Serial console pump and match waiter.
//!
//! A dedicated reader thread drains the guest-output pipe into a growing
//! buffer behind a mutex; waiters poll a snapshot at 100 ms granularity.
//! No line discipline is assumed; matching is substring-based over the
//! aggregated stream.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::errors::{VibeboxResult, VmError};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Accumulated guest console output plus the thread feeding it.
pub(crate) struct Console {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: Option<std::thread::JoinHandle<()>>,
}

impl Console {
    /// Spawn the reader loop over the guest-output stream. Every chunk is
    /// forwarded to the tee writer (when configured) before buffering. The
    /// loop exits cleanly on EOF or a closed handle.
    pub(crate) fn spawn(
        mut source: impl Read + Send + 'static,
        mut tee: Option<Box<dyn Write + Send>>,
    ) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let shared = Arc::clone(&buffer);
        let reader = std::thread::spawn(move || {
            let mut chunk = [0u8; 4096];
            loop {
                match source.read(&mut chunk) {
                    Ok(0) => return,
                    Ok(n) => {
                        if let Some(writer) = tee.as_mut() {
                            let _ = writer.write_all(&chunk[..n]);
                            let _ = writer.flush();
                        }
                        shared
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .extend_from_slice(&chunk[..n]);
                    }
                    Err(e) => {
                        if e.kind() != std::io::ErrorKind::UnexpectedEof {
                            tracing::debug!(error = %e, "console reader exited");
                        }
                        return;
                    }
                }
            }
        });
        Self {
            buffer,
            reader: Some(reader),
        }
    }

    /// Snapshot of everything read so far.
    pub(crate) fn output(&self) -> Vec<u8> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Lossy text view of the buffer for substring matching.
    pub(crate) fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output()).into_owned()
    }

    /// Wait until any needle appears in the buffer, returning the first
    /// (in list order) that matched. Zero timeout waits forever.
    pub(crate) fn wait_for_any(
        &self,
        needles: &[&str],
        timeout: Duration,
    ) -> VibeboxResult<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let text = self.output_text();
            for needle in needles {
                if text.contains(needle) {
                    return Ok(needle.to_string());
                }
            }
            if !timeout.is_zero() && Instant::now() >= deadline {
                return Err(VmError::ConsoleTimeout(format!("{:?}", needles)).into());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Wait for one substring.
    pub(crate) fn wait_for_contains(&self, needle: &str, timeout: Duration) -> VibeboxResult<()> {
        self.wait_for_any(&[needle], timeout).map(|_| ())
    }

    /// Join the reader thread after the source has reached EOF.
    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        // The reader exits on its own once the pipe closes; joining here
        // would deadlock while the VM still holds the write end open.
        drop(self.reader.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::mpsc;

    /// Reader that yields scripted chunks with pauses, then EOF.
    struct ScriptedReader {
        chunks: std::vec::IntoIter<Vec<u8>>,
        pause: Duration,
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.chunks.next() {
                Some(chunk) => {
                    std::thread::sleep(self.pause);
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }
    }

    #[test]
    fn test_buffers_and_waits() {
        let reader = ScriptedReader {
            chunks: vec![b"debian login: ".to_vec()].into_iter(),
            pause: Duration::from_millis(20),
        };
        let console = Console::spawn(reader, None);
        let matched = console
            .wait_for_any(&["login: ", "~# "], Duration::from_secs(2))
            .unwrap();
        assert_eq!(matched, "login: ");
        assert_eq!(console.output_text(), "debian login: ");
    }

    #[test]
    fn test_match_order_is_list_order() {
        let console = Console::spawn(Cursor::new(b"b-then-a".to_vec()), None);
        // Both needles are present; the first in list order wins.
        let matched = console
            .wait_for_any(&["a", "b"], Duration::from_secs(1))
            .unwrap();
        assert_eq!(matched, "a");
    }

    #[test]
    fn test_wait_timeout() {
        let console = Console::spawn(Cursor::new(b"nothing useful".to_vec()), None);
        let err = console
            .wait_for_contains("never-appears", Duration::from_millis(150))
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_tee_receives_chunks_before_buffering() {
        struct ChannelWriter(mpsc::Sender<Vec<u8>>);
        impl Write for ChannelWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.send(buf.to_vec()).ok();
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let (tx, rx) = mpsc::channel();
        let mut console = Console::spawn(
            Cursor::new(b"guest says hi".to_vec()),
            Some(Box::new(ChannelWriter(tx))),
        );
        console.join();
        let teed: Vec<u8> = rx.try_iter().flatten().collect();
        assert_eq!(teed, b"guest says hi");
        assert_eq!(console.output(), b"guest says hi");
    }

    #[test]
    fn test_reader_exits_on_eof() {
        let mut console = Console::spawn(Cursor::new(Vec::new()), None);
        console.join(); // would hang if the loop did not exit on EOF
        assert!(console.output().is_empty());
    }
}
