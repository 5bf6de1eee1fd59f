//! Bounded in-process byte pipe
//!
//! Connects a blocking producer (e.g. a tar builder walking a directory) to a
//! blocking consumer without buffering the whole stream.

use std::io::{self, Read, Write};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

type Message = io::Result<Vec<u8>>;

/// Create a pipe holding at most `depth` pending writes
pub fn pipe(depth: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = sync_channel(depth);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            current: Vec::new(),
            pos: 0,
        },
    )
}

/// Writing half. Dropping every clone signals end of stream.
#[derive(Clone)]
pub struct PipeWriter {
    tx: SyncSender<Message>,
}

impl PipeWriter {
    /// Terminate the stream with an error the reader will observe
    pub fn fail(self, err: io::Error) {
        let _ = self.tx.send(Err(err));
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(Ok(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reading half
pub struct PipeReader {
    rx: Receiver<Message>,
    current: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.pos >= self.current.len() {
            match self.rx.recv() {
                Ok(Ok(data)) => {
                    self.current = data;
                    self.pos = 0;
                }
                Ok(Err(e)) => return Err(e),
                // Writer dropped: clean end of stream
                Err(_) => return Ok(0),
            }
        }

        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
