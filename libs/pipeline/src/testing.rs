//! In-memory sink and drop collector shared by the unit tests.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use fanout_api::{BatchedWriter, DropFn, Message};

#[derive(Clone, Default)]
pub(crate) struct MemorySink {
    pub data: Arc<Mutex<Vec<u8>>>,
    pub closed: Arc<AtomicBool>,
    /// Makes `is_accessible` report false, like a removed file.
    pub gone: Arc<AtomicBool>,
    /// 1-based index of the write call that fails with `BrokenPipe`.
    pub fail_on: Option<usize>,
    /// Bytes handed out by `read_response`, repeated for every call.
    pub response: Vec<u8>,
    writes: usize,
}

impl MemorySink {
    pub fn failing_on(n: usize) -> Self {
        Self { fail_on: Some(n), ..Default::default() }
    }

    pub fn responding(response: &[u8]) -> Self {
        Self { response: response.to_vec(), ..Default::default() }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl io::Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writes += 1;
        if self.fail_on == Some(self.writes) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"));
        }
        self.data.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BatchedWriter for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn size(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    fn is_accessible(&self) -> bool {
        !self.is_closed() && !self.gone.load(Ordering::SeqCst)
    }

    fn read_response(&mut self, buf: &mut [u8]) -> io::Result<()> {
        if self.response.len() < buf.len() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no response"));
        }
        buf.copy_from_slice(&self.response[..buf.len()]);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A drop hook that records every rerouted message.
pub(crate) fn drop_collector() -> (DropFn, Arc<Mutex<Vec<Message>>>) {
    let dropped = Arc::new(Mutex::new(Vec::new()));
    let sink = dropped.clone();
    let dropper: DropFn = Arc::new(move |msg| sink.lock().unwrap().push(msg));
    (dropper, dropped)
}

pub(crate) fn sequences(messages: &Mutex<Vec<Message>>) -> Vec<u64> {
    messages.lock().unwrap().iter().map(Message::sequence).collect()
}
