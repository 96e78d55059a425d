// Event log sink
//
// Accepts records from any thread without blocking and writes them from a
// background thread. Records that arrive while no output is attached are
// mirrored to the trace log only.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::{trace, warn};
use parking_lot::Mutex;

use crate::sim_error::SimError;
use crate::sim_interface::SimEvent;

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

enum LogCommand {
    Record(SimEvent),
    Attach(Box<dyn Write + Send>),
    Flush(Sender<()>),
    Stop,
}

pub struct EventLog {
    sender: Sender<LogCommand>,
    writer: Mutex<Option<JoinHandle<()>>>,
    buffered: Arc<AtomicUsize>,
}

impl EventLog {
    pub fn new() -> Result<Self, SimError> {
        let (sender, receiver) = channel::unbounded();
        let buffered = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&buffered);
        let handle = std::thread::Builder::new()
            .name("event-log".to_string())
            .spawn(move || writer_loop(receiver, counter))?;

        Ok(Self {
            sender,
            writer: Mutex::new(Some(handle)),
            buffered,
        })
    }

    pub fn add_event(&self, event: SimEvent) {
        self.buffered.fetch_add(1, Ordering::Relaxed);
        if self.sender.send(LogCommand::Record(event)).is_err() {
            // writer already stopped
            self.buffered.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn add_events(&self, events: impl IntoIterator<Item = SimEvent>) {
        for event in events {
            self.add_event(event);
        }
    }

    /// Records queued but not yet written.
    pub fn buffered_events(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Replaces the output destination. Records already queued go to the new one.
    pub fn set_output(&self, output: Box<dyn Write + Send>) {
        let _ = self.sender.send(LogCommand::Attach(output));
    }

    pub fn set_output_file(&self, path: impl AsRef<Path>) -> Result<(), SimError> {
        let file = File::create(path)?;
        self.set_output(Box::new(BufWriter::new(file)));
        Ok(())
    }

    /// Blocks until every record queued before this call is written and flushed.
    pub fn flush(&self) {
        let (ack, done) = channel::bounded(1);
        if self.sender.send(LogCommand::Flush(ack)).is_ok() {
            let _ = done.recv();
        }
    }

    /// Drains the queue, flushes and joins the writer thread.
    pub fn stop(&self) {
        let handle = self.writer.lock().take();
        if let Some(handle) = handle {
            let _ = self.sender.send(LogCommand::Stop);
            if handle.join().is_err() {
                warn!("event log writer panicked");
            }
        }
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn writer_loop(receiver: Receiver<LogCommand>, buffered: Arc<AtomicUsize>) {
    let mut output: Option<Box<dyn Write + Send>> = None;
    let mut last_flush = Instant::now();

    loop {
        match receiver.recv_timeout(FLUSH_INTERVAL) {
            Ok(LogCommand::Record(event)) => {
                let line = event.to_string();
                if let Some(out) = output.as_mut() {
                    if let Err(e) = writeln!(out, "{}", line) {
                        warn!("event log output failed, detaching: {}", e);
                        output = None;
                    }
                }
                trace!("{}", line);
                buffered.fetch_sub(1, Ordering::Relaxed);
            }
            Ok(LogCommand::Attach(new_output)) => {
                flush_output(&mut output);
                output = Some(new_output);
            }
            Ok(LogCommand::Flush(ack)) => {
                flush_output(&mut output);
                last_flush = Instant::now();
                let _ = ack.send(());
            }
            Ok(LogCommand::Stop) | Err(RecvTimeoutError::Disconnected) => {
                flush_output(&mut output);
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        if last_flush.elapsed() >= FLUSH_INTERVAL {
            flush_output(&mut output);
            last_flush = Instant::now();
        }
    }
}

fn flush_output(output: &mut Option<Box<dyn Write + Send>>) {
    if let Some(out) = output.as_mut() {
        if let Err(e) = out.flush() {
            warn!("event log flush failed: {}", e);
        }
    }
}

/// `Write` target backed by a shared buffer, for reading a log back in-process.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_interface::EventType;

    #[test]
    fn test_records_written_in_order() {
        let log = EventLog::new().unwrap();
        let buffer = SharedBuffer::new();
        log.set_output(Box::new(buffer.clone()));

        log.add_event(SimEvent::new(1, EventType::NodeAdded, "node 1", "Node came online."));
        log.add_event(SimEvent::new(2, EventType::NodeRemoved, "node 1", "Node went offline."));
        log.flush();

        assert_eq!(
            buffer.contents(),
            "1| NodeAdded - (node 1): Node came online.\n\
             2| NodeRemoved - (node 1): Node went offline.\n"
        );
        assert_eq!(log.buffered_events(), 0);
    }

    #[test]
    fn test_records_before_output_are_not_persisted() {
        let log = EventLog::new().unwrap();
        log.add_event(SimEvent::new(0, EventType::NodeAdded, "node 1", "early"));
        log.flush();

        let buffer = SharedBuffer::new();
        log.set_output(Box::new(buffer.clone()));
        log.add_event(SimEvent::new(1, EventType::NodeAdded, "node 2", "late"));
        log.flush();

        assert_eq!(buffer.contents(), "1| NodeAdded - (node 2): late\n");
    }

    #[test]
    fn test_stop_is_idempotent() {
        let log = EventLog::new().unwrap();
        log.stop();
        log.stop();
        // sends after stop are silently dropped
        log.add_event(SimEvent::new(0, EventType::NodeAdded, "node 1", "ignored"));
        log.flush();
    }
}
