use std::io::Write;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::Event;

/// Observer notified of every dispatched event, in dispatch order.
pub trait EventListener: Send {
    /// Called after the event has been dispatched and its reactions
    /// scheduled.
    fn on_event(&mut self, event: &Event);
}

/// Listener forwarding dispatched events into a channel.
///
/// This is the bridge to external sinks: the receiving end typically sits on
/// a writer thread (see [`write_from_channel`]) or in the boundary adapter.
pub struct ChannelListener {
    sender: Sender<Event>,
}

impl ChannelListener {
    /// Constructs a listener sending into `sender`.
    #[must_use]
    pub fn new(sender: Sender<Event>) -> Self {
        Self { sender }
    }
}

impl EventListener for ChannelListener {
    fn on_event(&mut self, event: &Event) {
        // A closed receiver just means nobody is watching anymore.
        let _ = self.sender.send(event.clone());
    }
}

/// Accumulates one human-readable line per dispatched event.
///
/// Each line is tagged with the event's virtual time, kind and target
/// component, plus the failure reason when the payload carries one. The
/// buffer can be drained all at once, which makes it easy to correlate a
/// stretch of simulated time with the traffic that happened in it:
///
/// ```
/// # use toposim::{Event, EventKind, EventListener, TraceLog};
/// let trace = TraceLog::new();
/// let mut listener = trace.listener();
/// listener.on_event(&Event::new("r1", 1.5, EventKind::RequestArrival, "svc"));
/// assert_eq!(trace.drain(), vec![String::from("[1.500] request_arrival -> svc")]);
/// assert!(trace.drain().is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct TraceLog {
    lines: Arc<Mutex<Vec<String>>>,
}

impl TraceLog {
    /// Constructs an empty trace buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a listener that feeds this buffer; the buffer can be shared
    /// by several listeners registered on different engines.
    #[must_use]
    pub fn listener(&self) -> Box<dyn EventListener> {
        Box::new(TraceWriter {
            lines: Arc::clone(&self.lines),
        })
    }

    /// Clears the buffer and returns its contents, in dispatch order.
    #[must_use]
    pub fn drain(&self) -> Vec<String> {
        let mut lines = self.lines.lock().expect("trace buffer lock poisoned");
        lines.drain(..).collect()
    }
}

struct TraceWriter {
    lines: Arc<Mutex<Vec<String>>>,
}

impl EventListener for TraceWriter {
    fn on_event(&mut self, event: &Event) {
        let mut line = format!(
            "[{:.3}] {} -> {}",
            event.timestamp, event.kind, event.component_id
        );
        if let Some(reason) = event.data_str("reason") {
            line.push_str(" (");
            line.push_str(reason);
            line.push(')');
        }
        self.lines
            .lock()
            .expect("trace buffer lock poisoned")
            .push(line);
    }
}

/// Spawns a thread that writes events received from `receiver` to `writer`
/// as JSON lines, until the sending side disconnects.
pub fn write_from_channel<W: Write + Send + 'static>(
    mut writer: W,
    receiver: Receiver<Event>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while let Ok(event) = receiver.recv() {
            match event.to_json() {
                Ok(json) => {
                    if writeln!(writer, "{json}").is_err() {
                        log::warn!("Failed to write event {}; closing sink", event.id);
                        return;
                    }
                }
                Err(err) => log::warn!("Failed to serialize event {}: {err}", event.id),
            }
        }
        let _ = writer.flush();
    })
}
