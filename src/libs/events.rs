// Engine event stream.
// Workers report progress through a shared sink; the CLI renders events to
// the terminal and the session logger mirrors them to disk. Handlers run
// synchronously on the worker that produced the event, so they must stay
// cheap; the download-progress reporter is throttled for exactly that
// reason.

use crate::libs::plan::Action;
use crate::schemas::resource::Kind;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A typed engine event, always attributed to one resource.
#[derive(Debug, Clone)]
pub enum Event {
    /// A resource's action started executing.
    Start { kind: Kind, name: String, version: String, action: Action, method: String },
    /// One line of output captured from a delegation command.
    Output { kind: Kind, name: String, line: String },
    /// Bytes downloaded so far, plus the total when the server sent one.
    DownloadProgress { kind: Kind, name: String, downloaded: u64, total: Option<u64> },
    /// The resource failed; the message is the propagated error.
    Error { kind: Kind, name: String, message: String },
    /// The resource's action finished successfully.
    Complete { kind: Kind, name: String, version: String, action: Action },
}

/// The callback sink workers emit events into. Cheap to clone; absence of
/// interest is the null sink, not an `Option` threaded everywhere.
#[derive(Clone)]
pub struct EventSink(Arc<dyn Fn(&Event) + Send + Sync>);

impl EventSink {
    pub fn new(handler: impl Fn(&Event) + Send + Sync + 'static) -> EventSink {
        EventSink(Arc::new(handler))
    }

    pub fn null() -> EventSink {
        EventSink::new(|_| {})
    }

    pub fn emit(&self, event: &Event) {
        (self.0)(event);
    }

    /// Fans one event out to several sinks (terminal + session log).
    pub fn fanout(sinks: Vec<EventSink>) -> EventSink {
        EventSink::new(move |event| {
            for sink in &sinks {
                sink.emit(event);
            }
        })
    }
}

/// Rate-limits download-progress events per resource so a fast download
/// does not flood the terminal. All other event types pass through
/// unthrottled. The final progress report of a download (downloaded ==
/// total) always passes so displays can settle at 100%.
pub struct ThrottledProgress {
    inner: EventSink,
    min_interval: Duration,
    last_emit: Mutex<std::collections::HashMap<String, Instant>>,
}

impl ThrottledProgress {
    pub fn wrap(inner: EventSink, min_interval: Duration) -> EventSink {
        let throttle = ThrottledProgress {
            inner,
            min_interval,
            last_emit: Mutex::new(std::collections::HashMap::new()),
        };
        EventSink::new(move |event| throttle.handle(event))
    }

    fn handle(&self, event: &Event) {
        if let Event::DownloadProgress { kind, name, downloaded, total } = event {
            let finished = total.map(|t| *downloaded >= t).unwrap_or(false);
            if !finished {
                let key = format!("{kind}/{name}");
                let mut last_emit = self.last_emit.lock().unwrap();
                let now = Instant::now();
                match last_emit.get(&key) {
                    Some(previous) if now.duration_since(*previous) < self.min_interval => {
                        return;
                    }
                    _ => {
                        last_emit.insert(key, now);
                    }
                }
            }
        }
        self.inner.emit(event);
    }
}
