//! Lifecycle callbacks.
//!
//! Handlers are registered before the engine is built and are called
//! synchronously, in registration order, before the operation that raised the
//! signal returns. They run inside the scheduling critical section, so they
//! must be quick and must not call back into the scheduler.

use std::fmt;
use std::time::Duration;

use crate::request::FetchRequest;

/// Why the crawl ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Nothing left to schedule or fetch.
    Finished,
    /// `EngineHandle::stop` or Ctrl-C.
    Shutdown,
    /// A fatal scheduler error; the message names component and key.
    Fatal(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Finished => f.write_str("finished"),
            StopReason::Shutdown => f.write_str("shutdown"),
            StopReason::Fatal(msg) => write!(f, "fatal: {}", msg),
        }
    }
}

#[derive(Debug)]
pub enum Signal<'a> {
    EngineStarted,
    SchedulerOpened {
        resumed: bool,
        pending: usize,
    },
    /// Admitted to the priority queue.
    RequestScheduled(&'a FetchRequest),
    /// Rejected by the dupefilter.
    RequestDropped(&'a FetchRequest),
    RequestReachedDownloader(&'a FetchRequest),
    /// `status` is `None` for transport failures.
    ResponseReceived {
        request: &'a FetchRequest,
        status: Option<u16>,
        latency: Duration,
    },
    SchedulerClosed {
        pending: usize,
    },
    EngineStopped(&'a StopReason),
}

pub type Handler = Box<dyn Fn(&Signal<'_>) + Send + Sync>;

#[derive(Default)]
pub struct Signals {
    handlers: Vec<Handler>,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect<F>(&mut self, handler: F)
    where
        F: Fn(&Signal<'_>) + Send + Sync + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    pub fn emit(&self, signal: Signal<'_>) {
        for handler in &self.handlers {
            handler(&signal);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
