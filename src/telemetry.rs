//! Lifecycle telemetry for connections.
//!
//! Connections report spans (`start`/`stop`, or `exception` when a fault cuts a
//! span short) and instant events to a [`TelemetrySink`]. The default sink,
//! [`TracingSink`], forwards everything to `tracing`.
//!
//! Telemetry never changes the outcome of the work it observes: a sink which panics
//! is logged and otherwise ignored.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::{Method, StatusCode};
use tracing::{debug, error, warn};

use crate::transport::Origin;

/// Lifecycle events reported by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Establishing a new transport handle.
    Connect,

    /// Sending a request head and body.
    Request,

    /// Receiving a response.
    Response,

    /// `connect` was called on a connection which already had a handle.
    ReusedConnection,
}

impl Event {
    /// The event's name.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connect => "connect",
            Event::Request => "request",
            Event::Response => "response",
            Event::ReusedConnection => "reused_connection",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Describes what an event is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// The connection's origin.
    pub origin: Origin,

    /// Request method, for request and response events.
    pub method: Option<Method>,

    /// Request target, for request and response events.
    pub path: Option<String>,

    /// Response status, once known.
    pub status: Option<StatusCode>,

    /// Error description, when the span failed.
    pub error: Option<String>,
}

impl Metadata {
    /// Metadata for an origin, with no request details.
    pub fn new(origin: &Origin) -> Self {
        Self {
            origin: origin.clone(),
            method: None,
            path: None,
            status: None,
            error: None,
        }
    }

    /// Add request details.
    pub fn with_request(mut self, method: &Method, path: &str) -> Self {
        self.method = Some(method.clone());
        self.path = Some(path.to_owned());
        self
    }

    /// Record the response status.
    pub fn with_status(mut self, status: Option<StatusCode>) -> Self {
        self.status = status;
        self
    }

    /// Record an error.
    pub fn with_error(mut self, error: &dyn std::error::Error) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Numeric measurements attached to an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Measurements {
    /// How long the connection was idle before the request.
    pub idle_time: Option<Duration>,

    /// How long the span lasted, on stop and exception records.
    pub duration: Option<Duration>,
}

impl Measurements {
    /// Measurements carrying an idle time.
    pub fn idle(idle_time: Duration) -> Self {
        Self {
            idle_time: Some(idle_time),
            duration: None,
        }
    }
}

/// Marks the start of a span, returned by [`Telemetry::start`].
#[derive(Debug, Clone, Copy)]
pub struct SpanToken {
    started: Instant,
}

impl SpanToken {
    pub(crate) fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Time since the span started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// The kind of fault which ended a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExceptionKind {
    /// A panic unwound through the span.
    Panic,
}

/// A single telemetry record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// A span started.
    Start {
        /// Event
        event: Event,
        /// Metadata
        metadata: Metadata,
        /// Measurements
        measurements: Measurements,
    },

    /// A span finished, successfully or with `metadata.error` set.
    Stop {
        /// Event
        event: Event,
        /// Metadata
        metadata: Metadata,
        /// Measurements, including the span's duration.
        measurements: Measurements,
    },

    /// A span was cut short by a fault.
    Exception {
        /// Event
        event: Event,
        /// Kind of fault
        kind: ExceptionKind,
        /// Description of the fault
        reason: String,
        /// Metadata
        metadata: Metadata,
        /// Measurements, including the span's duration.
        measurements: Measurements,
    },

    /// A point-in-time event.
    Instant {
        /// Event
        event: Event,
        /// Metadata
        metadata: Metadata,
        /// Measurements
        measurements: Measurements,
    },
}

impl Record {
    /// The event this record concerns.
    pub fn event(&self) -> Event {
        match self {
            Record::Start { event, .. }
            | Record::Stop { event, .. }
            | Record::Exception { event, .. }
            | Record::Instant { event, .. } => *event,
        }
    }

    /// The record's metadata.
    pub fn metadata(&self) -> &Metadata {
        match self {
            Record::Start { metadata, .. }
            | Record::Stop { metadata, .. }
            | Record::Exception { metadata, .. }
            | Record::Instant { metadata, .. } => metadata,
        }
    }

    /// The record's measurements.
    pub fn measurements(&self) -> &Measurements {
        match self {
            Record::Start { measurements, .. }
            | Record::Stop { measurements, .. }
            | Record::Exception { measurements, .. }
            | Record::Instant { measurements, .. } => measurements,
        }
    }

    /// A short name, e.g. `request.start` or `reused_connection`.
    pub fn name(&self) -> String {
        match self {
            Record::Start { event, .. } => format!("{event}.start"),
            Record::Stop { event, .. } => format!("{event}.stop"),
            Record::Exception { event, .. } => format!("{event}.exception"),
            Record::Instant { event, .. } => event.to_string(),
        }
    }
}

/// Receives telemetry records.
pub trait TelemetrySink: Send + Sync + 'static {
    /// Handle one record.
    fn record(&self, record: &Record);
}

/// Forwards telemetry records to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, record: &Record) {
        match record {
            Record::Start {
                event,
                metadata,
                measurements,
            } => debug!(
                %event,
                origin = %metadata.origin,
                method = ?metadata.method,
                path = ?metadata.path,
                idle_time = ?measurements.idle_time,
                "start"
            ),
            Record::Stop {
                event,
                metadata,
                measurements,
            } => debug!(
                %event,
                origin = %metadata.origin,
                status = ?metadata.status,
                error = ?metadata.error,
                duration = ?measurements.duration,
                "stop"
            ),
            Record::Exception {
                event,
                kind,
                reason,
                metadata,
                measurements,
            } => error!(
                %event,
                ?kind,
                %reason,
                origin = %metadata.origin,
                path = ?metadata.path,
                duration = ?measurements.duration,
                "exception"
            ),
            Record::Instant {
                event, metadata, ..
            } => debug!(%event, origin = %metadata.origin, "event"),
        }
    }
}

/// Handle used by connections to report telemetry.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<dyn TelemetrySink>,
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry").finish()
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(TracingSink)
    }
}

impl Telemetry {
    /// Report to `sink`.
    pub fn new(sink: impl TelemetrySink) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// Report to a shared sink.
    pub fn from_arc(sink: Arc<dyn TelemetrySink>) -> Self {
        Self { sink }
    }

    /// Start a span.
    pub fn start(&self, event: Event, metadata: &Metadata, measurements: Measurements) -> SpanToken {
        let token = SpanToken::new();
        self.emit(Record::Start {
            event,
            metadata: metadata.clone(),
            measurements,
        });
        token
    }

    /// Finish a span.
    pub fn stop(
        &self,
        event: Event,
        token: SpanToken,
        metadata: &Metadata,
        mut measurements: Measurements,
    ) {
        measurements.duration = Some(token.elapsed());
        self.emit(Record::Stop {
            event,
            metadata: metadata.clone(),
            measurements,
        });
    }

    /// Report a fault which cut a span short.
    pub fn exception(
        &self,
        event: Event,
        token: SpanToken,
        kind: ExceptionKind,
        reason: impl Into<String>,
        metadata: &Metadata,
        mut measurements: Measurements,
    ) {
        measurements.duration = Some(token.elapsed());
        self.emit(Record::Exception {
            event,
            kind,
            reason: reason.into(),
            metadata: metadata.clone(),
            measurements,
        });
    }

    /// Report a point-in-time event.
    pub fn event(&self, event: Event, measurements: Measurements, metadata: &Metadata) {
        self.emit(Record::Instant {
            event,
            metadata: metadata.clone(),
            measurements,
        });
    }

    fn emit(&self, record: Record) {
        if catch_unwind(AssertUnwindSafe(|| self.sink.record(&record))).is_err() {
            warn!(event = %record.event(), "telemetry sink panicked");
        }
    }
}

#[cfg(any(test, feature = "mocks"))]
pub use self::recording::RecordingSink;

#[cfg(any(test, feature = "mocks"))]
mod recording {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{Record, TelemetrySink};

    /// A sink which keeps every record, for inspection in tests.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingSink {
        records: Arc<Mutex<Vec<Record>>>,
    }

    impl RecordingSink {
        /// Create an empty sink.
        pub fn new() -> Self {
            Self::default()
        }

        /// Every record so far.
        pub fn records(&self) -> Vec<Record> {
            self.records.lock().clone()
        }

        /// The names of every record so far, see [`Record::name`].
        pub fn names(&self) -> Vec<String> {
            self.records.lock().iter().map(Record::name).collect()
        }
    }

    impl TelemetrySink for RecordingSink {
        fn record(&self, record: &Record) {
            self.records.lock().push(record.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::uri::Scheme;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Telemetry: Send, Sync, Clone);

    fn metadata() -> Metadata {
        Metadata::new(&Origin::new(Scheme::HTTP, "example.com", 80))
    }

    #[test]
    fn span_records_duration() {
        let sink = RecordingSink::new();
        let telemetry = Telemetry::new(sink.clone());

        let token = telemetry.start(Event::Connect, &metadata(), Measurements::default());
        telemetry.stop(Event::Connect, token, &metadata(), Measurements::default());

        assert_eq!(sink.names(), vec!["connect.start", "connect.stop"]);
        let records = sink.records();
        assert!(records[0].measurements().duration.is_none());
        assert!(records[1].measurements().duration.is_some());
    }

    #[test]
    fn instant_event_name() {
        let sink = RecordingSink::new();
        let telemetry = Telemetry::new(sink.clone());
        telemetry.event(Event::ReusedConnection, Measurements::default(), &metadata());
        assert_eq!(sink.names(), vec!["reused_connection"]);
    }

    struct Exploding;

    impl TelemetrySink for Exploding {
        fn record(&self, _record: &Record) {
            panic!("sink failure");
        }
    }

    #[test]
    fn panicking_sink_is_contained() {
        let telemetry = Telemetry::new(Exploding);
        let token = telemetry.start(Event::Request, &metadata(), Measurements::default());
        telemetry.stop(Event::Request, token, &metadata(), Measurements::default());
    }

    #[test]
    fn metadata_builders() {
        let error = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let metadata = metadata()
            .with_request(&Method::GET, "/a?b")
            .with_status(Some(StatusCode::OK))
            .with_error(&error);

        assert_eq!(metadata.method, Some(Method::GET));
        assert_eq!(metadata.path.as_deref(), Some("/a?b"));
        assert_eq!(metadata.status, Some(StatusCode::OK));
        assert_eq!(metadata.error.as_deref(), Some("boom"));
    }
}
