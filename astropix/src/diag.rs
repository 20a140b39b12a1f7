/*!
Diagnostic sinks for human-readable decode traces.

A sink is handed to the decoder when it is built and only ever receives
events; it cannot influence what gets decoded.
*/

use std::fmt;

/// Receives one human-readable event per decoded hit
pub trait DiagnosticSink {
    fn record(&self, event: fmt::Arguments<'_>);
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn record(&self, _event: fmt::Arguments<'_>) {}
}

/// Forwards events to `tracing` at info level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn record(&self, event: fmt::Arguments<'_>) {
        tracing::info!("{}", event);
    }
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSink for &S {
    fn record(&self, event: fmt::Arguments<'_>) {
        (**self).record(event)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::RefCell;

    use super::*;

    /// Keeps every event for inspection
    #[derive(Debug, Default)]
    pub(crate) struct CollectingSink {
        pub events: RefCell<Vec<String>>,
    }

    impl DiagnosticSink for CollectingSink {
        fn record(&self, event: fmt::Arguments<'_>) {
            self.events.borrow_mut().push(event.to_string());
        }
    }

    #[test]
    fn test_sinks_accept_events() {
        let sink = CollectingSink::default();
        (&sink).record(format_args!("Header: ChipId: {}", 3));
        NullSink.record(format_args!("ignored"));
        TracingSink.record(format_args!("traced"));
        assert_eq!(sink.events.borrow().as_slice(), ["Header: ChipId: 3"]);
    }
}
