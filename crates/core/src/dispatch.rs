use std::collections::HashMap;

use crate::error::DecodeError;
use crate::protocol::{Event, Message, PhaseKind, Route, TransferKind, decode};

pub type Handler = Box<dyn FnMut(&Event) + Send>;

#[derive(Debug)]
pub enum DispatchOutcome {
    /// Number of handlers that ran.
    Handled(usize),
    /// Decoded fine, but nothing is registered for this route.
    Unhandled(Route),
    Dropped(DecodeError),
}

/// Routes decoded worker events to handlers registered per `(kind, phase)`.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<Route, Vec<Handler>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut routes: Vec<_> = self.handlers.keys().map(|r| r.to_string()).collect();
        routes.sort();
        f.debug_struct("Dispatcher").field("routes", &routes).finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&mut self, route: Route, handler: F) -> &mut Self
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.handlers
            .entry(route)
            .or_default()
            .push(Box::new(handler));
        self
    }

    pub fn on_transfer<F>(&mut self, kind: TransferKind, phase: PhaseKind, handler: F) -> &mut Self
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.on(Route::transfer(kind, phase), handler)
    }

    pub fn is_registered(&self, route: &Route) -> bool {
        self.handlers.contains_key(route)
    }

    pub fn dispatch_event(&mut self, event: &Event) -> DispatchOutcome {
        let route = event.route();
        match self.handlers.get_mut(&route) {
            Some(handlers) => {
                for handler in handlers.iter_mut() {
                    handler(event);
                }
                DispatchOutcome::Handled(handlers.len())
            }
            None => {
                tracing::warn!(
                    event = "dispatch.unhandled_route",
                    route = %route,
                    "dispatch.unhandled_route"
                );
                DispatchOutcome::Unhandled(route)
            }
        }
    }
}

/// Decodes `message` and runs the handlers registered for it.
///
/// Never fails: a message this build cannot decode is dropped with a warning
/// so newer producers can add phases without breaking older consumers.
pub fn dispatch(message: &Message, dispatcher: &mut Dispatcher) -> DispatchOutcome {
    match decode(message) {
        Ok(event) => dispatcher.dispatch_event(&event),
        Err(e) => {
            tracing::warn!(
                event = "protocol.decode_failed",
                error = %e,
                "protocol.decode_failed"
            );
            DispatchOutcome::Dropped(e)
        }
    }
}
