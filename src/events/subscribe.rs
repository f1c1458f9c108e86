//! # Handler trait
//!
//! `Subscribe` is the extension point for consumers of bus traffic: the
//! reconciler, timeline/log widgets, notification sinks, test probes.
//!
//! ## Contract
//! - Handlers run **synchronously** inside [`Bus::dispatch`](crate::Bus::dispatch),
//!   on whatever task published the message. Keep them short; spawn if the work
//!   is slow.
//! - A panicking handler is isolated: the bus logs it and keeps delivering to
//!   the remaining handlers.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use fleetwatch::{Bus, HandlerFn, Message, Subscribe, Topic};
//!
//! struct Audit;
//!
//! impl Subscribe for Audit {
//!     fn on_message(&self, message: &Message) {
//!         // write audit record...
//!         let _ = message.topic();
//!     }
//!     fn name(&self) -> &str { "audit" }
//! }
//!
//! let bus = Bus::new();
//! bus.subscribe(Topic::Converged, Arc::new(Audit));
//! bus.subscribe(Topic::Build, HandlerFn::arc("build-gate", |_msg: &Message| {}));
//! ```

use std::borrow::Cow;
use std::sync::Arc;

use super::message::Message;

/// Contract for bus handlers.
pub trait Subscribe: Send + Sync + 'static {
    /// Handles one message routed to this subscription.
    fn on_message(&self, message: &Message);

    /// Human-readable name (for logs).
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Closure-backed handler.
pub struct HandlerFn<F> {
    name: Cow<'static, str>,
    f: F,
}

impl<F> HandlerFn<F>
where
    F: Fn(&Message) + Send + Sync + 'static,
{
    /// Wraps a closure under the given name.
    pub fn new(name: impl Into<Cow<'static, str>>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }

    /// Wraps a closure and returns it ready for [`Bus::subscribe`](crate::Bus::subscribe).
    pub fn arc(name: impl Into<Cow<'static, str>>, f: F) -> Arc<Self> {
        Arc::new(Self::new(name, f))
    }
}

impl<F> Subscribe for HandlerFn<F>
where
    F: Fn(&Message) + Send + Sync + 'static,
{
    fn on_message(&self, message: &Message) {
        (self.f)(message)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
