/// Per-transport channel bindings and the resource resolver.
pub mod binding;
/// Cancellation signal with an optional cause.
pub mod cancel;
/// Settings loading (defaults, optional file, `BUSLINE_` environment).
pub mod config;
/// Outbound and inbound envelopes, acknowledgment capability.
pub mod envelope;
/// Broadcast registry: fan-out of one item to every registered callback.
pub mod fanout;
/// Header mapping and wire normalization.
pub mod headers;
/// Channel → registry map shared by the subscribers of one adapter.
pub mod hub;
/// Logging (formatting, filters, sinks).
pub mod logging;
/// Concurrent executor that joins task errors.
pub mod pool;
/// Transport contracts and the AMQP, Kafka and HTTP adapters.
pub mod transport;

// -----------------------------------------------------------------------------
//  Frequently used public types
// -----------------------------------------------------------------------------

/// Errors and result types.
pub use busline_error::{BusError, BusResult, ErrorExt, JoinedError, StatusCode};
/// Cancellation.
pub use cancel::Cancel;
/// Settings.
pub use config::Settings;
/// Envelopes.
pub use envelope::{Acknowledger, EnvelopeIn, EnvelopeOut};
/// Fan-out.
pub use fanout::{callback, Callback, FanOut, Registration, SlotHandle};
/// Headers.
pub use headers::{HeaderValue, Headers};
/// Subscriptions.
pub use hub::{HubSubscriber, SubscriberHub, Topic};
/// Executor.
pub use pool::ErrorPool;
/// Transport contracts.
pub use transport::{Consumer, Producer, Publisher, Subscriber};
