//! Live document tailing and subscription multiplexing for crawltail.
//!
//! A [`Session`] is one client connection. Each subscription it holds owns a
//! [`StorageLink`] whose [`Poller`] tails a collection of a
//! [`DocumentStore`](crawltail_storage::DocumentStore); tailed documents and
//! upstream [`CrawlProcess`] signals are routed through the session's
//! [`SubscriptionRegistry`] and written to an [`EventSink`], optionally batched
//! by a [`DelayController`].

pub mod delay;
pub mod link;
pub mod poller;
pub mod process;
pub mod registry;
pub mod session;
pub mod signals;
pub mod sink;

pub use delay::{DelayController, Pending};
pub use link::{LinkKind, StorageLink, TailReceiver};
pub use poller::{Poller, PollerState};
pub use process::CrawlProcess;
pub use registry::{Route, SubscriptionCriteria, SubscriptionRegistry};
pub use session::Session;
pub use signals::{CrawlSignal, Listener, ListenerId, SignalBus, SignalKind};
pub use sink::{ChannelSink, EventSink, OutboundEvent};
