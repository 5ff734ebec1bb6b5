//! wmhub-core: the connection-and-event hub
//!
//! Owns exactly one multiplexed connection to the window manager, fans
//! inbound events out to registered extension handlers, interleaves a
//! request/response command channel over the same connection, and can act
//! as a status-line producer over its own stdin/stdout.
//!
//! Components:
//! - [`connection`] — the Connection Multiplexer (single reader, single
//!   serialized writer)
//! - [`gateway`] — the Command Gateway (reply correlation, timeouts)
//! - [`router`] — the Event Router (subscription table, dispatch)
//! - [`status`] — the Status Output Multiplexer (block set, click routing)
//! - [`lifecycle`] — connection state machine and reconnect policy
//! - [`hub`] — the assembled hub, its builder, and the [`HubApi`]
//!   capability handed to handlers

pub mod connection;
pub mod extension;
pub mod gateway;
pub mod hub;
pub mod lifecycle;
pub mod router;
pub mod status;

pub use connection::{Connect, UnixConnector};
pub use extension::{click_fn, events, handler_fn, ClickHandler, Event, EventHandler};
pub use hub::{Hub, HubApi, HubBuilder};
pub use lifecycle::{ConnectionState, ReconnectPolicy};
pub use router::SubscriptionHandle;
pub use status::{StatusOptions, StatusStreams};

pub use wmhub_protocol as protocol;
pub use wmhub_utils::{HubError, Result};
