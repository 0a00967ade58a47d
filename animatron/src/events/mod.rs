//! Event bus, replay buffer and event types
//!
//! Every subsystem of the assistant communicates through the bus. Producers
//! publish a payload on a topic; the bus stamps it with a sequence id and a
//! timestamp, appends it to the replay buffer and hands it to each subscriber of
//! that topic in turn.
//!
//! # Architecture
//!
//! ```text
//!  gateway ─┐      ┌──────────────────────────────┐      ┌─ mode state machine
//!  dj tick ─┼────► │          EVENT BUS           │ ───► ├─ status registry
//!  status  ─┘      │ per-topic lock + handler list│      └─ command reactors
//!                  └──────────────┬───────────────┘
//!                                 │ append / broadcast
//!                  ┌──────────────▼───────────────┐
//!                  │ replay buffer (ring, cap. N) │ ───► observers (attach/watch)
//!                  └──────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use animatron::events::{EventBus, handler_fn, topics};
//!
//! let bus = EventBus::with_default_capacity();
//! bus.subscribe(topics::MUSIC_STATUS, handler_fn(|event| async move {
//!     println!("music is now {:?}", event.str_field("state"));
//!     Ok(())
//! }));
//! let seq = bus.publish_from(topics::MUSIC_STATUS, "music", payload).await;
//!
//! // Reconnecting observer
//! let attachment = bus.attach(Some(seq - 1))?;
//! ```

mod bus;
mod replay;
mod tracer;
mod types;

pub use bus::{
    Attachment, BusStats, CORE_SOURCE, DEFAULT_OBSERVER_CAPACITY, EventBus, EventHandler, FnHandler, SubscriptionId,
    handler_fn,
};
pub use replay::{DEFAULT_REPLAY_CAPACITY, ReplayBuffer, ReplayGap};
pub use tracer::{EventTracer, spawn_event_tracer};
pub use types::{Event, Payload, Topic, into_payload, topics};
