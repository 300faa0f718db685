//! LPR Push Ingest
//!
//! Push-based HTTP(S) endpoint for license-plate detection events. Camera
//! firmware POSTs a detection in whatever shape it likes (JSON, form data,
//! loose `key=value` text, query parameters); the listener decodes it into a
//! normalized [`DecodedEvent`] and hands it to the application.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              lpr-ingest                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────────┐                                                   │
//! │  │  PlateListener   │ ← POST https://<prefix>/...                       │
//! │  │  (accept loops)  │                                                   │
//! │  └────────┬─────────┘                                                   │
//! │           │ one task per connection                                     │
//! │           ▼                                                             │
//! │  ┌──────────────────┐   ┌──────────────────┐   ┌────────────────────┐  │
//! │  │  Push handler    │──▶│  Payload decoder │──▶│  Field resolver    │  │
//! │  │  (axum)          │   │  (query + body)  │   │  (aliases + regex) │  │
//! │  └────────┬─────────┘   └──────────────────┘   └────────────────────┘  │
//! │           │ DecodedEvent                                                │
//! │           ▼                                                             │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  PlateEventHandler (application)                                  │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod event;
pub mod fields;
pub mod handler;
pub mod listener;
pub mod metrics;
pub mod normalize;
pub mod payload;
pub mod resolver;
pub mod tls;

pub use config::{Config, ConfigError, ServerConfig};
pub use event::{DecodedEvent, PlateNotification};
pub use fields::{FieldMap, FieldOrigin};
pub use handler::{ChannelHandler, FnHandler, PlateEventHandler};
pub use listener::{ListenerError, ListenerState, PlateListener};
