//! HTTP/2 server side
//!
//! # Architecture
//!
//! The protocol itself is sans-io. [`H2Connection`] takes received bytes and
//! returns [`Event`]s; responses are queued with `send_headers` / `send_data`
//! and leave through `data_to_send`. Frames, SETTINGS, flow-control windows
//! and stream states live in their own modules underneath it.
//!
//! [`H2Engine`] puts a connection on an async socket: one engine loop owns the
//! socket and every stream runs as its own task. In thread mode
//! [`engine::run_on_thread`] runs the engine on a loop thread and hands
//! blocking handlers back to the worker through a [`HandoffQueue`].
//!
//! # Examples
//!
//! ```
//! use xserve::http::h2::{ConnectionConfig, Event, H2Connection};
//!
//! let mut conn = H2Connection::new(ConnectionConfig::default()).unwrap();
//! conn.initiate_connection();
//! let preface = conn.data_to_send();
//! // Our SETTINGS frame goes out first
//! assert_eq!(preface[3], 0x4);
//!
//! let events = conn.receive_data(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n\0\0\0\x04\0\0\0\0\0").unwrap();
//! assert!(matches!(events[0], Event::RemoteSettingsChanged { .. }));
//! ```

pub mod codec;
pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod flow_control;
pub mod frames;
pub mod handoff;
pub mod settings;
pub mod stream;

pub use connection::{ConnectionConfig, H2Connection};
pub use engine::{EngineConfig, FlowWaiters, H2Engine};
pub use error::{Error, ErrorCode, Result};
pub use events::Event;
pub use frames::{Frame, FrameFlags, FrameType};
pub use handoff::{HandoffQueue, HandoffSender};
pub use settings::{Settings, SettingsBuilder};
pub use stream::{StreamId, StreamState};

/// Client connection preface (RFC 7540 Section 3.5)
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;
