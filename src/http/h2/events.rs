//! Events produced by [`H2Connection::receive_data`](super::H2Connection::receive_data)

use super::error::ErrorCode;
use super::settings::Settings;
use super::stream::StreamId;
use bytes::Bytes;

#[derive(Debug, Clone)]
pub enum Event {
    /// A complete header block opened a stream
    RequestReceived {
        stream_id: StreamId,
        /// Decoded fields in arrival order, pseudo-headers first
        headers: Vec<(String, String)>,
    },
    DataReceived {
        stream_id: StreamId,
        data: Bytes,
        /// Length counted against flow control, padding included
        flow_controlled_length: usize,
    },
    /// The peer finished sending on this stream
    StreamEnded { stream_id: StreamId },
    /// The stream was reset by the peer (`remote`) or by us after a stream error
    StreamReset {
        stream_id: StreamId,
        error_code: ErrorCode,
        remote: bool,
    },
    /// Send window grew; stream 0 means the connection window
    WindowUpdated { stream_id: StreamId, delta: u32 },
    RemoteSettingsChanged { changed: Settings },
    SettingsAcknowledged,
    /// The peer sent GOAWAY
    ConnectionTerminated {
        error_code: ErrorCode,
        last_stream_id: StreamId,
    },
}

impl Event {
    /// The stream this event belongs to, if any
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Event::RequestReceived { stream_id, .. }
            | Event::DataReceived { stream_id, .. }
            | Event::StreamEnded { stream_id }
            | Event::StreamReset { stream_id, .. } => Some(*stream_id),
            Event::WindowUpdated { stream_id, .. } if *stream_id != 0 => Some(*stream_id),
            _ => None,
        }
    }
}
