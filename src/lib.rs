//! An HTTP/2 (RFC 7540) endpoint runtime: the per connection protocol
//! engine multiplexing logical streams over one reliable byte transport.
//!
//! The crate owns the connection state machine (preface, settings
//! handshake, GOAWAY), the stream registry with its dual level flow
//! control accounting, frame validation and routing, HPACK context
//! management and the HEADERS/CONTINUATION reassembly discipline.
//! Transport setup (TCP/TLS) and the application logic on each stream stay
//! with the embedder.

mod connection;
mod connection_reader;
mod connection_shared;
mod connection_state;
mod connection_writer;
mod frame_utils;
mod headers;
mod hpack;
mod options;
mod proto;
mod response;
mod settings;
mod stream;
mod stream_set;
mod types;

pub mod client;
pub mod server;

pub use connection::{Connection, SendOptions};
pub use connection_shared::{ConnectionInitialState, ALPN_PROTOCOL, CONNECTION_PREFACE};
pub use headers::{find_header, Header, Headers};
pub use options::{
    ConnectionOptions, FlowControlMode, ServerConnectionOptions, SocketOptions, TransportInfo,
};
pub use proto::{ErrorCode, SettingId, SettingsParameter};
pub use response::{ResponsePoll, StreamResult};
pub use settings::SettingsContainer;
pub use stream::{StreamCallback, StreamCallbackFactory, StreamContext};
pub use types::{Error, Notice, Notifier, ProtocolError, Result, StreamId, WindowSize};
