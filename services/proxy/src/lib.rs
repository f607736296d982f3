//! hopper: a transparent proxy that can move a connected client from one
//! backend server to another without the client reconnecting.
//!
//! The client sends an in-band directive (by default `/transfer <server>`);
//! the proxy retires the current backend connection, opens one to the named
//! server on the client's behalf and resumes relaying. Units the client sends
//! in between are buffered and replayed in order.

pub mod command;
pub mod config;
pub mod directory;
pub mod error;
pub mod listener;
pub mod observer;
pub mod proxy;
pub mod session;
pub mod transport;

pub use command::{CommandInterceptor, Directive, DirectiveParser, Interception, SlashCommandParser};
pub use config::{BackoffPolicy, Cli, ConfigError, ProxyConfig, TransferFailurePolicy, TransportKind};
pub use directory::{Backend, BackendDirectory};
pub use error::{RegistryError, SessionError, TransportError};
pub use hopper_id::{ClientId, LinkId};
pub use listener::{Listener, ListenerConfig, ListenerStats};
pub use observer::{LogObserver, ProxyEvent, ProxyObserver};
pub use proxy::{Proxy, ProxyBuilder, ProxyStats};
pub use session::{SessionHandle, SessionRegistry, SessionSnapshot, SessionState};
pub use transport::{
    ApplicationUnit, ClientProfile, Connection, MemoryBackend, MemoryEnd, MemoryTransport,
    Packet, PacketTransport, ProxyProtocol, RawTransport, StreamTransport, Transport, UnitSink,
    UnitSource,
};
