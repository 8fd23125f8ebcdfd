//! XMPP transport layer: session plumbing, custom stanza payloads, and the
//! watcher/daemon roles built on top of them.
//!
//! Grounded on `baboon/transport.py` and `baboond/transport.py`, both of
//! which wrap a single `sleekxmpp` client connection. `xmpp-parsers`
//! supplies the typed element vocabulary this module needs (`Jid`, stanza
//! namespaces); the connection itself is hand-rolled synchronous TCP plus
//! SASL PLAIN, since no crate in reach parses an open XMPP stream without
//! pulling in an async runtime the rest of this thread-per-responsibility
//! codebase doesn't otherwise need.

pub mod bytestream;
pub mod client;
pub mod daemon;
pub mod session;
pub mod stanza;

pub use bytestream::Bytestream;
pub use client::WatcherTransport;
pub use daemon::DaemonTransport;
pub use session::{ReadyFlag, Session};
