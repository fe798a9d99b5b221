//! pairkit client: pairing and session engines over an injected relay.
//!
//! Two untrusted peers establish a shared encrypted channel over opaque relay
//! topics, negotiate permissions, and maintain a long-lived session either
//! side can update or terminate. This crate holds the two handshake state
//! machines, the topic dispatcher that routes inbound frames to them, and the
//! [`Client`] facade the host application talks to. Protocol primitives (the
//! envelope codec, crypto provider, sequence store, URI format) live in
//! `pairkit-lib`.

pub mod client;
pub mod pairing;
pub mod session;
pub mod subscriber;

pub use client::{Client, ClientConfig, ClientEvent, ConnectParams, EventReceiver};
pub use pairing::{PairingEngine, PairingSequence, PairingState};
pub use session::{SessionEngine, SessionSequence, SessionState};
pub use subscriber::{RequestHandler, Subscriber, RESPONSE_TIMEOUT};

// the primitives callers need alongside the client surface
pub use pairkit_lib::{
    AppMetadata, FrameReceiver, PairingUri, PairkitError, Permissions, Reason,
    RelayProtocolOptions, RelayTransport, Result, SequenceHook, SessionProposal, Topic,
};
