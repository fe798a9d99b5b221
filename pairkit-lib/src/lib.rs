//! pairkit protocol primitives.
//!
//! This crate holds everything below the engines: the error taxonomy, shared
//! protocol types, the crypto provider, the authenticated envelope codec, the
//! JSON-RPC payload model, the connection URI, the topic-keyed sequence
//! store, and the relay transport boundary. The pairing and session state
//! machines live in `pairkit-client`.

pub mod crypto;
pub mod envelope;
pub mod errors;
pub mod relay;
pub mod rpc;
pub mod store;
pub mod types;
pub mod uri;

pub use crypto::{CryptoProvider, KeyPair, PublicKey, SymmetricKey};
pub use envelope::{EncryptionEnvelope, EnvelopeCodec};
pub use errors::{PairkitError, Result};
pub use relay::{FrameReceiver, RelayTransport};
pub use rpc::{Payload, Request, RequestId, RequestParams, Response, SessionProposal};
pub use store::{Sequence, SequenceHook, SequenceStore};
pub use types::{
    unix_now, AppMetadata, Participant, Permissions, Reason, RelayProtocolOptions, Topic,
};
pub use uri::{PairingUri, PROTOCOL_VERSION};
