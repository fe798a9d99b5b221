//! Client facade.
//!
//! Thin orchestration over the two engines: wires crypto provider, envelope
//! codec, subscriber and sequence stores together with explicit dependency
//! injection, and exposes the public connect/pair/approve/reject/disconnect
//! surface. Settlement and proposal notifications reach the host application
//! over an event channel rather than delegate callbacks; [`Client::new`]
//! returns the receiver alongside the client.

use std::sync::Arc;

use tokio::sync::mpsc;

use pairkit_lib::{
    AppMetadata, CryptoProvider, EnvelopeCodec, PairingUri, PairkitError, Permissions, Reason,
    RelayProtocolOptions, RelayTransport, Result, Sequence, SequenceHook, SequenceStore,
    SessionProposal, Topic,
};

use crate::pairing::{PairingEngine, PairingSequence};
use crate::session::{SessionEngine, SessionSequence};
use crate::subscriber::Subscriber;

/// Static identity of this client: who it is, which role it plays, and which
/// relay protocol it speaks.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub metadata: AppMetadata,
    /// Whether this peer holds controller authority over session parameters.
    /// Exactly one side of any pairing may.
    pub controller: bool,
    pub relay: RelayProtocolOptions,
}

/// Notifications published to the host application.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    PairingSettled { pairing: PairingSequence },
    PairingDeleted { topic: Topic, reason: Reason },
    SessionProposal {
        pairing_topic: Topic,
        proposal: SessionProposal,
    },
    SessionSettled { session: SessionSequence },
    SessionRejected { topic: Topic, reason: Reason },
    SessionUpdated {
        topic: Topic,
        permissions: Permissions,
    },
    SessionDeleted { topic: Topic, reason: Reason },
}

/// Receiving half of the client's event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<ClientEvent>;

/// Parameters for [`Client::connect`].
#[derive(Clone, Debug)]
pub struct ConnectParams {
    /// Settled pairing to propose the session over, if one exists. `None`
    /// starts a fresh pairing instead.
    pub pairing_topic: Option<Topic>,
    /// Permissions the session will request.
    pub permissions: Permissions,
}

pub struct Client {
    crypto: Arc<CryptoProvider>,
    pairing: Arc<PairingEngine>,
    session: Arc<SessionEngine>,
    subscriber: Arc<Subscriber>,
}

impl Client {
    /// Build a client over an injected relay transport, with in-memory
    /// sequence stores.
    pub fn new(config: ClientConfig, relay: Arc<dyn RelayTransport>) -> (Self, EventReceiver) {
        Self::with_hooks(config, relay, None, None)
    }

    /// Build a client whose sequence stores persist through the given hooks.
    /// Call [`Client::hydrate`] afterwards to load previously saved state.
    pub fn with_hooks(
        config: ClientConfig,
        relay: Arc<dyn RelayTransport>,
        pairing_hook: Option<Arc<dyn SequenceHook<PairingSequence>>>,
        session_hook: Option<Arc<dyn SequenceHook<SessionSequence>>>,
    ) -> (Self, EventReceiver) {
        let crypto = Arc::new(CryptoProvider::new());
        let codec = Arc::new(EnvelopeCodec::new(crypto.clone()));
        let subscriber = Arc::new(Subscriber::new(relay, codec));
        let config = Arc::new(config);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let pairing_store = Arc::new(match pairing_hook {
            Some(hook) => SequenceStore::with_hook(hook),
            None => SequenceStore::new(),
        });
        let session_store = Arc::new(match session_hook {
            Some(hook) => SequenceStore::with_hook(hook),
            None => SequenceStore::new(),
        });

        let pairing = Arc::new(PairingEngine::new(
            crypto.clone(),
            subscriber.clone(),
            pairing_store,
            config.clone(),
            events_tx.clone(),
        ));
        pairing.register();

        let session = Arc::new(SessionEngine::new(
            crypto.clone(),
            subscriber.clone(),
            session_store,
            config,
            events_tx,
        ));
        session.register();

        (
            Self {
                crypto,
                pairing,
                session,
                subscriber,
            },
            events_rx,
        )
    }

    /// Load persisted sequences and resubscribe their topics.
    pub async fn hydrate(&self) -> Result<()> {
        self.pairing.hydrate().await?;
        self.session.hydrate().await
    }

    /// Start a connection. With a settled pairing topic, proposes a session
    /// over it and returns `None`; otherwise proposes a fresh pairing and
    /// returns its connection URI for out-of-band delivery.
    pub async fn connect(&self, params: ConnectParams) -> Result<Option<String>> {
        params.permissions.validate()?;
        if let Some(pairing_topic) = &params.pairing_topic {
            let pairing = self.pairing.get(pairing_topic).await?;
            if !pairing.is_settled() {
                return Err(PairkitError::invalid_state(
                    &pairing_topic.0,
                    "pairing not settled",
                ));
            }
            self.session
                .propose(pairing_topic, params.permissions)
                .await?;
            return Ok(None);
        }
        let uri = self.pairing.propose().await?;
        Ok(Some(uri.format()))
    }

    /// Answer a pairing proposal received as a connection URI.
    pub async fn pair(&self, uri: &str) -> Result<Topic> {
        let proposal = PairingUri::parse(uri)?;
        self.pairing.respond(&proposal).await
    }

    /// Approve a session proposal with the permissions this side grants.
    pub async fn approve(&self, proposal: &SessionProposal, granted: Permissions) -> Result<Topic> {
        self.session.approve(proposal, granted).await
    }

    /// Reject a session proposal over the pairing topic it arrived on.
    pub async fn reject(
        &self,
        pairing_topic: &Topic,
        proposal: &SessionProposal,
        reason: Reason,
    ) -> Result<()> {
        self.session.reject(pairing_topic, proposal, reason).await
    }

    /// Renegotiate a settled session's permissions. Controller only.
    pub async fn update(&self, topic: &Topic, permissions: Permissions) -> Result<()> {
        self.session.update(topic, permissions).await
    }

    /// Tear down the session or pairing living on the topic. Idempotent:
    /// disconnecting an unknown topic is a no-op.
    pub async fn disconnect(&self, topic: &Topic, reason: Reason) -> Result<()> {
        if self.session.contains(topic) {
            self.session.delete(topic, reason).await
        } else {
            self.pairing.delete(topic, reason).await
        }
    }

    /// Short digest of the topic's settled symmetric key, for out-of-band
    /// comparison between peers. `None` until the topic has a key.
    pub fn key_fingerprint(&self, topic: &Topic) -> Option<String> {
        self.crypto.key_fingerprint(topic)
    }

    pub fn settled_pairings(&self) -> Vec<PairingSequence> {
        self.pairing.settled()
    }

    pub fn settled_sessions(&self) -> Vec<SessionSequence> {
        self.session.settled()
    }

    /// Stop every topic reader and unsubscribe from the relay.
    pub async fn shutdown(&self) {
        self.subscriber.shutdown().await;
    }
}
