//! Pairing handshake state machine.
//!
//! A pairing establishes the first encrypted channel between two peers. The
//! proposer mints a topic and an agreement key pair, hands the proposal out of
//! band as a connection URI, and waits. The responder answers on the topic
//! itself: it derives the shared key from the URI's public key, settles
//! immediately, and publishes a `pairing_approve` whose envelope carries its
//! own key as first contact. Receiving that approve settles the proposer.
//!
//! Exactly one side of a pairing holds the controller role; `respond` rejects
//! proposals where both peers claim the same role before any key material is
//! derived.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use pairkit_lib::rpc::{DeleteParams, PairingApproveParams};
use pairkit_lib::{
    unix_now, CryptoProvider, PairingUri, PairkitError, Participant, Reason, RelayProtocolOptions,
    Request, RequestParams, Result, Sequence, SequenceStore, Topic,
};

use crate::client::{ClientConfig, ClientEvent};
use crate::subscriber::{RequestHandler, Subscriber};

/// Validity window for an unanswered pairing proposal, in seconds.
pub const PROPOSAL_TTL: u64 = 5 * 60;

/// Lifetime of a settled pairing, in seconds.
pub const SETTLED_TTL: u64 = 30 * 24 * 60 * 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingState {
    /// Proposer side, URI handed out, awaiting the responder's approve.
    Proposed,
    /// Both parties confirmed, symmetric key finalized.
    Settled,
}

/// Lifecycle record for one pairing topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PairingSequence {
    pub topic: Topic,
    pub state: PairingState,
    pub self_participant: Participant,
    /// Unknown until the responder's approve arrives.
    pub peer: Option<Participant>,
    pub relay: RelayProtocolOptions,
    /// Unix-seconds expiry: the proposal window while `Proposed`, the pairing
    /// lifetime once `Settled`.
    pub expiry: u64,
}

impl Sequence for PairingSequence {
    fn topic(&self) -> &Topic {
        &self.topic
    }

    fn is_settled(&self) -> bool {
        self.state == PairingState::Settled
    }

    fn expiry(&self) -> Option<u64> {
        Some(self.expiry)
    }
}

/// Drives the pairing handshake on both sides.
pub struct PairingEngine {
    crypto: Arc<CryptoProvider>,
    subscriber: Arc<Subscriber>,
    store: Arc<SequenceStore<PairingSequence>>,
    config: Arc<ClientConfig>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl PairingEngine {
    pub fn new(
        crypto: Arc<CryptoProvider>,
        subscriber: Arc<Subscriber>,
        store: Arc<SequenceStore<PairingSequence>>,
        config: Arc<ClientConfig>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            crypto,
            subscriber,
            store,
            config,
            events,
        }
    }

    /// Register this engine for the pairing methods it answers.
    pub fn register(self: &Arc<Self>) {
        let handler: Arc<dyn RequestHandler> = self.clone();
        let weak = Arc::downgrade(&handler);
        self.subscriber.register("pairing_approve", weak.clone());
        self.subscriber.register("pairing_delete", weak);
    }

    /// Propose a new pairing: mint a topic and key pair, store the `Proposed`
    /// sequence, subscribe, and return the connection URI for out-of-band
    /// delivery.
    pub async fn propose(&self) -> Result<PairingUri> {
        let keypair = self.crypto.generate_keypair();
        let topic = Topic::generate();
        self.crypto.store_keypair(&topic, keypair.clone());

        let sequence = PairingSequence {
            topic: topic.clone(),
            state: PairingState::Proposed,
            self_participant: self.participant(keypair.public_key()),
            peer: None,
            relay: self.config.relay.clone(),
            expiry: unix_now() + PROPOSAL_TTL,
        };
        if let Err(e) = self.store.create(sequence).await {
            self.crypto.remove_topic(&topic);
            return Err(e);
        }
        self.subscriber.subscribe(&topic).await?;

        debug!(topic = %topic, "pairing proposed");
        Ok(PairingUri::new(
            topic,
            keypair.public_key(),
            self.config.controller,
            self.config.relay.clone(),
        ))
    }

    /// Answer a pairing proposal received as a URI. Settles locally, then
    /// publishes `pairing_approve` as first contact and awaits the proposer's
    /// acknowledgment.
    pub async fn respond(&self, proposal: &PairingUri) -> Result<Topic> {
        if proposal.controller == self.config.controller {
            return Err(PairkitError::UnauthorizedMatchingController(
                self.config.controller,
            ));
        }
        let topic = proposal.topic.clone();
        if let Ok(existing) = self.store.get(&topic).await {
            return Err(PairkitError::invalid_state(
                &topic.0,
                match existing.state {
                    PairingState::Settled => "pairing already settled",
                    PairingState::Proposed => "pairing already proposed locally",
                },
            ));
        }

        let keypair = self.crypto.generate_keypair();
        let key = self.crypto.derive_symmetric_key(&keypair, &proposal.public_key);
        self.crypto.store_key(&topic, key);

        let self_participant = self.participant(keypair.public_key());
        let expiry = unix_now() + SETTLED_TTL;
        let sequence = PairingSequence {
            topic: topic.clone(),
            state: PairingState::Settled,
            self_participant: self_participant.clone(),
            peer: Some(Participant {
                public_key: proposal.public_key,
                controller: proposal.controller,
                metadata: None,
            }),
            relay: proposal.relay.clone(),
            expiry,
        };
        if let Err(e) = self.store.create(sequence).await {
            self.crypto.remove_topic(&topic);
            return Err(e);
        }
        self.subscriber.subscribe(&topic).await?;

        let request = Request::new(RequestParams::PairingApprove(PairingApproveParams {
            responder: self_participant,
            relay: proposal.relay.clone(),
            expiry,
        }));
        if let Err(e) = self
            .subscriber
            .request_with_sender(&topic, request, keypair.public_key())
            .await
        {
            // undo the local settle so the proposal can be answered again
            self.store.delete(&topic).await?;
            self.crypto.remove_topic(&topic);
            self.subscriber.unsubscribe(&topic).await?;
            return Err(e);
        }

        debug!(topic = %topic, "pairing settled as responder");
        Ok(topic)
    }

    /// Tear down a pairing: notify the peer, then drop the sequence and its
    /// key material. Deleting an absent topic is a no-op.
    pub async fn delete(&self, topic: &Topic, reason: Reason) -> Result<()> {
        let removed = self.store.delete(topic).await?;
        if removed {
            let request = Request::new(RequestParams::PairingDelete(DeleteParams { reason }));
            if let Err(e) = self.subscriber.notify(topic, request).await {
                warn!(topic = %topic, error = %e, "pairing delete notification failed");
            }
        }
        self.crypto.remove_topic(topic);
        self.subscriber.unsubscribe(topic).await
    }

    pub async fn get(&self, topic: &Topic) -> Result<PairingSequence> {
        self.store.get(topic).await
    }

    pub fn contains(&self, topic: &Topic) -> bool {
        self.store.contains(topic)
    }

    pub fn settled(&self) -> Vec<PairingSequence> {
        self.store.settled()
    }

    /// Load persisted pairings and resubscribe the settled ones.
    pub async fn hydrate(&self) -> Result<()> {
        self.store.hydrate().await?;
        for pairing in self.store.settled() {
            self.subscriber.subscribe(&pairing.topic).await?;
        }
        Ok(())
    }

    fn participant(&self, public_key: pairkit_lib::PublicKey) -> Participant {
        Participant {
            public_key,
            controller: self.config.controller,
            metadata: Some(self.config.metadata.clone()),
        }
    }

    /// Proposer side: the responder's approve arrived on the proposal topic.
    /// The envelope codec has already completed key agreement from the
    /// envelope's sender key by the time this runs.
    async fn on_approve(
        &self,
        topic: &Topic,
        params: PairingApproveParams,
    ) -> Result<serde_json::Value> {
        let sequence = self.store.get(topic).await?;
        if sequence.state != PairingState::Proposed {
            return Err(PairkitError::invalid_state(
                &topic.0,
                "pairing already settled",
            ));
        }
        let settled = self
            .store
            .update(topic, |s| {
                s.state = PairingState::Settled;
                s.peer = Some(params.responder.clone());
                s.relay = params.relay.clone();
                s.expiry = params.expiry;
            })
            .await?;

        debug!(topic = %topic, "pairing settled as proposer");
        let _ = self.events.send(ClientEvent::PairingSettled { pairing: settled });
        Ok(serde_json::Value::Bool(true))
    }

    async fn on_delete(&self, topic: &Topic, params: DeleteParams) -> Result<serde_json::Value> {
        self.store.delete(topic).await?;
        self.crypto.remove_topic(topic);
        self.subscriber.unsubscribe(topic).await?;

        debug!(topic = %topic, code = params.reason.code, "pairing deleted by peer");
        let _ = self.events.send(ClientEvent::PairingDeleted {
            topic: topic.clone(),
            reason: params.reason,
        });
        Ok(serde_json::Value::Bool(true))
    }
}

#[async_trait]
impl RequestHandler for PairingEngine {
    async fn handle(&self, topic: &Topic, request: Request) -> Result<serde_json::Value> {
        match request.call {
            RequestParams::PairingApprove(params) => self.on_approve(topic, params).await,
            RequestParams::PairingDelete(params) => self.on_delete(topic, params).await,
            _ => Err(PairkitError::UnsupportedMethod),
        }
    }
}
