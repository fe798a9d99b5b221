//! Session handshake state machine.
//!
//! A session layers negotiated blockchain permissions on top of a settled
//! pairing. The proposer mints a fresh session topic and key pair, sends the
//! `session_propose` over the pairing channel, and subscribes to the session
//! topic. The responder surfaces the proposal to the host application; on
//! approval it derives the session key, settles, and answers on the session
//! topic itself with a first-contact `session_approve`. Rejections travel
//! back over the carrying pairing topic, since the session topic never
//! establishes a key.
//!
//! Settled sessions support one extra transition the pairing engine lacks:
//! `update`, a controller-only renegotiation of permissions that keeps the
//! topic and its key.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use pairkit_lib::rpc::{
    DeleteParams, SessionApproveParams, SessionRejectParams, SessionUpdateParams,
};
use pairkit_lib::{
    unix_now, CryptoProvider, PairkitError, Participant, Permissions, Reason,
    RelayProtocolOptions, Request, RequestParams, Result, Sequence, SequenceStore,
    SessionProposal, Topic,
};

use crate::client::{ClientConfig, ClientEvent};
use crate::subscriber::{RequestHandler, Subscriber};

/// Validity window for an unanswered session proposal, in seconds.
pub const PROPOSAL_TTL: u64 = 5 * 60;

/// Lifetime of a settled session, in seconds.
pub const SETTLED_TTL: u64 = 7 * 24 * 60 * 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Proposer side, `session_propose` delivered, awaiting approval.
    Proposed,
    /// Permissions agreed, symmetric key finalized.
    Settled,
}

/// Lifecycle record for one session topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSequence {
    pub topic: Topic,
    /// The pairing channel the proposal travelled over, when known.
    pub pairing_topic: Option<Topic>,
    pub state: SessionState,
    pub self_participant: Participant,
    pub peer: Option<Participant>,
    pub permissions: Permissions,
    pub relay: RelayProtocolOptions,
    pub expiry: u64,
}

impl Sequence for SessionSequence {
    fn topic(&self) -> &Topic {
        &self.topic
    }

    fn is_settled(&self) -> bool {
        self.state == SessionState::Settled
    }

    fn expiry(&self) -> Option<u64> {
        Some(self.expiry)
    }
}

/// Drives session proposal, settlement, update and deletion on both sides.
pub struct SessionEngine {
    crypto: Arc<CryptoProvider>,
    subscriber: Arc<Subscriber>,
    store: Arc<SequenceStore<SessionSequence>>,
    config: Arc<ClientConfig>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl SessionEngine {
    pub fn new(
        crypto: Arc<CryptoProvider>,
        subscriber: Arc<Subscriber>,
        store: Arc<SequenceStore<SessionSequence>>,
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

    /// Register this engine for the session methods it answers.
    pub fn register(self: &Arc<Self>) {
        let handler: Arc<dyn RequestHandler> = self.clone();
        let weak = Arc::downgrade(&handler);
        self.subscriber.register("session_propose", weak.clone());
        self.subscriber.register("session_approve", weak.clone());
        self.subscriber.register("session_reject", weak.clone());
        self.subscriber.register("session_update", weak.clone());
        self.subscriber.register("session_delete", weak);
    }

    /// Propose a session over a settled pairing. Stores the `Proposed`
    /// sequence under a fresh session topic, subscribes to it, and delivers
    /// the proposal over the pairing channel.
    pub async fn propose(&self, pairing_topic: &Topic, permissions: Permissions) -> Result<Topic> {
        permissions.validate()?;

        let keypair = self.crypto.generate_keypair();
        let topic = Topic::generate();
        self.crypto.store_keypair(&topic, keypair.clone());

        let proposer = self.participant(keypair.public_key());
        let expiry = unix_now() + PROPOSAL_TTL;
        let proposal = SessionProposal {
            topic: topic.clone(),
            proposer: proposer.clone(),
            permissions: permissions.clone(),
            relay: self.config.relay.clone(),
            expiry,
        };
        let sequence = SessionSequence {
            topic: topic.clone(),
            pairing_topic: Some(pairing_topic.clone()),
            state: SessionState::Proposed,
            self_participant: proposer,
            peer: None,
            permissions,
            relay: self.config.relay.clone(),
            expiry,
        };
        if let Err(e) = self.store.create(sequence).await {
            self.crypto.remove_topic(&topic);
            return Err(e);
        }
        self.subscriber.subscribe(&topic).await?;

        let request = Request::new(RequestParams::SessionPropose(proposal));
        if let Err(e) = self.subscriber.request(pairing_topic, request).await {
            self.store.delete(&topic).await?;
            self.crypto.remove_topic(&topic);
            self.subscriber.unsubscribe(&topic).await?;
            return Err(e);
        }

        debug!(topic = %topic, pairing = %pairing_topic, "session proposed");
        Ok(topic)
    }

    /// Approve a received session proposal with the permissions this side
    /// grants. The requested permissions must be covered by the grant, and
    /// the proposal's relay protocol must be one this client speaks.
    pub async fn approve(&self, proposal: &SessionProposal, granted: Permissions) -> Result<Topic> {
        proposal.permissions.validate()?;
        granted.validate()?;
        if proposal.relay.protocol != self.config.relay.protocol {
            return Err(PairkitError::UnsupportedProtocol(
                proposal.relay.protocol.clone(),
            ));
        }
        if proposal.expiry <= unix_now() {
            return Err(PairkitError::timeout("session propose", PROPOSAL_TTL * 1000));
        }
        if !proposal.permissions.is_subset_of(&granted) {
            return Err(PairkitError::PermissionsMismatch);
        }
        let topic = proposal.topic.clone();
        if let Ok(existing) = self.store.get(&topic).await {
            return Err(PairkitError::invalid_state(
                &topic.0,
                match existing.state {
                    SessionState::Settled => "session already settled",
                    SessionState::Proposed => "session already proposed locally",
                },
            ));
        }

        let keypair = self.crypto.generate_keypair();
        let key = self
            .crypto
            .derive_symmetric_key(&keypair, &proposal.proposer.public_key);
        self.crypto.store_key(&topic, key);

        let self_participant = self.participant(keypair.public_key());
        let expiry = unix_now() + SETTLED_TTL;
        let sequence = SessionSequence {
            topic: topic.clone(),
            pairing_topic: None,
            state: SessionState::Settled,
            self_participant: self_participant.clone(),
            peer: Some(proposal.proposer.clone()),
            permissions: proposal.permissions.clone(),
            relay: proposal.relay.clone(),
            expiry,
        };
        if let Err(e) = self.store.create(sequence).await {
            self.crypto.remove_topic(&topic);
            return Err(e);
        }
        self.subscriber.subscribe(&topic).await?;

        let request = Request::new(RequestParams::SessionApprove(SessionApproveParams {
            responder: self_participant,
            permissions: proposal.permissions.clone(),
            expiry,
        }));
        if let Err(e) = self
            .subscriber
            .request_with_sender(&topic, request, keypair.public_key())
            .await
        {
            self.store.delete(&topic).await?;
            self.crypto.remove_topic(&topic);
            self.subscriber.unsubscribe(&topic).await?;
            return Err(e);
        }

        debug!(topic = %topic, "session settled as responder");
        Ok(topic)
    }

    /// Reject a received session proposal. Travels over the pairing topic the
    /// proposal arrived on; no sequence is ever stored for the rejected
    /// session topic.
    pub async fn reject(
        &self,
        pairing_topic: &Topic,
        proposal: &SessionProposal,
        reason: Reason,
    ) -> Result<()> {
        let request = Request::new(RequestParams::SessionReject(SessionRejectParams {
            topic: proposal.topic.clone(),
            reason,
        }));
        self.subscriber.notify(pairing_topic, request).await
    }

    /// Renegotiate a settled session's permissions without resetting the
    /// topic or its key. Controller only.
    pub async fn update(&self, topic: &Topic, permissions: Permissions) -> Result<()> {
        permissions.validate()?;
        let session = self.store.get(topic).await?;
        if session.state != SessionState::Settled {
            return Err(PairkitError::invalid_state(&topic.0, "session not settled"));
        }
        if !session.self_participant.controller {
            return Err(PairkitError::Unauthorized(
                "only the controller may update session permissions".into(),
            ));
        }

        let request = Request::new(RequestParams::SessionUpdate(SessionUpdateParams {
            permissions: permissions.clone(),
        }));
        self.subscriber.request(topic, request).await?;
        self.store
            .update(topic, |s| s.permissions = permissions)
            .await?;
        Ok(())
    }

    /// Tear down a session: notify the peer, then drop the sequence and its
    /// key material. Deleting an absent topic is a no-op.
    pub async fn delete(&self, topic: &Topic, reason: Reason) -> Result<()> {
        let removed = self.store.delete(topic).await?;
        if removed {
            let request = Request::new(RequestParams::SessionDelete(DeleteParams { reason }));
            if let Err(e) = self.subscriber.notify(topic, request).await {
                warn!(topic = %topic, error = %e, "session delete notification failed");
            }
        }
        self.crypto.remove_topic(topic);
        self.subscriber.unsubscribe(topic).await
    }

    pub async fn get(&self, topic: &Topic) -> Result<SessionSequence> {
        self.store.get(topic).await
    }

    pub fn contains(&self, topic: &Topic) -> bool {
        self.store.contains(topic)
    }

    pub fn settled(&self) -> Vec<SessionSequence> {
        self.store.settled()
    }

    /// Load persisted sessions and resubscribe the settled ones.
    pub async fn hydrate(&self) -> Result<()> {
        self.store.hydrate().await?;
        for session in self.store.settled() {
            self.subscriber.subscribe(&session.topic).await?;
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

    /// Responder side: a proposal arrived over a pairing channel. Nothing is
    /// stored or auto-approved; the host application decides.
    async fn on_propose(
        &self,
        pairing_topic: &Topic,
        proposal: SessionProposal,
    ) -> Result<serde_json::Value> {
        debug!(topic = %proposal.topic, pairing = %pairing_topic, "inbound session proposal");
        let _ = self.events.send(ClientEvent::SessionProposal {
            pairing_topic: pairing_topic.clone(),
            proposal,
        });
        Ok(serde_json::Value::Bool(true))
    }

    /// Proposer side: the responder settled and answered on the session
    /// topic. Key agreement already happened in the envelope codec.
    async fn on_approve(
        &self,
        topic: &Topic,
        params: SessionApproveParams,
    ) -> Result<serde_json::Value> {
        let session = self.store.get(topic).await?;
        if session.state != SessionState::Proposed {
            return Err(PairkitError::invalid_state(
                &topic.0,
                "session already settled",
            ));
        }
        let settled = self
            .store
            .update(topic, |s| {
                s.state = SessionState::Settled;
                s.peer = Some(params.responder.clone());
                s.permissions = params.permissions.clone();
                s.expiry = params.expiry;
            })
            .await?;

        debug!(topic = %topic, "session settled as proposer");
        let _ = self.events.send(ClientEvent::SessionSettled { session: settled });
        Ok(serde_json::Value::Bool(true))
    }

    /// Proposer side: the peer declined. Arrives on the pairing topic and
    /// names the session topic in its params. Only the pairing the proposal
    /// travelled over may reject it.
    async fn on_reject(
        &self,
        pairing_topic: &Topic,
        params: SessionRejectParams,
    ) -> Result<serde_json::Value> {
        let session = self.store.get(&params.topic).await?;
        if session.state != SessionState::Proposed {
            return Err(PairkitError::invalid_state(
                &params.topic.0,
                "session already settled",
            ));
        }
        if session.pairing_topic.as_ref() != Some(pairing_topic) {
            return Err(PairkitError::Unauthorized(
                "session reject from an unrelated pairing".into(),
            ));
        }
        self.store.delete(&params.topic).await?;
        self.crypto.remove_topic(&params.topic);
        self.subscriber.unsubscribe(&params.topic).await?;

        debug!(topic = %params.topic, code = params.reason.code, "session rejected by peer");
        let _ = self.events.send(ClientEvent::SessionRejected {
            topic: params.topic,
            reason: params.reason,
        });
        Ok(serde_json::Value::Bool(true))
    }

    async fn on_update(
        &self,
        topic: &Topic,
        params: SessionUpdateParams,
    ) -> Result<serde_json::Value> {
        params.permissions.validate()?;
        let session = self.store.get(topic).await?;
        if session.state != SessionState::Settled {
            return Err(PairkitError::invalid_state(&topic.0, "session not settled"));
        }
        if !session.peer.as_ref().is_some_and(|p| p.controller) {
            return Err(PairkitError::Unauthorized(
                "session update from non-controller peer".into(),
            ));
        }
        self.store
            .update(topic, |s| s.permissions = params.permissions.clone())
            .await?;

        debug!(topic = %topic, "session permissions updated by peer");
        let _ = self.events.send(ClientEvent::SessionUpdated {
            topic: topic.clone(),
            permissions: params.permissions,
        });
        Ok(serde_json::Value::Bool(true))
    }

    async fn on_delete(&self, topic: &Topic, params: DeleteParams) -> Result<serde_json::Value> {
        self.store.delete(topic).await?;
        self.crypto.remove_topic(topic);
        self.subscriber.unsubscribe(topic).await?;

        debug!(topic = %topic, code = params.reason.code, "session deleted by peer");
        let _ = self.events.send(ClientEvent::SessionDeleted {
            topic: topic.clone(),
            reason: params.reason,
        });
        Ok(serde_json::Value::Bool(true))
    }
}

#[async_trait]
impl RequestHandler for SessionEngine {
    async fn handle(&self, topic: &Topic, request: Request) -> Result<serde_json::Value> {
        match request.call {
            RequestParams::SessionPropose(proposal) => self.on_propose(topic, proposal).await,
            RequestParams::SessionApprove(params) => self.on_approve(topic, params).await,
            RequestParams::SessionReject(params) => self.on_reject(topic, params).await,
            RequestParams::SessionUpdate(params) => self.on_update(topic, params).await,
            RequestParams::SessionDelete(params) => self.on_delete(topic, params).await,
            _ => Err(PairkitError::UnsupportedMethod),
        }
    }
}
