//! Topic subscriber and JSON-RPC dispatcher.
//!
//! One reader task per subscribed topic decodes inbound frames through the
//! envelope codec and routes them: requests go to the handler registered for
//! their method (the handler's result is published back as the response),
//! responses complete the pending request with the matching id. Frames that
//! fail to decode are logged and dropped, never propagated as a crash.
//!
//! Per-topic delivery order is preserved because each topic has exactly one
//! sequential reader; nothing is guaranteed across topics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use pairkit_lib::rpc::{code, code_for};
use pairkit_lib::{
    EnvelopeCodec, PairkitError, Payload, PublicKey, RelayTransport, Request, RequestId,
    RequestParams, Response, Result, Topic,
};

/// How long an outbound request waits for its correlated response.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Handles inbound requests for the methods it was registered under. The
/// returned value (or error) is published back as the JSON-RPC response.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, topic: &Topic, request: Request) -> Result<serde_json::Value>;
}

struct Registry {
    handlers: HashMap<String, Weak<dyn RequestHandler>>,
    pending: HashMap<RequestId, oneshot::Sender<Response>>,
    readers: HashMap<Topic, JoinHandle<()>>,
}

pub struct Subscriber {
    relay: Arc<dyn RelayTransport>,
    codec: Arc<EnvelopeCodec>,
    registry: Mutex<Registry>,
}

impl Subscriber {
    pub fn new(relay: Arc<dyn RelayTransport>, codec: Arc<EnvelopeCodec>) -> Self {
        Self {
            relay,
            codec,
            registry: Mutex::new(Registry {
                handlers: HashMap::new(),
                pending: HashMap::new(),
                readers: HashMap::new(),
            }),
        }
    }

    /// Associate a method name with a handler. Handlers are held weakly so a
    /// dropped engine effectively unregisters itself.
    pub fn register(&self, method: impl Into<String>, handler: Weak<dyn RequestHandler>) {
        self.registry
            .lock()
            .expect("subscriber registry lock")
            .handlers
            .insert(method.into(), handler);
    }

    /// Subscribe to a topic and start its reader task. Subscribing twice to
    /// the same topic is a no-op.
    pub async fn subscribe(self: &Arc<Self>, topic: &Topic) -> Result<()> {
        if self
            .registry
            .lock()
            .expect("subscriber registry lock")
            .readers
            .contains_key(topic)
        {
            return Ok(());
        }
        let mut frames = self.relay.subscribe(topic).await?;
        let this = Arc::clone(self);
        let reader_topic = topic.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                this.dispatch(&reader_topic, &frame).await;
            }
            debug!(topic = %reader_topic, "frame channel closed, reader exiting");
        });
        self.registry
            .lock()
            .expect("subscriber registry lock")
            .readers
            .insert(topic.clone(), reader);
        Ok(())
    }

    /// Stop delivery for a topic. The reader exits when the relay closes the
    /// frame channel, so a handler running on that very reader can finish.
    pub async fn unsubscribe(&self, topic: &Topic) -> Result<()> {
        self.registry
            .lock()
            .expect("subscriber registry lock")
            .readers
            .remove(topic);
        self.relay.unsubscribe(topic).await
    }

    pub fn is_subscribed(&self, topic: &Topic) -> bool {
        self.registry
            .lock()
            .expect("subscriber registry lock")
            .readers
            .contains_key(topic)
    }

    /// Publish a request and await the correlated response under
    /// [`RESPONSE_TIMEOUT`].
    pub async fn request(&self, topic: &Topic, request: Request) -> Result<serde_json::Value> {
        let frame = self
            .codec
            .serialize(&Payload::Request(request.clone()), topic)?;
        self.send_and_await(topic, request, frame).await
    }

    /// First-contact variant: the sender's agreement key rides inside the
    /// envelope so the peer can derive the topic key before verifying.
    pub async fn request_with_sender(
        &self,
        topic: &Topic,
        request: Request,
        sender: PublicKey,
    ) -> Result<serde_json::Value> {
        let frame =
            self.codec
                .serialize_with_sender(&Payload::Request(request.clone()), topic, sender)?;
        self.send_and_await(topic, request, frame).await
    }

    /// Publish a request without awaiting its response (delete/reject
    /// notifications where either peer may already be gone).
    pub async fn notify(&self, topic: &Topic, request: Request) -> Result<()> {
        let frame = self.codec.serialize(&Payload::Request(request), topic)?;
        self.relay.publish(topic, frame).await
    }

    /// Abort every reader and unsubscribe every topic.
    pub async fn shutdown(&self) {
        let readers: Vec<(Topic, JoinHandle<()>)> = {
            let mut registry = self.registry.lock().expect("subscriber registry lock");
            registry.pending.clear();
            registry.readers.drain().collect()
        };
        for (topic, reader) in readers {
            reader.abort();
            if let Err(e) = self.relay.unsubscribe(&topic).await {
                warn!(topic = %topic, error = %e, "unsubscribe failed during shutdown");
            }
        }
    }

    async fn send_and_await(
        &self,
        topic: &Topic,
        request: Request,
        frame: Vec<u8>,
    ) -> Result<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        self.registry
            .lock()
            .expect("subscriber registry lock")
            .pending
            .insert(request.id, tx);

        if let Err(e) = self.relay.publish(topic, frame).await {
            self.forget_pending(request.id);
            return Err(e);
        }

        match tokio::time::timeout(RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => {
                // pending map cleared underneath us (shutdown)
                Err(PairkitError::Relay("dispatcher shut down".into()))
            }
            Err(_) => {
                self.forget_pending(request.id);
                Err(PairkitError::timeout(
                    request.call.method(),
                    RESPONSE_TIMEOUT.as_millis() as u64,
                ))
            }
        }
    }

    fn forget_pending(&self, id: RequestId) {
        self.registry
            .lock()
            .expect("subscriber registry lock")
            .pending
            .remove(&id);
    }

    async fn dispatch(&self, topic: &Topic, frame: &[u8]) {
        let payload = match self.codec.deserialize(frame, topic) {
            Ok(payload) => payload,
            // Frame-local failures (bad MAC, garbage bytes) are expected
            // noise on an open topic; anything else points at this client.
            Err(e) if e.is_frame_local() => {
                warn!(topic = %topic, error = %e, "dropping undecodable frame");
                return;
            }
            Err(e) => {
                error!(topic = %topic, error = %e, "frame dispatch failed");
                return;
            }
        };
        debug!(topic = %topic, id = payload.id(), "inbound frame");

        match payload {
            Payload::Request(request) => self.dispatch_request(topic, request).await,
            Payload::Response(response) => self.dispatch_response(topic, response),
        }
    }

    async fn dispatch_request(&self, topic: &Topic, request: Request) {
        let id = request.id;
        let method = request.call.method();
        debug!(topic = %topic, method, id, "inbound request");

        let handler = match request.call {
            RequestParams::Unsupported => None,
            _ => self
                .registry
                .lock()
                .expect("subscriber registry lock")
                .handlers
                .get(method)
                .and_then(Weak::upgrade),
        };

        let response = match handler {
            Some(handler) => match handler.handle(topic, request).await {
                Ok(value) => Response::ok(id, value),
                Err(e) => {
                    debug!(topic = %topic, method, error = %e, "handler rejected request");
                    Response::err(id, code_for(&e), e.to_string())
                }
            },
            None => Response::err(id, code::UNSUPPORTED_METHOD, "unsupported method"),
        };

        match self.codec.serialize(&Payload::Response(response), topic) {
            Ok(frame) => {
                if let Err(e) = self.relay.publish(topic, frame).await {
                    warn!(topic = %topic, method, error = %e, "failed to publish response");
                }
            }
            Err(e) => warn!(topic = %topic, method, error = %e, "failed to encode response"),
        }
    }

    fn dispatch_response(&self, topic: &Topic, response: Response) {
        let pending = self
            .registry
            .lock()
            .expect("subscriber registry lock")
            .pending
            .remove(&response.id);
        match pending {
            Some(tx) => {
                // receiver gone means the requester timed out already
                let _ = tx.send(response);
            }
            None => {
                warn!(topic = %topic, id = response.id, "dropping response with no pending request");
            }
        }
    }
}
