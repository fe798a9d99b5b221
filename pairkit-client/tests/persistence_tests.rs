//! Sequence persistence: a client rebuilt over the same hooks sees its
//! settled state again after hydration.


use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mock_relay::RelayHub;

use pairkit_client::{
    AppMetadata, Client, ClientConfig, ConnectParams, PairingSequence, Permissions, Reason,
    RelayProtocolOptions, Result, SequenceHook, SessionSequence, Topic,
};

/// Hook backed by a shared in-memory map, standing in for durable storage.
struct MemoryHook<S> {
    entries: Arc<Mutex<HashMap<Topic, S>>>,
}

impl<S> MemoryHook<S> {
    fn new() -> (Arc<Self>, Arc<Mutex<HashMap<Topic, S>>>) {
        let entries = Arc::new(Mutex::new(HashMap::new()));
        (
            Arc::new(Self {
                entries: entries.clone(),
            }),
            entries,
        )
    }

    fn reopen(entries: Arc<Mutex<HashMap<Topic, S>>>) -> Arc<Self> {
        Arc::new(Self { entries })
    }
}

#[async_trait]
impl<S: pairkit_lib::Sequence> SequenceHook<S> for MemoryHook<S> {
    async fn load_all(&self) -> Result<Vec<S>> {
        Ok(self.entries.lock().unwrap().values().cloned().collect())
    }

    async fn save(&self, sequence: &S) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(sequence.topic().clone(), sequence.clone());
        Ok(())
    }

    async fn remove(&self, topic: &Topic) -> Result<()> {
        self.entries.lock().unwrap().remove(topic);
        Ok(())
    }
}

fn config(name: &str, controller: bool) -> ClientConfig {
    ClientConfig {
        metadata: AppMetadata {
            name: Some(name.into()),
            ..Default::default()
        },
        controller,
        relay: RelayProtocolOptions::new("waku"),
    }
}

#[tokio::test]
async fn settled_pairing_survives_restart() {
    let hub = RelayHub::new();
    let (pairing_hook, pairing_entries) = MemoryHook::<PairingSequence>::new();
    let (session_hook, _session_entries) = MemoryHook::<SessionSequence>::new();

    let (dapp, _dapp_events) = Client::new(config("dapp", false), hub.endpoint());
    let (wallet, _wallet_events) = Client::with_hooks(
        config("wallet", true),
        hub.endpoint(),
        Some(pairing_hook),
        Some(session_hook),
    );

    let uri = dapp
        .connect(ConnectParams {
            pairing_topic: None,
            permissions: Permissions::new(["eip155:1"]),
        })
        .await
        .unwrap()
        .unwrap();
    let topic = wallet.pair(&uri).await.unwrap();
    assert_eq!(pairing_entries.lock().unwrap().len(), 1);

    // simulate a restart: fresh client over the same persisted entries
    wallet.shutdown().await;
    drop(wallet);

    let (reopened_pairing_hook, session_hook) = (
        MemoryHook::reopen(pairing_entries),
        MemoryHook::<SessionSequence>::new().0,
    );
    let (wallet, _wallet_events) = Client::with_hooks(
        config("wallet", true),
        hub.endpoint(),
        Some(reopened_pairing_hook),
        Some(session_hook),
    );
    assert!(wallet.settled_pairings().is_empty());

    wallet.hydrate().await.unwrap();
    let restored = wallet.settled_pairings();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].topic, topic);
}

#[tokio::test]
async fn deleted_pairing_leaves_no_persisted_entry() {
    let hub = RelayHub::new();
    let (pairing_hook, pairing_entries) = MemoryHook::<PairingSequence>::new();
    let (session_hook, _session_entries) = MemoryHook::<SessionSequence>::new();

    let (dapp, _dapp_events) = Client::new(config("dapp", false), hub.endpoint());
    let (wallet, _wallet_events) = Client::with_hooks(
        config("wallet", true),
        hub.endpoint(),
        Some(pairing_hook),
        Some(session_hook),
    );

    let uri = dapp
        .connect(ConnectParams {
            pairing_topic: None,
            permissions: Permissions::new(["eip155:1"]),
        })
        .await
        .unwrap()
        .unwrap();
    let topic = wallet.pair(&uri).await.unwrap();

    wallet.disconnect(&topic, Reason::disconnected()).await.unwrap();
    assert!(pairing_entries.lock().unwrap().is_empty());
}
