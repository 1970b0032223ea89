//! Shared helpers for unit tests

use std::sync::Arc;
use veil_crypto::RouterIdentity;
use veil_netdb::{PeerCaps, PeerRecord, PeerStore, SharedRecord};

/// A fresh identity with a signed record in its own /16
pub fn peer(i: usize) -> (RouterIdentity, SharedRecord) {
    veil_crypto::init().unwrap();
    let identity = RouterIdentity::generate();
    let record = PeerRecord::new_signed(
        &identity,
        vec![format!("10.{}.0.1:4000", i).parse().unwrap()],
        PeerCaps::REACHABLE,
    );
    (identity, Arc::new(record))
}

/// Store populated with `count` peers, returning their identities
pub fn populated_store(count: usize) -> (Arc<PeerStore>, Vec<RouterIdentity>) {
    let store = Arc::new(PeerStore::new());
    let identities = (0..count)
        .map(|i| {
            let (identity, record) = peer(i);
            store.insert(PeerRecord::clone(&record)).unwrap();
            identity
        })
        .collect();
    (store, identities)
}
