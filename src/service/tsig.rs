//! TSIG verification wrapper around `domain::tsig`, grounded in the
//! `ServerTransaction`/`ServerSequence::request` call shape from the
//! teacher's `service/middleware/tsig.rs` and the `Key::new` construction
//! from `tsig.rs`.

use std::collections::HashMap;

use base64::Engine;
use domain::base::Message;
use domain::rdata::tsig::Time48;
use domain::tsig::{Algorithm, Key, KeyName, ServerSequence, ServerTransaction};

use crate::client::ClientRegistry;
use crate::error::Error;

pub type KeyStore = HashMap<KeyName, Key>;

/// Builds the TSIG keystore from the configured clients: each client's name
/// is its TSIG key name, and its (base64) secret is decoded into HMAC-SHA256
/// key bytes (spec.md §3's Client data model, §6.1's "algorithm
/// HMAC-SHA256" requirement).
pub fn build_keystore(registry: &ClientRegistry) -> Result<KeyStore, Error> {
    let mut store = HashMap::new();
    for client in registry.iter() {
        let secret = base64::engine::general_purpose::STANDARD
            .decode(&client.secret)
            .map_err(|e| Error::config(format!("client {:?} secret is not valid base64: {e}", client.name)))?;
        let name: KeyName = client
            .name
            .parse()
            .map_err(|e| Error::config(format!("client {:?} is not a valid TSIG key name: {e}", client.name)))?;
        let key = Key::new(Algorithm::Sha256, &secret, name.clone(), None, None)
            .map_err(|e| Error::config(format!("client {:?}: invalid TSIG key: {e}", client.name)))?;
        store.insert(name, key);
    }
    Ok(store)
}

/// The outcome of verifying a non-AXFR request's TSIG record.
pub enum Verified {
    /// No TSIG record was present.
    Absent,
    /// TSIG verified; signs the reply through to completion.
    Ok(ServerTransaction<Key>),
}

/// The outcome of verifying a streamed (AXFR) request's TSIG record.
pub enum VerifiedStream {
    Absent,
    Ok(ServerSequence<Key>),
}

/// Verifies `message`'s TSIG record, if any, against `keystore`.
pub fn verify(keystore: &KeyStore, message: &mut Message<Vec<u8>>) -> Result<Verified, Error> {
    match ServerTransaction::request::<KeyStore, Vec<u8>>(keystore, message, Time48::now()) {
        Ok(None) => Ok(Verified::Absent),
        Ok(Some(tx)) => Ok(Verified::Ok(tx)),
        Err(e) => Err(Error::auth(format!("tsig verification failed: {e}"))),
    }
}

/// As [`verify`], for the streamed (AXFR) request path.
pub fn verify_stream(keystore: &KeyStore, message: &mut Message<Vec<u8>>) -> Result<VerifiedStream, Error> {
    match ServerSequence::request::<KeyStore, Vec<u8>>(keystore, message, Time48::now()) {
        Ok(None) => Ok(VerifiedStream::Absent),
        Ok(Some(seq)) => Ok(VerifiedStream::Ok(seq)),
        Err(e) => Err(Error::auth(format!("tsig verification failed: {e}"))),
    }
}
