//! The full layer chain (compressed over encrypted over packs) against an
//! in-memory backend.

use crate::commands;
use crate::config::{build_layer, ENCRYPT_KEY, README_KEY};
use crate::error::BkError;
use crate::hash::Hash;
use crate::report::Report;
use crate::storage::Backend;
use crate::store::compressed::CompressedLayer;
use crate::store::encrypted::{EncryptedLayer, KdfParams};
use crate::store::pack::PackStore;
use crate::store::{IdentityLayer, Layer};
use crate::testutil::MemoryBackend;

const PASSPHRASE: &str = "correct horse battery staple";

fn cheap_params() -> KdfParams {
    KdfParams {
        algorithm: "argon2id".to_string(),
        time_cost: 1,
        memory_cost: 8192,
        parallelism: 1,
        salt: vec![0x42; 16],
    }
}

fn full_chain(passphrase: &str) -> Box<dyn Layer> {
    let encrypted =
        EncryptedLayer::new(Box::new(IdentityLayer), passphrase, &cheap_params()).unwrap();
    Box::new(CompressedLayer::new(Box::new(encrypted)))
}

fn encrypted_store(backend: MemoryBackend) -> PackStore {
    PackStore::open(Box::new(backend), full_chain(PASSPHRASE)).unwrap()
}

#[test]
fn chunk_roundtrip_through_full_chain() {
    let backend = MemoryBackend::shared();
    let mut store = encrypted_store(backend.clone());
    let data = vec![0x61u8; 64 * 1024];
    let hash = store.write(&data).unwrap();
    store.sync().unwrap();

    assert_eq!(store.read(&hash).unwrap(), data);

    // The pack on the backend holds neither the plaintext nor its hash.
    let packs = backend.blob_names();
    assert_eq!(packs.len(), 1);
    let raw = backend.read_blob(&packs[0]).unwrap();
    assert!(!raw
        .windows(data.len().min(256))
        .any(|w| w == &data[..data.len().min(256)]));
}

#[test]
fn dedup_holds_above_encryption() {
    // Random nonces make ciphertexts differ; the plaintext hash must still
    // dedup to a single stored chunk.
    let mut store = encrypted_store(MemoryBackend::shared());
    let h1 = store.write(b"identical plaintext, different nonce").unwrap();
    let h2 = store.write(b"identical plaintext, different nonce").unwrap();
    assert_eq!(h1, h2);
    assert_eq!(store.stats().chunks_stored, 1);
    assert_eq!(store.stats().chunks_deduped, 1);
}

#[test]
fn metadata_is_sealed_on_the_backend() {
    let backend = MemoryBackend::shared();
    let mut store = encrypted_store(backend.clone());
    store
        .put_metadata("backup-x-20260801-120000", b"root goes here")
        .unwrap();

    let raw = backend.read_metadata("backup-x-20260801-120000").unwrap();
    assert_ne!(raw, b"root goes here");
    assert_eq!(
        store.get_metadata("backup-x-20260801-120000").unwrap(),
        b"root goes here"
    );
}

#[test]
fn wrong_passphrase_fails_authentication() {
    let backend = MemoryBackend::shared();
    {
        let mut store = encrypted_store(backend.clone());
        store.write(b"guarded chunk").unwrap();
        store.put_metadata("backup-y-20260801-120000", b"value").unwrap();
        store.sync().unwrap();
    }

    // Opening with the wrong passphrase fails while decoding pack indexes.
    match PackStore::open(Box::new(backend), full_chain("wrong")) {
        Err(BkError::AuthFailed) => {}
        Err(other) => panic!("expected AuthFailed opening store, got {other}"),
        Ok(_) => panic!("store opened with the wrong passphrase"),
    }
}

#[test]
fn tampered_pack_surfaces_auth_failure() {
    let backend = MemoryBackend::shared();
    let mut store = encrypted_store(backend.clone());
    let hash = store.write(b"tamper with me and be detected").unwrap();
    store.sync().unwrap();

    let packs = backend.blob_names();
    assert_eq!(packs.len(), 1);
    // Flip a byte inside the first record's payload (header is 5 bytes,
    // then the record's varint length prefix).
    backend.flip_blob_byte(&packs[0], 8);

    match store.read(&hash) {
        Err(BkError::AuthFailed) => {}
        other => panic!("expected AuthFailed, got {other:?}"),
    }

    let report = Report::new();
    store.fsck(&report).unwrap();
    assert!(report.error_count() >= 1, "fsck must report the bad chunk");
}

#[test]
fn init_writes_markers_and_refuses_reinit() {
    let backend = MemoryBackend::shared();
    commands::init::run(Box::new(backend.clone()), true, Some(PASSPHRASE)).unwrap();

    assert!(backend.metadata_exists(ENCRYPT_KEY).unwrap());
    assert!(backend.metadata_exists(README_KEY).unwrap());
    // The readme travels through the stack; its stored form is sealed.
    let raw = backend.read_metadata(README_KEY).unwrap();
    assert!(!raw.starts_with(b"This directory"));

    let err = commands::init::run(Box::new(backend.clone()), true, Some(PASSPHRASE)).unwrap_err();
    assert!(matches!(err, BkError::User(_)));
}

#[test]
fn init_without_passphrase_is_config_error() {
    let backend = MemoryBackend::shared();
    let err = commands::init::run(Box::new(backend), true, None).unwrap_err();
    assert!(matches!(err, BkError::Config(_)));
}

#[test]
fn reopen_encrypted_repo_via_marker_detection() {
    let backend = MemoryBackend::shared();
    commands::init::run(Box::new(backend.clone()), true, Some(PASSPHRASE)).unwrap();

    let params = KdfParams::from_bytes(&backend.read_metadata(ENCRYPT_KEY).unwrap()).unwrap();
    let hash = {
        let layer = build_layer(&backend, Some(PASSPHRASE)).unwrap();
        let mut store = PackStore::open(Box::new(backend.clone()), layer).unwrap();
        let hash = store.write(b"persisted under the derived key").unwrap();
        store.sync().unwrap();
        hash
    };

    // Same passphrase + persisted salt derive the same key.
    let reopened_layer: Box<dyn Layer> = Box::new(CompressedLayer::new(Box::new(
        EncryptedLayer::new(Box::new(IdentityLayer), PASSPHRASE, &params).unwrap(),
    )));
    let mut store = PackStore::open(Box::new(backend), reopened_layer).unwrap();
    assert_eq!(
        store.read(&hash).unwrap(),
        b"persisted under the derived key"
    );
    assert_eq!(hash, Hash::of(b"persisted under the derived key"));
}
