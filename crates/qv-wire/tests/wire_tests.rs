//! Wire-boundary contract tests: sign/verify and encrypt/decrypt
//! round-trips with tamper detection, and the in-memory transport's
//! acknowledgment semantics.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use qv_common::QuiverError;
use qv_wire::{
    AesGcmEncryptor, HmacSha256Signer, InMemoryTransport, MessageEncryptor, MessageSigner,
    MessageTransport, SubscribeOptions, TransportEnvelope, TransportState, TransportTopology,
};

async fn wait_until(deadline_ms: u64, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    while !done() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Signing
// ============================================================================

#[test]
fn sign_then_verify_round_trips() {
    let signer = HmacSha256Signer::with_key_id(b"a shared secret".to_vec(), "key-1");
    let data = b"payload bytes";

    let signature = signer.sign(data).unwrap();
    assert_eq!(signature.algorithm, "HMAC-SHA256");
    assert_eq!(signature.key_id.as_deref(), Some("key-1"));
    assert!(signer.verify(data, &signature).unwrap());
}

#[test]
fn any_bit_flip_invalidates_the_signature() {
    let signer = HmacSha256Signer::new(b"a shared secret".to_vec());
    let data = b"payload bytes".to_vec();
    let signature = signer.sign(&data).unwrap();

    // Flip one bit of the data
    let mut tampered_data = data.clone();
    tampered_data[0] ^= 0x01;
    assert!(!signer.verify(&tampered_data, &signature).unwrap());

    // Flip one hex digit of the signature
    let mut tampered_sig = signature.clone();
    let mut chars: Vec<char> = tampered_sig.signature.chars().collect();
    chars[0] = if chars[0] == '0' { '1' } else { '0' };
    tampered_sig.signature = chars.into_iter().collect();
    assert!(!signer.verify(&data, &tampered_sig).unwrap());

    // Garbage that is not even hex
    let mut junk = signature.clone();
    junk.signature = "not-hex".into();
    assert!(!signer.verify(&data, &junk).unwrap());
}

#[test]
fn different_secret_never_verifies() {
    let signer = HmacSha256Signer::new(b"secret one".to_vec());
    let other = HmacSha256Signer::new(b"secret two".to_vec());
    let signature = signer.sign(b"data").unwrap();
    assert!(!other.verify(b"data", &signature).unwrap());
}

// ============================================================================
// Encryption
// ============================================================================

#[test]
fn encrypt_then_decrypt_round_trips() {
    let encryptor = AesGcmEncryptor::with_key_id([7u8; 32], "key-9");
    let plaintext = b"order 17 contains 3 widgets";

    let payload = encryptor.encrypt(plaintext).unwrap();
    assert_eq!(payload.algorithm, "AES-256-GCM");
    assert_eq!(payload.key_id.as_deref(), Some("key-9"));
    assert_ne!(payload.ciphertext, plaintext);

    let decrypted = encryptor.decrypt(&payload).unwrap();
    assert_eq!(decrypted, plaintext);
}

#[test]
fn tampered_ciphertext_or_tag_fails_decryption() {
    let encryptor = AesGcmEncryptor::new([7u8; 32]);
    let payload = encryptor.encrypt(b"sensitive").unwrap();

    let mut bad_ciphertext = payload.clone();
    bad_ciphertext.ciphertext[0] ^= 0x01;
    assert!(matches!(
        encryptor.decrypt(&bad_ciphertext),
        Err(QuiverError::DecryptionFailed)
    ));

    let mut bad_tag = payload.clone();
    bad_tag.tag[0] ^= 0x01;
    assert!(matches!(
        encryptor.decrypt(&bad_tag),
        Err(QuiverError::DecryptionFailed)
    ));

    let mut bad_iv = payload;
    bad_iv.iv[0] ^= 0x01;
    assert!(matches!(
        encryptor.decrypt(&bad_iv),
        Err(QuiverError::DecryptionFailed)
    ));
}

#[test]
fn wrong_key_fails_decryption() {
    let encryptor = AesGcmEncryptor::new([7u8; 32]);
    let other = AesGcmEncryptor::new([8u8; 32]);
    let payload = encryptor.encrypt(b"sensitive").unwrap();
    assert!(matches!(
        other.decrypt(&payload),
        Err(QuiverError::DecryptionFailed)
    ));
}

// ============================================================================
// Transport
// ============================================================================

#[tokio::test]
async fn consumer_acknowledges_successful_deliveries() {
    let transport = InMemoryTransport::new();
    transport.connect().await.unwrap();

    let delivered = Arc::new(AtomicU32::new(0));
    let handler = {
        let delivered = delivered.clone();
        Arc::new(move |_envelope: TransportEnvelope| {
            let delivered = delivered.clone();
            Box::pin(async move {
                delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }) as futures::future::BoxFuture<'static, qv_common::Result<()>>
        })
    };

    let consumer = transport
        .subscribe("orders", handler, SubscribeOptions::default())
        .await
        .unwrap();

    for _ in 0..3 {
        transport
            .send(
                "orders",
                TransportEnvelope::new("application/json", Bytes::from_static(b"{}")),
            )
            .await
            .unwrap();
    }

    wait_until(2000, || delivered.load(Ordering::SeqCst) == 3).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 3);
    assert!(transport.dead_letters().is_empty());
    consumer.stop().await;
}

#[tokio::test]
async fn transient_failure_requeues_and_permanent_dead_letters() {
    let transport = InMemoryTransport::new();
    transport.connect().await.unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let handler = {
        let attempts = attempts.clone();
        Arc::new(move |envelope: TransportEnvelope| {
            let attempts = attempts.clone();
            Box::pin(async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                match envelope.routing_key.as_deref() {
                    Some("poison") => Err(QuiverError::handler("unparseable payload")),
                    _ if n == 0 => Err(QuiverError::Transient("broker hiccup".into())),
                    _ => Ok(()),
                }
            }) as futures::future::BoxFuture<'static, qv_common::Result<()>>
        })
    };

    let consumer = transport
        .subscribe("orders", handler, SubscribeOptions { max_in_flight: 1 })
        .await
        .unwrap();

    // First envelope fails transiently once, then succeeds on redelivery
    transport
        .send(
            "orders",
            TransportEnvelope::new("application/json", Bytes::from_static(b"{}")),
        )
        .await
        .unwrap();

    // Poison envelope goes to the dead letters
    let mut poison = TransportEnvelope::new("application/json", Bytes::from_static(b"!"));
    poison.routing_key = Some("poison".into());
    transport.send("orders", poison).await.unwrap();

    wait_until(2000, || transport.dead_letters().len() == 1).await;

    let dead = transport.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].0, "orders");
    assert!(attempts.load(Ordering::SeqCst) >= 3);
    consumer.stop().await;
}

#[tokio::test]
async fn topology_bindings_fan_publishes_out() {
    let transport = InMemoryTransport::new();
    transport.connect().await.unwrap();
    transport
        .configure_topology(TransportTopology {
            queues: vec!["audit".into(), "billing".into()],
            bindings: vec![
                ("order-events".into(), "audit".into()),
                ("order-events".into(), "billing".into()),
            ],
        })
        .await
        .unwrap();

    let delivered = Arc::new(parking_lot::Mutex::new(Vec::new()));
    for queue in ["audit", "billing"] {
        let delivered = delivered.clone();
        let handler = Arc::new(move |envelope: TransportEnvelope| {
            let delivered = delivered.clone();
            let queue = queue.to_string();
            Box::pin(async move {
                delivered.lock().push((queue, envelope.message_id));
                Ok(())
            }) as futures::future::BoxFuture<'static, qv_common::Result<()>>
        });
        transport
            .subscribe(queue, handler, SubscribeOptions::default())
            .await
            .unwrap();
    }

    transport
        .publish(
            "order-events",
            TransportEnvelope::new("application/json", Bytes::from_static(b"{}")),
        )
        .await
        .unwrap();

    wait_until(2000, || delivered.lock().len() == 2).await;
    let seen = delivered.lock();
    assert_eq!(seen.len(), 2);
    // Both queues saw the same logical message
    assert_eq!(seen[0].1, seen[1].1);
}

#[tokio::test]
async fn state_transitions_are_observable() {
    let transport = InMemoryTransport::new();
    assert_eq!(transport.state(), TransportState::Disconnected);

    let watcher = transport.state_changes();
    transport.connect().await.unwrap();
    assert_eq!(transport.state(), TransportState::Connected);
    assert_eq!(*watcher.borrow(), TransportState::Connected);

    // Operations on a disconnected transport are refused
    transport.disconnect().await.unwrap();
    let result = transport
        .send(
            "orders",
            TransportEnvelope::new("application/json", Bytes::from_static(b"{}")),
        )
        .await;
    assert!(matches!(result, Err(QuiverError::Transient(_))));
}
