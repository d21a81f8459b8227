//! Wire-boundary collaborators: serialization, message security,
//! authorization, and broker transport interfaces.
//!
//! The core consumes these through capability traits; the implementations
//! here are reference collaborators (JSON serialization, AES-256-GCM
//! encryption, HMAC-SHA256 signing, an in-memory transport) that the
//! contract tests exercise.

pub mod auth;
pub mod crypto;
pub mod serializer;
pub mod transport;

pub use auth::{
    AuthorizationProvider, AuthorizationResult, MessageOperation, Principal,
    RequirementAuthorizationProvider,
};
pub use crypto::{
    AesGcmEncryptor, EncryptedPayload, HmacSha256Signer, MessageEncryptor, MessageSigner,
    Signature,
};
pub use serializer::{JsonSerializer, MessageSerializer, SerializerConfig};
pub use transport::{
    InMemoryTransport, MessageTransport, SubscribeOptions, TransportConsumer, TransportEnvelope,
    TransportHandler, TransportState, TransportTopology,
};
