//! IAP assertion verification: public keys, audiences, and the verifier.

pub mod audience;
pub mod key_store;
pub mod verifier;

pub use audience::{Audience, AudienceError, AudienceKind, AudiencePolicy};
pub use key_store::{
    FileKeySource, KeySet, KeySource, KeyStore, KeyStoreError, PublicKey, RefreshOutcome,
    StaticKeySource, UrlKeySource, decode_public_keys,
};
pub use verifier::{AuthError, Claims, IAP_ALGORITHM, IAP_ISSUER, Identity, Verifier};
