//! Secrets at rest, webhook signatures, and signed tokens.

mod encryptor;
pub mod signature;
mod token;

pub use encryptor::{AesGcmEncryptor, CryptoError, Encryptor, NoOpEncryptor};
pub use token::{Claims, JwtSigner, default_token_ttl};
