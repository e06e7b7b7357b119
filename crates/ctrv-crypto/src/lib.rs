//! ctrv-crypto: AES-256-CTR encryption with chunked HMAC-SHA256 integrity
//!
//! Counter layout (16 bytes):
//! ```text
//! [ nonce (L bytes, never mutated) | big-endian block index (16 - L bytes) ]
//! ```
//!
//! Stream layout:
//! ```text
//! [ header (16) ][ hmac (32) | chunk ciphertext (<= chunk_size) ] ...
//! ```
//! The first chunk's HMAC covers `header ++ chunk`. With integrity disabled
//! the body is raw ciphertext.

pub mod header;
pub mod integrity;
pub mod keys;
pub mod nonce;
pub mod provider;
pub mod stream;
pub mod transform;

pub use header::{StreamHeader, HEADER_LENGTH};
pub use integrity::{HashProvider, HmacSha256Provider, Integrity};
pub use keys::{generate_drive_key, DriveKey};
pub use nonce::{compare_nonce, increase_nonce, nonce_from_u64, nonce_to_u64, split_nonce_range};
pub use provider::{create_provider, AcceleratedProvider, BlockCipherProvider, PortableProvider};
pub use stream::AesStream;
pub use transform::CtrTransformer;
