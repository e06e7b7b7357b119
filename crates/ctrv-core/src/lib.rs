pub mod config;
pub mod error;
pub mod types;

pub use error::{CtrvError, CtrvResult, SequenceError};
pub use types::{EncryptionMode, ProviderType};
