pub mod keys;
pub mod time;
pub mod token;
pub mod vault;

pub use keys::{GeneratedKeypair, KeyError, generate_ed25519_keypair};
pub use time::now_ms;
pub use token::{TokenClaims, TokenCodec, TokenError};
pub use vault::{MIN_SECRET_BYTES, Vault, VaultError};
