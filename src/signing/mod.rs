pub mod challenge;
pub mod wallet;

pub use challenge::{build_challenge, recover_signer, sign_challenge, AUTH_MESSAGE_HEADER};
pub use wallet::Wallet;
