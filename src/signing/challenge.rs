//! Canonical authentication challenge
//!
//! Both sides of the handshake reconstruct the exact same string, so the
//! signature binds the claimed address and token id to a timestamp without
//! any server-side nonce storage.

use crate::error::{ParleyError, Result};
use crate::signing::Wallet;
use ethers::types::{Address, Signature};

/// First line of every challenge. Changing this breaks all deployed agents.
pub const AUTH_MESSAGE_HEADER: &str = "A2A Authentication";

/// Build the canonical challenge string for a handshake attempt.
///
/// `timestamp` is unix milliseconds as produced by the signing client.
pub fn build_challenge(address: &str, token_id: &str, timestamp: i64) -> String {
    format!(
        "{}\n\nAddress: {}\nToken ID: {}\nTimestamp: {}",
        AUTH_MESSAGE_HEADER, address, token_id, timestamp
    )
}

/// Sign the challenge for the given claim with an EIP-191 personal signature.
///
/// Returns the 65-byte signature as a 0x-prefixed hex string, the format the
/// server's recovery path expects.
pub async fn sign_challenge(wallet: &Wallet, token_id: &str, timestamp: i64) -> Result<String> {
    let challenge = build_challenge(&wallet.address_hex(), token_id, timestamp);
    let signature = wallet.sign_message(challenge).await?;
    Ok(format!("0x{}", hex::encode(signature.to_vec())))
}

/// Recover the address that signed the challenge.
pub fn recover_signer(
    signature: &str,
    address: &str,
    token_id: &str,
    timestamp: i64,
) -> Result<Address> {
    let signature: Signature = signature
        .trim_start_matches("0x")
        .parse()
        .map_err(|e| ParleyError::Signature(format!("Malformed signature: {}", e)))?;

    let challenge = build_challenge(address, token_id, timestamp);

    signature
        .recover(challenge.as_str())
        .map_err(|e| ParleyError::Signature(format!("Recovery failed: {}", e)))
}
