use crate::error::{ParleyError, Result};
use ethers::signers::{LocalWallet, Signer as EthersSigner};
use ethers::types::{Address, Signature};
use tracing::info;
use zeroize::Zeroize;

/// Wallet an agent uses to sign authentication challenges
///
/// # Security
/// The private key is only used during wallet creation and then immediately
/// zeroized. It is never stored in this struct, so a memory dump after
/// initialization does not expose it.
#[derive(Clone)]
pub struct Wallet {
    inner: LocalWallet,
}

impl Wallet {
    /// Create a wallet from a private key hex string
    pub fn from_private_key(private_key: &str) -> Result<Self> {
        // Remove 0x prefix if present
        let key_hex = private_key.trim_start_matches("0x");

        let mut secure_key = key_hex.to_string();

        let wallet = secure_key
            .parse::<LocalWallet>()
            .map_err(|e| ParleyError::Wallet(format!("Invalid private key: {}", e)))?;

        // Zeroize the key from memory
        secure_key.zeroize();

        info!("Wallet initialized: {:?}", wallet.address());

        Ok(Self { inner: wallet })
    }

    /// Create a wallet from the PARLEY_PRIVATE_KEY / PRIVATE_KEY environment variable
    pub fn from_env() -> Result<Self> {
        let mut private_key = std::env::var("PARLEY_PRIVATE_KEY")
            .or_else(|_| std::env::var("PRIVATE_KEY"))
            .map_err(|_| {
                ParleyError::Wallet(
                    "PARLEY_PRIVATE_KEY or PRIVATE_KEY environment variable not set".to_string(),
                )
            })?;

        let result = Self::from_private_key(&private_key);

        private_key.zeroize();

        result
    }

    /// Generate a throwaway wallet with a random key
    pub fn random() -> Self {
        Self {
            inner: LocalWallet::new(&mut rand::thread_rng()),
        }
    }

    /// Get the wallet address
    pub fn address(&self) -> Address {
        self.inner.address()
    }

    /// Get the wallet address as a 0x-prefixed lowercase hex string
    pub fn address_hex(&self) -> String {
        format!("{:?}", self.inner.address())
    }

    /// Sign a message (will be prefixed with the Ethereum signed-message header)
    pub async fn sign_message<S: AsRef<[u8]> + Send + Sync>(&self, message: S) -> Result<Signature> {
        self.inner
            .sign_message(message)
            .await
            .map_err(|e| ParleyError::Signature(format!("Failed to sign message: {}", e)))
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wallet_creation() {
        // Test private key (DO NOT use in production!)
        let test_key = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

        let wallet = Wallet::from_private_key(test_key).unwrap();

        // This is the well-known address for this test key
        assert_eq!(
            wallet.address_hex(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }

    #[test]
    fn test_random_wallets_differ() {
        let a = Wallet::random();
        let b = Wallet::random();
        assert_ne!(a.address(), b.address());
    }
}
