use crate::config::SignerKey;
use crate::error::{GovError, Result};
use alloy::network::EthereumWallet;
use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use tracing::info;
use zeroize::Zeroize;

/// Wallet for signing governor execution transactions
///
/// # Security
/// The private key is only used during wallet creation; the working copy is
/// zeroized immediately afterwards and never stored on this struct.
#[derive(Clone)]
pub struct Wallet {
    signer: PrivateKeySigner,
}

impl Wallet {
    /// Create a wallet from a private key hex string (with or without `0x`)
    pub fn from_private_key(private_key: &str) -> Result<Self> {
        let mut secure_key = private_key
            .trim()
            .trim_start_matches("0x")
            .trim_start_matches("0X")
            .to_string();

        let parsed = secure_key.parse::<PrivateKeySigner>();

        // Zeroize the key from memory
        secure_key.zeroize();

        let signer =
            parsed.map_err(|e| GovError::Wallet(format!("Invalid private key: {}", e)))?;

        info!("Wallet initialized: {}", signer.address());

        Ok(Self { signer })
    }

    /// Create a wallet from the configured signer key
    pub fn from_signer_key(key: &SignerKey) -> Result<Self> {
        if key.is_empty() {
            return Err(GovError::Wallet("ledger.signer_key is not set".to_string()));
        }
        Self::from_private_key(key.expose())
    }

    /// Get the wallet address
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Transaction-signing wallet for an alloy provider
    pub fn ethereum_wallet(&self) -> EthereumWallet {
        EthereumWallet::from(self.signer.clone())
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address())
            .finish()
    }
}
