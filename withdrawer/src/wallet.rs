use crate::errors::WithdrawError;
use async_trait::async_trait;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// Offset added to the recovery id in Ethereum `personal_sign` signatures.
const RECOVERY_ID_OFFSET: u8 = 27;
const SIGNATURE_LEN: usize = 65;

/// Signs withdrawal messages on behalf of the connected account.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WalletSigner: Send + Sync {
    /// Checksummed address of the account.
    fn address(&self) -> String;

    /// Returns the 0x-prefixed 65 byte signature over `message`.
    async fn sign_message(&self, message: &str) -> Result<String, WithdrawError>;
}

/// Hash signed by `personal_sign` (EIP-191 version 0x45).
pub fn personal_message_hash(message: &str) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message.as_bytes());
    hasher.finalize().into()
}

pub fn address_bytes(key: &VerifyingKey) -> [u8; 20] {
    let point = key.to_encoded_point(false);
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    address
}

/// EIP-55 mixed-case encoding.
pub fn checksum_address(address: &[u8; 20]) -> String {
    let lower = hex::encode(address);
    let hash = Keccak256::digest(lower.as_bytes());
    let mut encoded = String::with_capacity(42);
    encoded.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = if i % 2 == 0 { hash[i / 2] >> 4 } else { hash[i / 2] & 0x0f };
        if nibble >= 8 {
            encoded.push(c.to_ascii_uppercase());
        } else {
            encoded.push(c);
        }
    }
    encoded
}

/// Recovers the checksummed address that produced `signature` over `message`.
pub fn recover_signer(message: &str, signature: &str) -> Result<String, WithdrawError> {
    let bytes = hex::decode(signature.trim_start_matches("0x"))
        .map_err(|err| WithdrawError::Wallet(format!("signature is not hex: {err}")))?;
    if bytes.len() != SIGNATURE_LEN {
        return Err(WithdrawError::Wallet(format!(
            "signature has {} bytes, expected {SIGNATURE_LEN}",
            bytes.len()
        )));
    }
    let signature = Signature::from_slice(&bytes[..64])
        .map_err(|err| WithdrawError::Wallet(err.to_string()))?;
    let recovery_id = bytes[64]
        .checked_sub(RECOVERY_ID_OFFSET)
        .and_then(RecoveryId::from_byte)
        .ok_or_else(|| WithdrawError::Wallet(format!("invalid recovery byte {}", bytes[64])))?;
    let key = VerifyingKey::recover_from_prehash(
        &personal_message_hash(message),
        &signature,
        recovery_id,
    )
    .map_err(|err| WithdrawError::Wallet(err.to_string()))?;
    Ok(checksum_address(&address_bytes(&key)))
}

/// A wallet backed by a secp256k1 key held in memory.
pub struct LocalKeySigner {
    signing_key: SigningKey,
    address: String,
}

impl LocalKeySigner {
    pub fn new(signing_key: SigningKey) -> Self {
        let address = checksum_address(&address_bytes(signing_key.verifying_key()));
        LocalKeySigner {
            signing_key,
            address,
        }
    }

    /// Parses a hex encoded 32 byte private key, with or without `0x`.
    pub fn from_hex(private_key: &str) -> Result<Self, WithdrawError> {
        let bytes = hex::decode(private_key.trim().trim_start_matches("0x"))
            .map_err(|_| WithdrawError::Wallet("private key is not valid hex".to_string()))?;
        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|_| WithdrawError::Wallet("private key is not a valid secp256k1 scalar".to_string()))?;
        Ok(Self::new(signing_key))
    }
}

impl std::fmt::Debug for LocalKeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeySigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl WalletSigner for LocalKeySigner {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn sign_message(&self, message: &str) -> Result<String, WithdrawError> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(&personal_message_hash(message))
            .map_err(|err| WithdrawError::Wallet(err.to_string()))?;
        let mut bytes = Vec::with_capacity(SIGNATURE_LEN);
        bytes.extend_from_slice(&signature.to_bytes());
        bytes.push(recovery_id.to_byte() + RECOVERY_ID_OFFSET);
        Ok(format!("0x{}", hex::encode(bytes)))
    }
}

/// An account known only by its address. Usable for discovery, never signs.
#[derive(Debug, Clone)]
pub struct WatchOnlyWallet {
    address: String,
}

impl WatchOnlyWallet {
    pub fn new(address: impl Into<String>) -> Self {
        WatchOnlyWallet {
            address: address.into(),
        }
    }
}

#[async_trait]
impl WalletSigner for WatchOnlyWallet {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn sign_message(&self, _message: &str) -> Result<String, WithdrawError> {
        Err(WithdrawError::Wallet(format!(
            "{} is watch-only; configure a private key to sign",
            self.address
        )))
    }
}

/// Asks for approval before delegating to the inner signer. A refusal is
/// reported as [`WithdrawError::WalletRejected`].
pub struct ConfirmingSigner<S> {
    inner: S,
    approve: Arc<dyn Fn(&str) -> bool + Send + Sync>,
}

impl<S: WalletSigner> ConfirmingSigner<S> {
    pub fn new(inner: S, approve: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        ConfirmingSigner {
            inner,
            approve: Arc::new(approve),
        }
    }
}

#[async_trait]
impl<S: WalletSigner> WalletSigner for ConfirmingSigner<S> {
    fn address(&self) -> String {
        self.inner.address()
    }

    async fn sign_message(&self, message: &str) -> Result<String, WithdrawError> {
        let approve = self.approve.clone();
        let prompt = message.to_string();
        let approved = tokio::task::spawn_blocking(move || approve(&prompt))
            .await
            .map_err(|err| WithdrawError::Wallet(format!("approval prompt failed: {err}")))?;
        if !approved {
            tracing::info!(address = %self.inner.address(), "signature request declined");
            return Err(WithdrawError::WalletRejected);
        }
        self.inner.sign_message(message).await
    }
}
