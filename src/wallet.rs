// src/wallet.rs
// BIP-39 wallet with index-derived Ed25519 keys and Shelley Bech32 addresses.
// The orchestrator only sees the `Signer` capability; everything key-shaped
// stays in here.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bech32::{ToBase32, Variant};
use bip39::{Language, Mnemonic};
use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use ciborium::value::{Integer, Value};
use ed25519_dalek::{Signer as DalekSigner, SigningKey};
use log::info;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde_cbor::to_vec;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::WalletError;

/// One derived address of the wallet window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAddress {
    pub index: u32,
    pub bech32: String,
    /// 32 bytes, 64 hex chars.
    pub pubkey_hex: String,
}

#[derive(Debug, Clone)]
pub struct SignedMessage {
    pub signature_hex: String,
    pub pubkey_hex: String,
}

/// Key derivation and message signing, as consumed by the orchestrator.
pub trait Signer: Send + Sync {
    fn derive_window(&self, offset: u32, width: u32) -> Result<Vec<DerivedAddress>, WalletError>;
    fn sign_message(&self, index: u32, message: &str) -> Result<SignedMessage, WalletError>;
}

/// Turns a start password into an unlocked signer. The orchestrator calls
/// this on every `start` so the wallet never sits decrypted while stopped.
pub trait SignerProvider: Send + Sync {
    fn unlock(&self, password: &str) -> Result<Arc<dyn Signer>, WalletError>;
}

/// File-backed provider over the standard wallet.
pub struct WalletProvider {
    pub seed_path: PathBuf,
    pub use_mainnet: bool,
}

impl SignerProvider for WalletProvider {
    fn unlock(&self, password: &str) -> Result<Arc<dyn Signer>, WalletError> {
        Ok(Arc::new(Wallet::unlock(
            &self.seed_path,
            password,
            self.use_mainnet,
        )?))
    }
}

/// Ed25519 wallet over a BIP-39 master seed.
pub struct Wallet {
    master_seed: [u8; 64],
    use_mainnet: bool,
}

impl Drop for Wallet {
    fn drop(&mut self) {
        self.master_seed.zeroize();
    }
}

impl Wallet {
    /// Loads the mnemonic from `seed_path`, generating and persisting a new
    /// 24-word one on first run. The password is the BIP-39 passphrase; a
    /// fingerprint of the first derived pubkey is stored next to the seed and
    /// checked on later unlocks so a wrong password fails fast instead of
    /// silently deriving a different wallet.
    pub fn unlock(seed_path: &Path, password: &str, use_mainnet: bool) -> Result<Self, WalletError> {
        let phrase = if seed_path.exists() {
            fs::read_to_string(seed_path)?.trim().to_string()
        } else {
            let phrase = generate_mnemonic()?;
            if let Some(parent) = seed_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(seed_path, &phrase)?;
            info!("🔐 Generated new wallet seed at {}", seed_path.display());
            phrase
        };

        let mnemonic = Mnemonic::parse_in_normalized(Language::English, &phrase)
            .map_err(|e| WalletError::Mnemonic(e.to_string()))?;
        let master_seed = mnemonic.to_seed(password);
        let wallet = Self {
            master_seed,
            use_mainnet,
        };

        wallet.check_fingerprint(&fingerprint_path(seed_path))?;
        Ok(wallet)
    }

    /// Derives the key for one index. Deterministic in (seed, index).
    fn signing_key(&self, index: u32) -> SigningKey {
        let mut hasher = Blake2bVar::new(32).expect("32 is a valid Blake2b output size");
        hasher.update(&self.master_seed);
        hasher.update(&index.to_le_bytes());
        let mut key_bytes = [0u8; 32];
        hasher
            .finalize_variable(&mut key_bytes)
            .expect("output buffer matches requested size");
        let key = SigningKey::from_bytes(&key_bytes);
        key_bytes.zeroize();
        key
    }

    pub fn derive(&self, index: u32) -> DerivedAddress {
        let key = self.signing_key(index);
        let pubkey = key.verifying_key().to_bytes();
        DerivedAddress {
            index,
            bech32: derive_bech32_address(&pubkey, self.use_mainnet),
            pubkey_hex: hex::encode(pubkey),
        }
    }

    /// Signs a message as CIP-8 / CIP-30 COSE_Sign1 and returns it hex-encoded.
    pub fn sign_cip30(&self, index: u32, message: &str) -> SignedMessage {
        let key = self.signing_key(index);

        // Protected header (alg = EdDSA → label 1 = -8)
        let protected = to_vec(&Value::Map(vec![(
            Value::Integer(Integer::from(1i64)),
            Value::Integer(Integer::from(-8i64)),
        )]))
        .unwrap();

        let to_sign = to_vec(&Value::Array(vec![
            Value::Text("Signature1".into()),
            Value::Bytes(protected.clone()),
            Value::Bytes(Vec::new()), // external_aad
            Value::Bytes(message.as_bytes().to_vec()),
        ]))
        .unwrap();

        let sig = key.sign(&to_sign);
        let cose = to_vec(&Value::Array(vec![
            Value::Bytes(protected),
            Value::Map(vec![]),
            Value::Bytes(message.as_bytes().to_vec()),
            Value::Bytes(sig.to_bytes().to_vec()),
        ]))
        .unwrap();

        SignedMessage {
            signature_hex: hex::encode(cose),
            pubkey_hex: hex::encode(key.verifying_key().to_bytes()),
        }
    }

    fn check_fingerprint(&self, fp_path: &Path) -> Result<(), WalletError> {
        let derived = fingerprint(&self.derive(0).pubkey_hex);
        if fp_path.exists() {
            let stored = fs::read_to_string(fp_path)?.trim().to_string();
            if stored != derived {
                return Err(WalletError::BadPassword);
            }
        } else {
            fs::write(fp_path, &derived)?;
        }
        Ok(())
    }
}

impl Signer for Wallet {
    fn derive_window(&self, offset: u32, width: u32) -> Result<Vec<DerivedAddress>, WalletError> {
        let start = offset
            .checked_mul(width)
            .ok_or_else(|| WalletError::AddressCorruption("window offset overflows".into()))?;
        Ok((start..start + width).map(|i| self.derive(i)).collect())
    }

    fn sign_message(&self, index: u32, message: &str) -> Result<SignedMessage, WalletError> {
        Ok(self.sign_cip30(index, message))
    }
}

fn fingerprint_path(seed_path: &Path) -> PathBuf {
    seed_path.with_extension("fp")
}

fn fingerprint(pubkey_hex: &str) -> String {
    let mut hasher = Sha256::new();
    sha2::Digest::update(&mut hasher, pubkey_hex.as_bytes());
    hex::encode(hasher.finalize())
}

fn generate_mnemonic() -> Result<String, WalletError> {
    let mut rng = ChaCha20Rng::from_entropy();
    let mut entropy = [0u8; 32];
    rng.fill_bytes(&mut entropy);
    let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy)
        .map_err(|e| WalletError::Mnemonic(e.to_string()))?;
    entropy.zeroize();
    Ok(mnemonic.to_string())
}

/// Shelley base address from a payment pubkey. `use_mainnet` selects the
/// header network bit and the `addr` / `addr_test` prefix.
fn derive_bech32_address(pubkey: &[u8], use_mainnet: bool) -> String {
    // Blake2b-224 (28 bytes) of the pubkey
    let mut hasher = Blake2bVar::new(28).expect("28 is a valid Blake2b output size");
    hasher.update(pubkey);
    let mut key_hash = vec![0u8; 28];
    hasher
        .finalize_variable(&mut key_hash)
        .expect("output buffer matches requested size");

    let header: u8 = if use_mainnet { 0b0110_0001 } else { 0b0110_0000 };
    let mut addr_bytes = Vec::with_capacity(1 + key_hash.len());
    addr_bytes.push(header);
    addr_bytes.extend_from_slice(&key_hash);

    let prefix = if use_mainnet { "addr" } else { "addr_test" };
    bech32::encode(prefix, addr_bytes.to_base32(), Variant::Bech32)
        .expect("bech32 encoding of a 29-byte payload cannot fail")
}
