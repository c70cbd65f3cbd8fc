// src/error.rs
// Error taxonomy for the orchestrator. Everything recoverable is handled
// locally; only configuration, wallet and hash-init failures surface to the
// control caller.

use std::fmt;
use std::path::PathBuf;

/// Invalid tuning values or a broken settings file.
#[derive(Debug)]
pub enum ConfigError {
    InvalidWorkerThreads(u32),
    InvalidBatchSize(u32),
    /// `addressOffset` may only change while the miner is stopped.
    OffsetWhileActive,
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidWorkerThreads(n) => {
                write!(f, "workerThreads must be in 1..=1024, got {}", n)
            }
            ConfigError::InvalidBatchSize(n) => {
                write!(f, "batchSize must be in 50..=50000, got {}", n)
            }
            ConfigError::OffsetWhileActive => {
                write!(f, "addressOffset can only be changed while mining is stopped")
            }
            ConfigError::Io(e) => write!(f, "settings file I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "settings file is not valid JSON: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

/// Wallet loading / derivation failures. All of these abort `Starting`.
#[derive(Debug)]
pub enum WalletError {
    SeedMissing(PathBuf),
    /// Stored fingerprint does not match the derived key: wrong password.
    BadPassword,
    /// Gaps or duplicates in the derived index space; the wallet file needs
    /// an external repair before mining can start.
    AddressCorruption(String),
    Mnemonic(String),
    Io(std::io::Error),
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletError::SeedMissing(p) => write!(f, "no wallet seed at {}", p.display()),
            WalletError::BadPassword => write!(f, "wallet password does not match stored fingerprint"),
            WalletError::AddressCorruption(d) => write!(f, "derived address window is corrupt: {}", d),
            WalletError::Mnemonic(d) => write!(f, "invalid mnemonic: {}", d),
            WalletError::Io(e) => write!(f, "wallet file I/O error: {}", e),
        }
    }
}

impl std::error::Error for WalletError {}

impl From<std::io::Error> for WalletError {
    fn from(e: std::io::Error) -> Self {
        WalletError::Io(e)
    }
}

/// The native ROM could not be constructed. Mining refuses to start but the
/// control surface stays responsive.
#[derive(Debug)]
pub struct HashInitError(pub String);

impl fmt::Display for HashInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hash engine init failed: {}", self.0)
    }
}

impl std::error::Error for HashInitError {}

/// Illegal address state transition. Panic-class: indicates a scheduler bug.
/// The offending worker is reaped and the address reset instead of crashing.
#[derive(Debug)]
pub struct StateViolation {
    pub index: u32,
    pub from: String,
    pub to: String,
}

impl fmt::Display for StateViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "illegal transition for address {}: {} -> {}",
            self.index, self.from, self.to
        )
    }
}

impl std::error::Error for StateViolation {}

/// Remote call failures, split by whether a retry can help.
#[derive(Debug)]
pub enum RemoteError {
    Transient(String),
    Permanent(String),
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Transient(d) => write!(f, "transient remote error: {}", d),
            RemoteError::Permanent(d) => write!(f, "permanent remote error: {}", d),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Failures of the `start` control operation, surfaced to the caller.
#[derive(Debug)]
pub enum StartError {
    AlreadyRunning,
    Wallet(WalletError),
    HashInit(HashInitError),
    Config(ConfigError),
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::AlreadyRunning => write!(f, "miner is already running"),
            StartError::Wallet(e) => write!(f, "{}", e),
            StartError::HashInit(e) => write!(f, "{}", e),
            StartError::Config(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for StartError {}

impl From<WalletError> for StartError {
    fn from(e: WalletError) -> Self {
        StartError::Wallet(e)
    }
}

impl From<HashInitError> for StartError {
    fn from(e: HashInitError) -> Self {
        StartError::HashInit(e)
    }
}

impl From<ConfigError> for StartError {
    fn from(e: ConfigError) -> Self {
        StartError::Config(e)
    }
}
