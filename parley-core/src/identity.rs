//! Identity and crypto: long-term keypair, nospam, shareable address, key derivation, wire encryption.

use std::fmt;
use std::str::FromStr;

use chacha20poly1305::aead::{Aead, KeyInit};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Public key size in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;
/// Nospam size in bytes.
pub const NOSPAM_SIZE: usize = 4;
/// Checksum size in bytes.
pub const CHECKSUM_SIZE: usize = 2;
/// Address size: public key + nospam + checksum.
pub const ADDRESS_SIZE: usize = PUBLIC_KEY_SIZE + NOSPAM_SIZE + CHECKSUM_SIZE;

/// Domain label for keys derived from the long-term static DH (requests, handshakes).
pub const STATIC_KEY_LABEL: &[u8] = b"parley-static-v1";
/// Domain label for keys derived from the ephemeral DH (session traffic).
pub const SESSION_KEY_LABEL: &[u8] = b"parley-session-v1";

/// Long-term public key (32 bytes, X25519). Identifies a friend.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; 32]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a `PublicKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    /// Parse a 64-character hex string (either case).
    pub fn from_hex(s: &str) -> Result<Self, AddressError> {
        let raw = hex::decode(s.trim())?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| AddressError::WrongLength(raw.len()))?;
        Ok(PublicKey(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Anti-spam token embedded in the address. Rotating it invalidates old copies of the address.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Nospam(pub u32);

impl Nospam {
    pub fn random() -> Self {
        Nospam(OsRng.next_u32())
    }

    pub fn to_bytes(self) -> [u8; NOSPAM_SIZE] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; NOSPAM_SIZE]) -> Self {
        Nospam(u32::from_be_bytes(bytes))
    }
}

/// Shareable address: public key, nospam and a 2-byte checksum over both.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Address {
    public_key: PublicKey,
    nospam: Nospam,
}

impl Address {
    pub fn new(public_key: PublicKey, nospam: Nospam) -> Self {
        Self { public_key, nospam }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn nospam(&self) -> Nospam {
        self.nospam
    }

    /// XOR-fold of `public_key ‖ nospam` into two bytes. Byte `i` lands in checksum byte `i % 2`.
    pub fn checksum(&self) -> [u8; CHECKSUM_SIZE] {
        let mut sum = [0u8; CHECKSUM_SIZE];
        let nospam = self.nospam.to_bytes();
        for (i, b) in self.public_key.0.iter().chain(nospam.iter()).enumerate() {
            sum[i % CHECKSUM_SIZE] ^= b;
        }
        sum
    }

    pub fn to_bytes(&self) -> [u8; ADDRESS_SIZE] {
        let mut out = [0u8; ADDRESS_SIZE];
        out[..PUBLIC_KEY_SIZE].copy_from_slice(&self.public_key.0);
        out[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NOSPAM_SIZE].copy_from_slice(&self.nospam.to_bytes());
        out[PUBLIC_KEY_SIZE + NOSPAM_SIZE..].copy_from_slice(&self.checksum());
        out
    }

    /// Decode and verify a 38-byte address.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        if bytes.len() != ADDRESS_SIZE {
            return Err(AddressError::WrongLength(bytes.len()));
        }
        let mut pk = [0u8; PUBLIC_KEY_SIZE];
        pk.copy_from_slice(&bytes[..PUBLIC_KEY_SIZE]);
        let mut nospam = [0u8; NOSPAM_SIZE];
        nospam.copy_from_slice(&bytes[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NOSPAM_SIZE]);
        let address = Address::new(PublicKey(pk), Nospam::from_bytes(nospam));
        if address.checksum()[..] != bytes[PUBLIC_KEY_SIZE + NOSPAM_SIZE..] {
            return Err(AddressError::BadChecksum);
        }
        Ok(address)
    }

    /// Uppercase hex, the form users exchange.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, AddressError> {
        let raw = hex::decode(s.trim())?;
        Self::from_bytes(&raw)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("expected {ADDRESS_SIZE} bytes, got {0}")]
    WrongLength(usize),
    #[error("address checksum mismatch")]
    BadChecksum,
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// X25519 keypair. Keep secret key private; expose only the public key.
/// Also used for per-handshake ephemeral keys.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Rebuild a keypair from persisted secret key bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Secret key bytes, for the save blob only. Never transmitted.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Shared secret with another key's public half. Used to derive directional keys.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// Engine identity: long-term keypair plus the rotatable nospam.
pub struct Identity {
    keypair: Keypair,
    nospam: Nospam,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            keypair: Keypair::generate(),
            nospam: Nospam::random(),
        }
    }

    pub fn from_parts(keypair: Keypair, nospam: Nospam) -> Self {
        Self { keypair, nospam }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }

    pub fn nospam(&self) -> Nospam {
        self.nospam
    }

    pub fn set_nospam(&mut self, nospam: Nospam) {
        self.nospam = nospam;
    }

    pub fn address(&self) -> Address {
        Address::new(*self.keypair.public_key(), self.nospam)
    }
}

/// Derive a 32-byte directional key (ChaCha20-Poly1305) from a DH output.
/// Binding sender and receiver gives each direction of a pair its own key.
pub fn derive_session_key(
    label: &[u8],
    shared_secret: &[u8; 32],
    sender: &PublicKey,
    receiver: &PublicKey,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(shared_secret);
    hasher.update(sender.as_bytes());
    hasher.update(receiver.as_bytes());
    hasher.finalize().into()
}

fn nonce_bytes(nonce: u64) -> [u8; 12] {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..12].copy_from_slice(&nonce.to_le_bytes());
    nonce_bytes
}

/// Wire encryption: ChaCha20-Poly1305. Nonce: 96-bit from a u64; never reuse under one key.
pub fn encrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce_bytes = nonce_bytes(nonce);
    let nonce_arr = chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
        &nonce_bytes,
    );
    cipher
        .encrypt(nonce_arr, plaintext)
        .map_err(|_| WireCryptoError::Encrypt)
}

/// Wire decryption.
pub fn decrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce_bytes = nonce_bytes(nonce);
    let nonce_arr = chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
        &nonce_bytes,
    );
    cipher
        .decrypt(nonce_arr, ciphertext)
        .map_err(|_| WireCryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn key_exchange_symmetric() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let secret_a = a.shared_secret(b.public_key());
        let secret_b = b.shared_secret(a.public_key());
        assert_eq!(secret_a, secret_b);
    }

    #[test]
    fn directional_keys_differ() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let shared = a.shared_secret(b.public_key());
        let a_to_b = derive_session_key(STATIC_KEY_LABEL, &shared, a.public_key(), b.public_key());
        let b_to_a = derive_session_key(STATIC_KEY_LABEL, &shared, b.public_key(), a.public_key());
        assert_ne!(a_to_b, b_to_a);
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let plain = b"hello parley";
        let cipher = encrypt_wire(&key, 7, plain).unwrap();
        let dec = decrypt_wire(&key, 7, &cipher).unwrap();
        assert_eq!(dec.as_slice(), plain);
        assert!(decrypt_wire(&key, 8, &cipher).is_err());
    }

    #[test]
    fn keypair_restores_from_secret() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_bytes(kp.secret_bytes());
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn address_layout() {
        let identity = Identity::generate();
        let bytes = identity.address().to_bytes();
        assert_eq!(bytes.len(), ADDRESS_SIZE);
        assert_eq!(&bytes[..32], identity.public_key().as_bytes());
        assert_eq!(bytes[32..36], identity.nospam().to_bytes());
    }

    #[test]
    fn address_hex_is_uppercase_and_parses_either_case() {
        let address = Identity::generate().address();
        let text = address.to_hex();
        assert_eq!(text.len(), ADDRESS_SIZE * 2);
        assert_eq!(text, text.to_ascii_uppercase());
        assert_eq!(Address::from_hex(&text.to_ascii_lowercase()).unwrap(), address);
        assert_eq!(text.parse::<Address>().unwrap(), address);
    }

    #[test]
    fn address_wrong_length() {
        assert!(matches!(
            Address::from_bytes(&[0u8; 37]),
            Err(AddressError::WrongLength(37))
        ));
    }

    #[test]
    fn nospam_rotation_changes_address() {
        let mut identity = Identity::generate();
        let before = identity.address();
        identity.set_nospam(Nospam(before.nospam().0.wrapping_add(1)));
        let after = identity.address();
        assert_eq!(before.public_key(), after.public_key());
        assert_ne!(before.to_bytes(), after.to_bytes());
    }

    proptest! {
        #[test]
        fn address_roundtrip(pk in any::<[u8; 32]>(), nospam in any::<u32>()) {
            let address = Address::new(PublicKey::from_bytes(pk), Nospam(nospam));
            prop_assert_eq!(Address::from_bytes(&address.to_bytes()).unwrap(), address);
        }

        #[test]
        fn single_corrupted_byte_is_rejected(
            pk in any::<[u8; 32]>(),
            nospam in any::<u32>(),
            index in 0usize..ADDRESS_SIZE,
            flip in 1u8..=255,
        ) {
            let mut bytes = Address::new(PublicKey::from_bytes(pk), Nospam(nospam)).to_bytes();
            bytes[index] ^= flip;
            prop_assert!(matches!(Address::from_bytes(&bytes), Err(AddressError::BadChecksum)));
        }
    }
}
