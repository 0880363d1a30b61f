//! Session crypto: the RSA-wrapped key exchange and the per-session CBC
//! frame ciphers.
//!
//! Both directions run AES-CBC-128 keyed with the fixed [`RANDOM_SEED`] and
//! initialized with the 16-byte seed the console returns in its hello-ack.
//! The ciphers are stateful chains: block N is IV-chained from block N-1, so
//! frames must be encrypted and decrypted strictly in wire order. Each
//! cipher pair belongs to exactly one session and is dropped with it.

use std::sync::LazyLock;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use rand::rngs::ThreadRng;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha1::Sha1;

/// Cipher block size; every encrypted frame is padded to a multiple of this.
pub const BLOCK: usize = 16;

/// The fixed AES-128 session key the protocol wraps with RSA.
pub const RANDOM_SEED: [u8; 16] = [
    0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// The console's public key, as shipped inside the official mobile app.
const PUBLIC_KEY_PEM: &str = "-----BEGIN PUBLIC KEY-----
MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEAxfAO/MDk5ovZpp7xlG9J
JKc4Sg4ztAz+BbOt6Gbhub02tF9bryklpTIyzM0v817pwQ3TCoigpxEcWdTykhDL
cGhAbcp6E7Xh8aHEsqgtQ/c+wY1zIl3fU//uddlB1XuipXthDv6emXsyyU/tJWqc
zy9HCJncLJeYo7MJvf2TE9nnlVm1x4flmD0k1zrvb3MONqoZbKb/TQVuVhBv7SM+
U5PSi3diXIx1Nnj4vQ8clRNUJ5X1tT9XfVmKQS1J513XNZ0uYHYRDzQYujpLWucu
ob7v50wCpUm3iKP1fYCixMP6xFm0jPYz1YQaMV35VkYwc40qgk3av0PDS+1G0dCm
swIDAQAB
-----END PUBLIC KEY-----";

static PUBLIC_KEY: LazyLock<RsaPublicKey> = LazyLock::new(|| {
    RsaPublicKey::from_public_key_pem(PUBLIC_KEY_PEM).expect("embedded rsa public key parses")
});

/// RSA-OAEP(SHA-1) wrap of [`RANDOM_SEED`] for the handshake frame.
///
/// The result is always 256 bytes for the embedded 2048-bit key.
pub fn wrap_session_key(rng: &mut ThreadRng) -> Result<Vec<u8>, rsa::Error> {
    PUBLIC_KEY.encrypt(rng, Oaep::new::<Sha1>(), &RANDOM_SEED)
}

type CbcEnc = cbc::Encryptor<Aes128>;
type CbcDec = cbc::Decryptor<Aes128>;

/// Outbound half of a session cipher. Encrypting mutates the chain, so
/// frames must be passed in the exact order they hit the wire.
pub struct FrameEncryptor(CbcEnc);

impl FrameEncryptor {
    pub fn encrypt(&mut self, frame: &mut [u8]) {
        debug_assert_eq!(frame.len() % BLOCK, 0, "frames are block padded");
        for block in frame.chunks_exact_mut(BLOCK) {
            self.0.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

/// Inbound half of a session cipher; same ordering contract as
/// [`FrameEncryptor`].
pub struct FrameDecryptor(CbcDec);

impl FrameDecryptor {
    pub fn decrypt(&mut self, frame: &mut [u8]) {
        debug_assert_eq!(frame.len() % BLOCK, 0, "frames are block padded");
        for block in frame.chunks_exact_mut(BLOCK) {
            self.0.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

/// Builds the encrypt/decrypt pair for one session from the hello-ack seed.
pub fn session_ciphers(seed: &[u8; 16]) -> (FrameEncryptor, FrameDecryptor) {
    let key = GenericArray::from(RANDOM_SEED);
    let iv = GenericArray::from(*seed);
    (
        FrameEncryptor(CbcEnc::new(&key, &iv)),
        FrameDecryptor(CbcDec::new(&key, &iv)),
    )
}
