use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::rngs::OsRng;
use rand::RngCore;

pub const KEY_SIZE: usize = 16;
pub const BLOCK_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 8;
pub const MAC_SIZE: usize = 8;

// The two fixed derivation constants of the secure class: one block is run
// through the network key to produce the encryption key, the other to
// produce the authentication key.
const ENC_KEY_FILL: [u8; BLOCK_SIZE] = [0xAA; BLOCK_SIZE];
const MAC_KEY_FILL: [u8; BLOCK_SIZE] = [0x55; BLOCK_SIZE];

/// Session keys derived from the shared network key. Encryption is AES-OFB,
/// authentication is AES-CBC-MAC truncated to eight bytes. The network key
/// itself is never used directly for traffic.
pub struct SecureKeys {
    enc: Aes128,
    mac: Aes128,
}

impl SecureKeys {
    /// Derive the traffic keys from the 16 byte network key.
    pub fn derive(network_key: &[u8; KEY_SIZE]) -> SecureKeys {
        let master = Aes128::new(GenericArray::from_slice(network_key));

        let mut enc_key = GenericArray::clone_from_slice(&ENC_KEY_FILL);
        master.encrypt_block(&mut enc_key);

        let mut mac_key = GenericArray::clone_from_slice(&MAC_KEY_FILL);
        master.encrypt_block(&mut mac_key);

        SecureKeys {
            enc: Aes128::new(&enc_key),
            mac: Aes128::new(&mac_key),
        }
    }

    /// Apply the AES-OFB keystream for `iv` to `data` in place. OFB is its
    /// own inverse, so this both encrypts and decrypts.
    pub fn ofb_apply(&self, iv: &[u8; BLOCK_SIZE], data: &mut [u8]) {
        let mut feedback = GenericArray::clone_from_slice(iv);

        for chunk in data.chunks_mut(BLOCK_SIZE) {
            self.enc.encrypt_block(&mut feedback);
            for (byte, key) in chunk.iter_mut().zip(feedback.iter()) {
                *byte ^= key;
            }
        }
    }

    /// Compute the eight byte authentication tag over the encapsulation
    /// header and the ciphertext. The chain is seeded by encrypting the same
    /// IV the OFB pass used; the header and ciphertext are then folded in as
    /// zero padded CBC blocks.
    pub fn cbc_mac(&self, iv: &[u8; BLOCK_SIZE], header: &[u8; 4], cipher: &[u8]) -> [u8; MAC_SIZE] {
        let mut state = GenericArray::clone_from_slice(iv);
        self.mac.encrypt_block(&mut state);

        let mut fill = 0usize;
        for &byte in header.iter().chain(cipher.iter()) {
            state[fill] ^= byte;
            fill += 1;
            if fill == BLOCK_SIZE {
                self.mac.encrypt_block(&mut state);
                fill = 0;
            }
        }
        if fill > 0 {
            // Trailing partial block, already zero padded by construction
            self.mac.encrypt_block(&mut state);
        }

        let mut tag = [0u8; MAC_SIZE];
        tag.copy_from_slice(&state[..MAC_SIZE]);
        tag
    }
}

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    OsRng.fill_bytes(out);
}
