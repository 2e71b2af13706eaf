//! AES-256-CBC encrypt/decrypt filters (spec §2 "filter chain ... + optional encryption").

use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use pg_util::CoreError;

use crate::buffer::Buffer;
use crate::filter::Filter;

const BLOCK_SIZE: usize = 16;
const KEY_SIZE: usize = 32;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("key must be {KEY_SIZE} bytes, got {0}")]
    BadKeyLen(usize),
    #[error("iv must be {BLOCK_SIZE} bytes, got {0}")]
    BadIvLen(usize),
    #[error("ciphertext is not a multiple of the block size, or padding is invalid")]
    BadPadding,
}

pub struct EncryptFilter {
    cipher: Option<Aes256CbcEnc>,
    pending: Vec<u8>,
    done: bool,
}

impl EncryptFilter {
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::BadKeyLen(key.len()));
        }
        if iv.len() != BLOCK_SIZE {
            return Err(CryptoError::BadIvLen(iv.len()));
        }
        Ok(Self {
            cipher: Some(Aes256CbcEnc::new(key.into(), iv.into())),
            pending: Vec::with_capacity(BLOCK_SIZE * 2),
            done: false,
        })
    }
}

impl Filter for EncryptFilter {
    fn feed(&mut self, input: Option<&[u8]>, output: &mut Buffer) -> Result<usize, CoreError> {
        match input {
            Some(bytes) => {
                self.pending.extend_from_slice(bytes);
                let cipher = self.cipher.as_mut().expect("feed after done");
                let mut offset = 0;
                while self.pending.len() - offset >= BLOCK_SIZE {
                    let mut block: [u8; BLOCK_SIZE] =
                        self.pending[offset..offset + BLOCK_SIZE].try_into().unwrap();
                    cipher.encrypt_block_mut((&mut block).into());
                    output.cat(&block)?;
                    offset += BLOCK_SIZE;
                }
                self.pending.drain(..offset);
                Ok(bytes.len())
            }
            None => {
                if !self.done {
                    let cipher = self.cipher.take().expect("flush after done");
                    let pad_len = BLOCK_SIZE - (self.pending.len() % BLOCK_SIZE);
                    let mut last_block = self.pending.clone();
                    last_block.resize(last_block.len() + pad_len, pad_len as u8);
                    let mut cipher = cipher;
                    for chunk in last_block.chunks_exact(BLOCK_SIZE) {
                        let mut block: [u8; BLOCK_SIZE] = chunk.try_into().unwrap();
                        cipher.encrypt_block_mut((&mut block).into());
                        output.cat(&block)?;
                    }
                    self.pending.clear();
                    self.done = true;
                }
                Ok(0)
            }
        }
    }

    fn done(&self) -> bool {
        self.done
    }

    fn name(&self) -> &'static str {
        "encrypt"
    }
}

pub struct DecryptFilter {
    cipher: Option<Aes256CbcDec>,
    pending: Vec<u8>,
    /// Blocks held back because they might be the final (padded) block.
    held_back: Vec<u8>,
    done: bool,
}

impl DecryptFilter {
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::BadKeyLen(key.len()));
        }
        if iv.len() != BLOCK_SIZE {
            return Err(CryptoError::BadIvLen(iv.len()));
        }
        Ok(Self {
            cipher: Some(Aes256CbcDec::new(key.into(), iv.into())),
            pending: Vec::new(),
            held_back: Vec::new(),
            done: false,
        })
    }
}

impl Filter for DecryptFilter {
    fn feed(&mut self, input: Option<&[u8]>, output: &mut Buffer) -> Result<usize, CoreError> {
        match input {
            Some(bytes) => {
                self.pending.extend_from_slice(bytes);
                let cipher = self.cipher.as_mut().expect("feed after done");

                // Always keep the last full block back: it may carry the
                // PKCS7 padding and must only be decrypted (and trimmed)
                // on flush, once we know it really is the last block.
                while self.pending.len() >= BLOCK_SIZE {
                    if self.held_back.len() == BLOCK_SIZE {
                        let mut block: [u8; BLOCK_SIZE] = self.held_back.as_slice().try_into().unwrap();
                        cipher.decrypt_block_mut((&mut block).into());
                        output.cat(&block)?;
                        self.held_back.clear();
                    }
                    self.held_back.extend(self.pending.drain(..BLOCK_SIZE));
                }
                Ok(bytes.len())
            }
            None => {
                if !self.done {
                    if self.held_back.len() == BLOCK_SIZE {
                        let cipher = self.cipher.as_mut().expect("flush after done");
                        let mut block: [u8; BLOCK_SIZE] = self.held_back.as_slice().try_into().unwrap();
                        cipher.decrypt_block_mut((&mut block).into());
                        let pad = *block.last().unwrap() as usize;
                        if pad == 0 || pad > BLOCK_SIZE {
                            return Err(CoreError::Crypto(CryptoError::BadPadding.to_string()));
                        }
                        output.cat(&block[..BLOCK_SIZE - pad])?;
                        self.held_back.clear();
                    } else if !self.held_back.is_empty() {
                        return Err(CoreError::Crypto(CryptoError::BadPadding.to_string()));
                    }
                    self.cipher = None;
                    self.done = true;
                }
                Ok(0)
            }
        }
    }

    fn done(&self) -> bool {
        self.done
    }

    fn name(&self) -> &'static str {
        "decrypt"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trips_for_any_length() {
        // ∀ round trip: decrypt(encrypt(X, K), K) = X
        let key = [7u8; KEY_SIZE];
        let iv = [9u8; BLOCK_SIZE];

        for len in [0usize, 1, 15, 16, 17, 31, 32, 100] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

            let mut enc = EncryptFilter::new(&key, &iv).unwrap();
            let mut ciphertext = Buffer::new(len + BLOCK_SIZE * 2 + 16);
            enc.feed(Some(&data), &mut ciphertext).unwrap();
            enc.feed(None, &mut ciphertext).unwrap();
            assert_eq!(ciphertext.used() % BLOCK_SIZE, 0);

            let mut dec = DecryptFilter::new(&key, &iv).unwrap();
            let mut plain = Buffer::new(len + BLOCK_SIZE * 2 + 16);
            dec.feed(Some(ciphertext.as_slice()), &mut plain).unwrap();
            dec.feed(None, &mut plain).unwrap();

            assert_eq!(plain.as_slice(), data.as_slice());
        }
    }
}
