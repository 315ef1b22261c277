// Copyright (C) 2025, The quill Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use ring::aead;
use ring::hkdf;

use crate::Error;
use crate::Result;

/// An AEAD algorithm negotiated by the TLS handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    #[allow(non_camel_case_types)]
    AES128_GCM,

    #[allow(non_camel_case_types)]
    AES256_GCM,

    #[allow(non_camel_case_types)]
    ChaCha20_Poly1305,
}

impl Algorithm {
    fn get_ring_aead(self) -> &'static aead::Algorithm {
        match self {
            Algorithm::AES128_GCM => &aead::AES_128_GCM,
            Algorithm::AES256_GCM => &aead::AES_256_GCM,
            Algorithm::ChaCha20_Poly1305 => &aead::CHACHA20_POLY1305,
        }
    }

    fn get_ring_digest(self) -> hkdf::Algorithm {
        match self {
            Algorithm::AES128_GCM => hkdf::HKDF_SHA256,
            Algorithm::AES256_GCM => hkdf::HKDF_SHA384,
            Algorithm::ChaCha20_Poly1305 => hkdf::HKDF_SHA256,
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            Algorithm::AES128_GCM => 16,
            Algorithm::AES256_GCM => 32,
            Algorithm::ChaCha20_Poly1305 => 32,
        }
    }

    pub fn tag_len(self) -> usize {
        16
    }

    pub fn nonce_len(self) -> usize {
        12
    }
}

/// AEAD context for the ingress direction.
pub struct Open {
    alg: Algorithm,

    key: aead::LessSafeKey,

    nonce: Vec<u8>,
}

impl Open {
    pub fn new(alg: Algorithm, key: &[u8], iv: &[u8]) -> Result<Open> {
        let key = aead::UnboundKey::new(alg.get_ring_aead(), key)
            .map_err(|_| Error::DecryptionFailure)?;

        Ok(Open {
            alg,

            key: aead::LessSafeKey::new(key),

            nonce: Vec::from(iv),
        })
    }

    /// Builds an ingress context from an exporter secret.
    pub fn from_secret(alg: Algorithm, secret: &[u8]) -> Result<Open> {
        let mut key = vec![0; alg.key_len()];
        let mut iv = vec![0; alg.nonce_len()];

        derive_pkt_key(alg, secret, &mut key)?;
        derive_pkt_iv(alg, secret, &mut iv)?;

        Open::new(alg, &key, &iv)
    }

    /// Decrypts `buf` (ciphertext plus tag) in place, using the packet
    /// number as nonce and `ad` as associated data. Returns the plaintext
    /// length.
    pub fn open_with_u64_counter(
        &self, counter: u64, ad: &[u8], buf: &mut [u8],
    ) -> Result<usize> {
        let nonce = make_nonce(&self.nonce, counter);

        let plain = self
            .key
            .open_in_place(nonce, aead::Aad::from(ad), buf)
            .map_err(|_| Error::DecryptionFailure)?;

        Ok(plain.len())
    }

    pub fn alg(&self) -> Algorithm {
        self.alg
    }
}

/// AEAD context for the egress direction.
pub struct Seal {
    alg: Algorithm,

    key: aead::LessSafeKey,

    nonce: Vec<u8>,
}

impl Seal {
    pub fn new(alg: Algorithm, key: &[u8], iv: &[u8]) -> Result<Seal> {
        let key = aead::UnboundKey::new(alg.get_ring_aead(), key)
            .map_err(|_| Error::DecryptionFailure)?;

        Ok(Seal {
            alg,

            key: aead::LessSafeKey::new(key),

            nonce: Vec::from(iv),
        })
    }

    /// Builds an egress context from an exporter secret.
    pub fn from_secret(alg: Algorithm, secret: &[u8]) -> Result<Seal> {
        let mut key = vec![0; alg.key_len()];
        let mut iv = vec![0; alg.nonce_len()];

        derive_pkt_key(alg, secret, &mut key)?;
        derive_pkt_iv(alg, secret, &mut iv)?;

        Seal::new(alg, &key, &iv)
    }

    /// Encrypts the first `in_len` bytes of `buf` in place and appends the
    /// authentication tag, using the packet number as nonce and `ad` as
    /// associated data. Returns the total output length.
    pub fn seal_with_u64_counter(
        &self, counter: u64, ad: &[u8], buf: &mut [u8], in_len: usize,
    ) -> Result<usize> {
        let tag_len = self.alg.tag_len();

        if in_len + tag_len > buf.len() {
            return Err(Error::BufferTooShort);
        }

        let nonce = make_nonce(&self.nonce, counter);

        let tag = self
            .key
            .seal_in_place_separate_tag(
                nonce,
                aead::Aad::from(ad),
                &mut buf[..in_len],
            )
            .map_err(|_| Error::DecryptionFailure)?;

        buf[in_len..in_len + tag_len].copy_from_slice(tag.as_ref());

        Ok(in_len + tag_len)
    }

    pub fn alg(&self) -> Algorithm {
        self.alg
    }
}

fn make_nonce(iv: &[u8], counter: u64) -> aead::Nonce {
    let mut nonce = [0; aead::NONCE_LEN];
    nonce.copy_from_slice(iv);

    // XOR the last bytes of the IV with the counter. This is equivalent to
    // left-padding the counter with zero bytes.
    for (a, b) in nonce[4..].iter_mut().zip(counter.to_be_bytes().iter()) {
        *a ^= b;
    }

    aead::Nonce::assume_unique_for_key(nonce)
}

fn derive_pkt_key(alg: Algorithm, secret: &[u8], out: &mut [u8]) -> Result<()> {
    hkdf_expand(alg, secret, b"quic key", out)
}

fn derive_pkt_iv(alg: Algorithm, secret: &[u8], out: &mut [u8]) -> Result<()> {
    hkdf_expand(alg, secret, b"quic iv", out)
}

fn hkdf_expand(
    alg: Algorithm, secret: &[u8], label: &[u8], out: &mut [u8],
) -> Result<()> {
    let prk = hkdf::Prk::new_less_safe(alg.get_ring_digest(), secret);

    let label_slice = [label];
    let okm = prk
        .expand(&label_slice, ArbitraryOutputLen(out.len()))
        .map_err(|_| Error::TlsFail)?;

    okm.fill(out).map_err(|_| Error::TlsFail)
}

// The ring HKDF expand() API does not accept an arbitrary output length, so
// we need to hide the requested length in a newtype that implements
// `ring::hkdf::KeyType` in order for ring to accept it.
struct ArbitraryOutputLen(usize);

impl hkdf::KeyType for ArbitraryOutputLen {
    fn len(&self) -> usize {
        self.0
    }
}
