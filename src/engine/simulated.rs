//! Simulated engine: software stand-in for the enclave crypto core
//!
//! SHA-2, HMAC, AES and AES-GCM are real. Elliptic curve, SM2/SM3/SM4, CMAC and CCM
//! are SHA-256 based simulations that round-trip consistently (a signature made with a
//! private key verifies against its public key, ECDH agrees on both sides, ECIES and
//! SM2 ECES decrypt what they encrypt). NOT hardware-secured, development only.

use super::{
    CryptoEngine, DerivedKeys, Direction, EngineError, EngineResult, ImplicitCertificate,
    KeyMaterial, Secret,
};
use crate::algo::{
    AuthEncAlgo, CipherAlgo, HashAlgo, KdfAlgo, KeyExchangeScheme, KeyType, MacAlgo,
    SignatureScheme, AEAD_TAG_SIZE, BLOCK_SIZE,
};
use crate::flags::RootKek;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::cipher::{BlockDecrypt, BlockEncrypt};
use aes_gcm::aes::{Aes128, Aes192, Aes256, Block};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

type Aes192Gcm = AesGcm<Aes192, aes_gcm::aead::consts::U12>;

/// Software simulated crypto engine
pub struct SimulatedEngine {
    chip_secret: Secret,
    rng_started: bool,
}

impl SimulatedEngine {
    /// Engine bound to one chip identity; root KEKs are stable for a given id
    pub fn new(chip_unique_id: u64) -> Self {
        let chip_secret = Zeroizing::new(expand(
            b"sim-chip-secret",
            &[&chip_unique_id.to_be_bytes()],
            32,
        ));
        Self {
            chip_secret,
            rng_started: true,
        }
    }

    /// Engine whose RNG never started, every random-dependent call fails
    pub fn without_rng(chip_unique_id: u64) -> Self {
        Self {
            rng_started: false,
            ..Self::new(chip_unique_id)
        }
    }

    fn fill_random(&self, len: usize) -> EngineResult<Vec<u8>> {
        if !self.rng_started {
            return Err(EngineError::RngNotStarted);
        }
        let mut out = vec![0u8; len];
        rand::rngs::OsRng.fill_bytes(&mut out);
        Ok(out)
    }
}

fn coordinate(key_type: KeyType) -> EngineResult<usize> {
    key_type
        .coordinate_size()
        .ok_or_else(|| EngineError::InvalidInput(format!("{:?} is not an ECC key", key_type)))
}

/// SHA-256 counter-mode expansion of `parts` under a domain label
fn expand(label: &[u8], parts: &[&[u8]], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 32);
    let mut counter = 0u32;
    while out.len() < len {
        let mut h = Sha256::new();
        h.update(label);
        for part in parts {
            h.update((part.len() as u32).to_be_bytes());
            h.update(part);
        }
        h.update(counter.to_be_bytes());
        out.extend_from_slice(&h.finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}

fn xor(data: &[u8], stream: &[u8]) -> Vec<u8> {
    data.iter().zip(stream).map(|(a, b)| a ^ b).collect()
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

fn hmac_digest(algo: HashAlgo, key: &[u8], parts: &[&[u8]]) -> EngineResult<Vec<u8>> {
    macro_rules! run {
        ($digest:ty) => {{
            let mut m = <Hmac<$digest> as Mac>::new_from_slice(key)
                .map_err(|e| EngineError::InvalidInput(format!("HMAC key: {}", e)))?;
            for part in parts {
                m.update(part);
            }
            Ok(m.finalize().into_bytes().to_vec())
        }};
    }
    match algo {
        HashAlgo::Sha224 => run!(Sha224),
        HashAlgo::Sha256 => run!(Sha256),
        HashAlgo::Sha384 => run!(Sha384),
        HashAlgo::Sha512 => run!(Sha512),
        HashAlgo::Sm3_256 => Err(EngineError::Unsupported("HMAC-SM3".into())),
    }
}

/// TLS P_hash expansion
fn p_hash(algo: HashAlgo, secret: &[u8], seed: &[u8], len: usize) -> EngineResult<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    let mut a = hmac_digest(algo, secret, &[seed])?;
    while out.len() < len {
        out.extend(hmac_digest(algo, secret, &[&a, seed])?);
        a = hmac_digest(algo, secret, &[&a])?;
    }
    out.truncate(len);
    Ok(out)
}

fn curve_y(key_type: KeyType, x: &[u8], lsb: u8) -> Vec<u8> {
    let mut y = expand(b"sim-curve-y", &[&[key_type.code()], x], x.len());
    if let Some(last) = y.last_mut() {
        *last = (*last & !1) | (lsb & 1);
    }
    y
}

fn public_from_secret(key_type: KeyType, secret: &[u8]) -> EngineResult<Vec<u8>> {
    let c = coordinate(key_type)?;
    let mut public = expand(b"sim-pub-x", &[&[key_type.code()], secret], c);
    let parity = expand(b"sim-pub-parity", &[secret], 1)[0] & 1;
    let y = curve_y(key_type, &public, parity);
    public.extend(y);
    Ok(public)
}

/// Shared point of two parties, symmetric in the pair of public keys
fn shared_point(key_type: KeyType, own_public: &[u8], peer_public: &[u8]) -> EngineResult<Vec<u8>> {
    let c = coordinate(key_type)?;
    if peer_public.len() != 2 * c {
        return Err(EngineError::InvalidInput("peer public key size".into()));
    }
    let (lo, hi) = if own_public <= peer_public {
        (own_public, peer_public)
    } else {
        (peer_public, own_public)
    };
    Ok(expand(b"sim-ecdh", &[&[key_type.code()], lo, hi], 2 * c))
}

enum AesBlock {
    A128(Aes128),
    A192(Aes192),
    A256(Aes256),
}

impl AesBlock {
    fn new(key: &[u8]) -> EngineResult<Self> {
        let bad = |_| EngineError::InvalidInput("AES key length".into());
        match key.len() {
            16 => Aes128::new_from_slice(key).map(AesBlock::A128).map_err(bad),
            24 => Aes192::new_from_slice(key).map(AesBlock::A192).map_err(bad),
            32 => Aes256::new_from_slice(key).map(AesBlock::A256).map_err(bad),
            n => Err(EngineError::InvalidInput(format!("AES key length {}", n))),
        }
    }

    fn apply(&self, block: &mut Block, direction: Direction) {
        match (self, direction) {
            (AesBlock::A128(c), Direction::Encrypt) => c.encrypt_block(block),
            (AesBlock::A128(c), Direction::Decrypt) => c.decrypt_block(block),
            (AesBlock::A192(c), Direction::Encrypt) => c.encrypt_block(block),
            (AesBlock::A192(c), Direction::Decrypt) => c.decrypt_block(block),
            (AesBlock::A256(c), Direction::Encrypt) => c.encrypt_block(block),
            (AesBlock::A256(c), Direction::Decrypt) => c.decrypt_block(block),
        }
    }
}

/// ECB / CBC over a block permutation
fn block_mode(
    input: &[u8],
    iv: Option<&[u8]>,
    direction: Direction,
    mut permute: impl FnMut(&mut [u8; BLOCK_SIZE], Direction),
) -> EngineResult<Vec<u8>> {
    if input.len() % BLOCK_SIZE != 0 {
        return Err(EngineError::InvalidInput("input is not block aligned".into()));
    }
    let mut chain = [0u8; BLOCK_SIZE];
    if let Some(iv) = iv {
        if iv.len() != BLOCK_SIZE {
            return Err(EngineError::InvalidInput("CBC IV length".into()));
        }
        chain.copy_from_slice(iv);
    }
    let mut out = Vec::with_capacity(input.len());
    for chunk in input.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(chunk);
        match direction {
            Direction::Encrypt => {
                if iv.is_some() {
                    block.iter_mut().zip(chain.iter()).for_each(|(b, c)| *b ^= c);
                }
                permute(&mut block, direction);
                chain = block;
            }
            Direction::Decrypt => {
                permute(&mut block, direction);
                if iv.is_some() {
                    block.iter_mut().zip(chain.iter()).for_each(|(b, c)| *b ^= c);
                    chain.copy_from_slice(chunk);
                }
            }
        }
        out.extend_from_slice(&block);
    }
    Ok(out)
}

fn gcm<C: Aead + KeyInit>(
    key: &[u8],
    iv: &[u8],
    aad: &[u8],
    input: &[u8],
    direction: Direction,
) -> EngineResult<Vec<u8>> {
    let cipher = C::new_from_slice(key)
        .map_err(|_| EngineError::InvalidInput("AES-GCM key length".into()))?;
    if iv.len() != 12 {
        return Err(EngineError::InvalidInput("AES-GCM IV length".into()));
    }
    let nonce = aes_gcm::aead::Nonce::<C>::from_slice(iv);
    let payload = Payload { msg: input, aad };
    match direction {
        Direction::Encrypt => cipher
            .encrypt(nonce, payload)
            .map_err(|_| EngineError::Failure("AES-GCM encryption".into())),
        Direction::Decrypt => cipher
            .decrypt(nonce, payload)
            .map_err(|_| EngineError::AuthenticationFailed),
    }
}

/// Wrap `plaintext` under an AES-256 KEK in the `IV || ciphertext || tag` import format
pub fn wrap_key(kek: &[u8], iv: &[u8; 12], plaintext: &[u8]) -> EngineResult<Vec<u8>> {
    let mut out = iv.to_vec();
    out.extend(gcm::<Aes256Gcm>(kek, iv, &[], plaintext, Direction::Encrypt)?);
    Ok(out)
}

impl CryptoEngine for SimulatedEngine {
    fn random_bytes(&self, len: usize) -> EngineResult<Vec<u8>> {
        self.fill_random(len)
    }

    fn generate_key(&self, key_type: KeyType) -> EngineResult<KeyMaterial> {
        let secret = Zeroizing::new(self.fill_random(key_type.secret_size())?);
        let public = if key_type.is_asymmetric() {
            Some(public_from_secret(key_type, &secret)?)
        } else {
            None
        };
        Ok(KeyMaterial { secret, public })
    }

    fn derive_public_key(&self, key_type: KeyType, secret: &[u8]) -> EngineResult<Vec<u8>> {
        public_from_secret(key_type, secret)
    }

    fn cipher(
        &self,
        algo: CipherAlgo,
        key: &[u8],
        iv: &[u8],
        input: &[u8],
        direction: Direction,
    ) -> EngineResult<Vec<u8>> {
        match algo {
            CipherAlgo::AesEcb | CipherAlgo::AesCbc => {
                let aes = AesBlock::new(key)?;
                let iv = (algo == CipherAlgo::AesCbc).then_some(iv);
                block_mode(input, iv, direction, |block, dir| {
                    let mut b = Block::clone_from_slice(&block[..]);
                    aes.apply(&mut b, dir);
                    block.copy_from_slice(b.as_slice());
                })
            }
            CipherAlgo::Sm4Ecb | CipherAlgo::Sm4Cbc => {
                if key.len() != 16 {
                    return Err(EngineError::InvalidInput("SM4 key length".into()));
                }
                let pad = expand(b"sim-sm4", &[key], BLOCK_SIZE);
                let iv = (algo == CipherAlgo::Sm4Cbc).then_some(iv);
                block_mode(input, iv, direction, |block, dir| match dir {
                    Direction::Encrypt => {
                        block.iter_mut().zip(pad.iter()).for_each(|(b, p)| *b ^= p);
                        block.rotate_left(5);
                    }
                    Direction::Decrypt => {
                        block.rotate_right(5);
                        block.iter_mut().zip(pad.iter()).for_each(|(b, p)| *b ^= p);
                    }
                })
            }
            CipherAlgo::AesCcm => {
                AesBlock::new(key)?;
                let mac_key = expand(b"sim-ccm-mac", &[key], 32);
                match direction {
                    Direction::Encrypt => {
                        let stream = expand(b"sim-ccm", &[key, iv], input.len());
                        let mut out = xor(input, &stream);
                        let tag = hmac_digest(HashAlgo::Sha256, &mac_key, &[iv, &out])?;
                        out.extend_from_slice(&tag[..AEAD_TAG_SIZE]);
                        Ok(out)
                    }
                    Direction::Decrypt => {
                        if input.len() < AEAD_TAG_SIZE {
                            return Err(EngineError::InvalidInput("CCM input too short".into()));
                        }
                        let (ct, tag) = input.split_at(input.len() - AEAD_TAG_SIZE);
                        let expected = hmac_digest(HashAlgo::Sha256, &mac_key, &[iv, ct])?;
                        if !ct_eq(tag, &expected[..AEAD_TAG_SIZE]) {
                            return Err(EngineError::AuthenticationFailed);
                        }
                        Ok(xor(ct, &expand(b"sim-ccm", &[key, iv], ct.len())))
                    }
                }
            }
        }
    }

    fn auth_enc(
        &self,
        algo: AuthEncAlgo,
        key: &[u8],
        iv: &[u8],
        aad: &[u8],
        input: &[u8],
        direction: Direction,
    ) -> EngineResult<Vec<u8>> {
        match algo {
            AuthEncAlgo::AesGcm => match key.len() {
                16 => gcm::<Aes128Gcm>(key, iv, aad, input, direction),
                24 => gcm::<Aes192Gcm>(key, iv, aad, input, direction),
                32 => gcm::<Aes256Gcm>(key, iv, aad, input, direction),
                n => Err(EngineError::InvalidInput(format!("AES key length {}", n))),
            },
        }
    }

    fn hash(&self, algo: HashAlgo, input: &[u8]) -> EngineResult<Vec<u8>> {
        Ok(match algo {
            HashAlgo::Sha224 => Sha224::digest(input).to_vec(),
            HashAlgo::Sha256 => Sha256::digest(input).to_vec(),
            HashAlgo::Sha384 => Sha384::digest(input).to_vec(),
            HashAlgo::Sha512 => Sha512::digest(input).to_vec(),
            HashAlgo::Sm3_256 => expand(b"sim-sm3", &[input], 32),
        })
    }

    fn mac(&self, algo: MacAlgo, key: &[u8], input: &[u8]) -> EngineResult<Vec<u8>> {
        match algo {
            MacAlgo::AesCmac => {
                AesBlock::new(key)?;
                let tag = hmac_digest(HashAlgo::Sha256, key, &[b"sim-cmac", input])?;
                Ok(tag[..16].to_vec())
            }
            MacAlgo::HmacSha224 => hmac_digest(HashAlgo::Sha224, key, &[input]),
            MacAlgo::HmacSha256 => hmac_digest(HashAlgo::Sha256, key, &[input]),
            MacAlgo::HmacSha384 => hmac_digest(HashAlgo::Sha384, key, &[input]),
            MacAlgo::HmacSha512 => hmac_digest(HashAlgo::Sha512, key, &[input]),
        }
    }

    fn prepare_signature(&self, _scheme: SignatureScheme) -> EngineResult<Secret> {
        Ok(Zeroizing::new(self.fill_random(32)?))
    }

    fn sign(
        &self,
        scheme: SignatureScheme,
        secret: &[u8],
        digest: &[u8],
        prepared: Option<&[u8]>,
    ) -> EngineResult<Vec<u8>> {
        let key_type = scheme.key_type();
        let c = coordinate(key_type)?;
        let nonce = match prepared {
            Some(k) => Zeroizing::new(k.to_vec()),
            None => Zeroizing::new(self.fill_random(32)?),
        };
        let public = public_from_secret(key_type, secret)?;
        let r = expand(b"sim-sig-r", &[&nonce], c);
        let s = expand(b"sim-sig-s", &[&public, digest, &r], c);
        let mut signature = r;
        signature.extend(s);
        signature.push(public.last().copied().unwrap_or(0) & 1);
        Ok(signature)
    }

    fn verify(
        &self,
        scheme: SignatureScheme,
        public: &[u8],
        digest: &[u8],
        signature: &[u8],
    ) -> EngineResult<bool> {
        let c = coordinate(scheme.key_type())?;
        if signature.len() != 2 * c + 1 || public.len() != 2 * c {
            return Err(EngineError::InvalidInput("signature or key size".into()));
        }
        let (r, rest) = signature.split_at(c);
        let (s, ry) = rest.split_at(c);
        let expected = expand(b"sim-sig-s", &[public, digest, r], c);
        let parity = public.last().copied().unwrap_or(0) & 1;
        Ok(ct_eq(s, &expected) && ry[0] == parity)
    }

    fn ecies_encrypt(
        &self,
        key_type: KeyType,
        public: &[u8],
        input: &[u8],
        p1: &[u8],
        p2: &[u8],
        mac_size: usize,
    ) -> EngineResult<Vec<u8>> {
        let ephemeral = Zeroizing::new(self.fill_random(coordinate(key_type)?)?);
        let ephemeral_public = public_from_secret(key_type, &ephemeral)?;
        let shared = shared_point(key_type, &ephemeral_public, public)?;
        let stream = expand(b"sim-ecies-enc", &[&shared, p1], input.len());
        let mac_key = expand(b"sim-ecies-mac", &[&shared, p1], 32);
        let ct = xor(input, &stream);
        let tag = hmac_digest(HashAlgo::Sha256, &mac_key, &[&ct, p2])?;
        let mut out = ephemeral_public;
        out.extend_from_slice(&ct);
        out.extend_from_slice(&tag[..mac_size.min(tag.len())]);
        Ok(out)
    }

    fn ecies_decrypt(
        &self,
        key_type: KeyType,
        secret: &[u8],
        input: &[u8],
        p1: &[u8],
        p2: &[u8],
        mac_size: usize,
    ) -> EngineResult<Vec<u8>> {
        let point = 2 * coordinate(key_type)?;
        if input.len() < point + mac_size {
            return Err(EngineError::InvalidInput("ECIES input too short".into()));
        }
        let (ephemeral_public, rest) = input.split_at(point);
        let (ct, tag) = rest.split_at(rest.len() - mac_size);
        let own_public = public_from_secret(key_type, secret)?;
        let shared = shared_point(key_type, &own_public, ephemeral_public)?;
        let mac_key = expand(b"sim-ecies-mac", &[&shared, p1], 32);
        let expected = hmac_digest(HashAlgo::Sha256, &mac_key, &[ct, p2])?;
        if !ct_eq(tag, &expected[..mac_size.min(expected.len())]) {
            return Err(EngineError::AuthenticationFailed);
        }
        Ok(xor(ct, &expand(b"sim-ecies-enc", &[&shared, p1], ct.len())))
    }

    fn sm2_eces_encrypt(&self, public: &[u8], input: &[u8]) -> EngineResult<Vec<u8>> {
        let key_type = KeyType::DsaSm2Fp256;
        let ephemeral = Zeroizing::new(self.fill_random(32)?);
        let c1 = public_from_secret(key_type, &ephemeral)?;
        let shared = shared_point(key_type, &c1, public)?;
        let c2 = xor(input, &expand(b"sim-sm2-kdf", &[&shared], input.len()));
        let c3 = expand(b"sim-sm3", &[&shared[..32], input, &shared[32..]], 32);
        let mut out = vec![0x04];
        out.extend(c1);
        out.extend(c2);
        out.extend(c3);
        Ok(out)
    }

    fn sm2_eces_decrypt(&self, secret: &[u8], input: &[u8]) -> EngineResult<Vec<u8>> {
        let key_type = KeyType::DsaSm2Fp256;
        if input.len() <= 97 || input[0] != 0x04 {
            return Err(EngineError::InvalidInput("SM2 ECES ciphertext".into()));
        }
        let c1 = &input[1..65];
        let (c2, c3) = input[65..].split_at(input.len() - 65 - 32);
        let own_public = public_from_secret(key_type, secret)?;
        let shared = shared_point(key_type, &own_public, c1)?;
        let plain = xor(c2, &expand(b"sim-sm2-kdf", &[&shared], c2.len()));
        let expected = expand(b"sim-sm3", &[&shared[..32], &plain, &shared[32..]], 32);
        if !ct_eq(c3, &expected) {
            return Err(EngineError::AuthenticationFailed);
        }
        Ok(plain)
    }

    fn sm2_get_z(&self, public: &[u8], identifier: &[u8]) -> EngineResult<Vec<u8>> {
        let entl = ((identifier.len() * 8) as u16).to_be_bytes();
        Ok(expand(b"sim-sm3", &[&entl, identifier, b"sm2-curve", public], 32))
    }

    fn key_agreement(
        &self,
        scheme: KeyExchangeScheme,
        secret: &[u8],
        peer_public: &[u8],
    ) -> EngineResult<Secret> {
        let key_type = scheme.key_type();
        let own_public = public_from_secret(key_type, secret)?;
        let point = shared_point(key_type, &own_public, peer_public)?;
        Ok(Zeroizing::new(point[..point.len() / 2].to_vec()))
    }

    fn derive_keys(
        &self,
        kdf: KdfAlgo,
        shared_secret: &[u8],
        kdf_input: &[u8],
        outputs: &[KeyType],
    ) -> EngineResult<DerivedKeys> {
        let key_len: usize = outputs.iter().map(|kt| kt.secret_size()).sum();
        let (stream, iv_len) = match kdf {
            KdfAlgo::AesCmac256Counter => (
                expand(b"sim-cmac-kdf", &[shared_secret, b"HSM USER_KEK"], key_len),
                0,
            ),
            KdfAlgo::ForSm2 => (expand(b"sim-sm2-kdf", &[shared_secret], key_len), 0),
            KdfAlgo::HmacSha384Tls0_32_4 | KdfAlgo::HmacSha384Tls48_32_4 => {
                let seed = [b"key expansion".as_slice(), kdf_input].concat();
                (p_hash(HashAlgo::Sha384, shared_secret, &seed, key_len + 8)?, 8)
            }
            _ => {
                let seed = [b"key expansion".as_slice(), kdf_input].concat();
                (p_hash(HashAlgo::Sha256, shared_secret, &seed, key_len + 8)?, 8)
            }
        };
        let stream = Zeroizing::new(stream);
        let mut keys = Vec::with_capacity(outputs.len());
        let mut offset = 0;
        for kt in outputs {
            let size = kt.secret_size();
            keys.push(Zeroizing::new(stream[offset..offset + size].to_vec()));
            offset += size;
        }
        let iv_output = stream[offset..offset + iv_len].to_vec();
        Ok(DerivedKeys { keys, iv_output })
    }

    fn butterfly_expand(
        &self,
        key_type: KeyType,
        secret: &[u8],
        expansion_value: &[u8],
        implicit: Option<ImplicitCertificate<'_>>,
    ) -> EngineResult<Secret> {
        let c = coordinate(key_type)?;
        let expanded = match implicit {
            None => expand(b"sim-bke-explicit", &[secret, expansion_value], c),
            Some(cert) => expand(
                b"sim-bke-implicit",
                &[secret, expansion_value, cert.hash, cert.private_reconstruction],
                c,
            ),
        };
        Ok(Zeroizing::new(expanded))
    }

    fn reconstruct_public_key(
        &self,
        key_type: KeyType,
        public_reconstruction: &[u8],
        hash: &[u8],
        ca_key: &[u8],
    ) -> EngineResult<Vec<u8>> {
        let c = coordinate(key_type)?;
        let scalar = expand(b"sim-pub-rec", &[public_reconstruction, hash, ca_key], c);
        public_from_secret(key_type, &scalar)
    }

    fn decompress_public_key(&self, key_type: KeyType, compressed: &[u8]) -> EngineResult<Vec<u8>> {
        let c = coordinate(key_type)?;
        if compressed.len() != c + 1 || compressed[c] > 1 {
            return Err(EngineError::InvalidInput("compressed key format".into()));
        }
        let x = &compressed[..c];
        let mut out = x.to_vec();
        out.extend(curve_y(key_type, x, compressed[c]));
        Ok(out)
    }

    fn root_kek(&self, which: RootKek) -> EngineResult<Secret> {
        let kek = match which {
            RootKek::Common => expand(b"sim-root-kek-common", &[], 32),
            RootKek::PartUnique => expand(b"sim-root-kek-unique", &[&self.chip_secret], 32),
        };
        Ok(Zeroizing::new(kek))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> SimulatedEngine {
        SimulatedEngine::new(0x0123_4567_89ab_cdef)
    }

    #[test]
    fn test_sign_verify_and_tamper() {
        let e = engine();
        let scheme = SignatureScheme::EcdsaNistP256Sha256;
        let key = e.generate_key(KeyType::EcdsaNistP256).unwrap();
        let public = key.public.clone().unwrap();
        let digest = e.hash(HashAlgo::Sha256, b"message").unwrap();
        let mut sig = e.sign(scheme, &key.secret, &digest, None).unwrap();
        assert_eq!(sig.len(), 65);
        assert!(e.verify(scheme, &public, &digest, &sig).unwrap());
        sig[40] ^= 0x01;
        assert!(!e.verify(scheme, &public, &digest, &sig).unwrap());
    }

    #[test]
    fn test_aes_cbc_round_trip() {
        let e = engine();
        let key = [7u8; 32];
        let iv = [1u8; 16];
        let data = [42u8; 48];
        let ct = e.cipher(CipherAlgo::AesCbc, &key, &iv, &data, Direction::Encrypt).unwrap();
        assert_ne!(ct, data.to_vec());
        let pt = e.cipher(CipherAlgo::AesCbc, &key, &iv, &ct, Direction::Decrypt).unwrap();
        assert_eq!(pt, data.to_vec());
    }

    #[test]
    fn test_sm4_ecb_round_trip() {
        let e = engine();
        let key = [3u8; 16];
        let data: Vec<u8> = (0..32).collect();
        let ct = e.cipher(CipherAlgo::Sm4Ecb, &key, &[], &data, Direction::Encrypt).unwrap();
        let pt = e.cipher(CipherAlgo::Sm4Ecb, &key, &[], &ct, Direction::Decrypt).unwrap();
        assert_eq!(pt, data);
    }

    #[test]
    fn test_gcm_tag_mismatch() {
        let e = engine();
        let key = [9u8; 16];
        let iv = [0u8; 12];
        let mut ct = e
            .auth_enc(AuthEncAlgo::AesGcm, &key, &iv, b"aad", b"payload", Direction::Encrypt)
            .unwrap();
        assert_eq!(ct.len(), 7 + 16);
        ct[0] ^= 1;
        assert_eq!(
            e.auth_enc(AuthEncAlgo::AesGcm, &key, &iv, b"aad", &ct, Direction::Decrypt),
            Err(EngineError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_ecdh_agrees() {
        let e = engine();
        let scheme = KeyExchangeScheme::EcdhNistP256;
        let a = e.generate_key(KeyType::EcdsaNistP256).unwrap();
        let b = e.generate_key(KeyType::EcdsaNistP256).unwrap();
        let ab = e.key_agreement(scheme, &a.secret, b.public.as_ref().unwrap()).unwrap();
        let ba = e.key_agreement(scheme, &b.secret, a.public.as_ref().unwrap()).unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn test_ecies_and_sm2_eces_round_trip() {
        let e = engine();
        let key = e.generate_key(KeyType::EcdsaNistP256).unwrap();
        let public = key.public.clone().unwrap();
        let vct = e
            .ecies_encrypt(KeyType::EcdsaNistP256, &public, &[5u8; 16], &[1u8; 32], &[], 16)
            .unwrap();
        assert_eq!(vct.len(), 96);
        let pt = e
            .ecies_decrypt(KeyType::EcdsaNistP256, &key.secret, &vct, &[1u8; 32], &[], 16)
            .unwrap();
        assert_eq!(pt, vec![5u8; 16]);

        let sm2 = e.generate_key(KeyType::DsaSm2Fp256).unwrap();
        let ct = e.sm2_eces_encrypt(sm2.public.as_ref().unwrap(), b"hello sm2").unwrap();
        assert_eq!(ct.len(), 9 + 97);
        assert_eq!(e.sm2_eces_decrypt(&sm2.secret, &ct).unwrap(), b"hello sm2".to_vec());
    }

    #[test]
    fn test_decompression_matches_generated_key() {
        let e = engine();
        let key = e.generate_key(KeyType::EcdsaBrainpoolR1_256).unwrap();
        let public = key.public.unwrap();
        let mut compressed = public[..32].to_vec();
        compressed.push(public[63] & 1);
        let restored = e.decompress_public_key(KeyType::EcdsaBrainpoolR1_256, &compressed).unwrap();
        assert_eq!(restored, public);
    }

    #[test]
    fn test_rng_not_started() {
        let e = SimulatedEngine::without_rng(1);
        assert_eq!(e.random_bytes(8), Err(EngineError::RngNotStarted));
        assert!(e.generate_key(KeyType::Aes128).is_err());
    }

    #[test]
    fn test_wrap_key_unwraps_with_gcm() {
        let e = engine();
        let kek = e.root_kek(RootKek::Common).unwrap();
        let wrapped = wrap_key(&kek, &[4u8; 12], &[0xAA; 32]).unwrap();
        let (iv, body) = wrapped.split_at(12);
        let plain = e
            .auth_enc(AuthEncAlgo::AesGcm, &kek, iv, &[], body, Direction::Decrypt)
            .unwrap();
        assert_eq!(plain, vec![0xAA; 32]);
    }
}
