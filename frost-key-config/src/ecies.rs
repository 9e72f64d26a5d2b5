//! ECIES over secp224k1, assembled from openssl primitives.
//!
//! Wire layout of a ciphered master key (108 bytes total):
//!
//! ```text
//! ephemeral public point, uncompressed, without the 0x04 prefix (56)
//! AES-256-CTR ciphertext of the 32 byte payload, zero nonce        (32)
//! HMAC-SHA1 tag over the ciphertext                                (20)
//! ```
//!
//! Both sides derive the AES and HMAC keys from the ECDH shared secret with
//! KDF1-SHA256 (`SHA256(Z ‖ counter_be32)`, counter 0 for the cipher key,
//! 1 for the MAC key).

use anyhow::{bail, format_err, Error};
use openssl::bn::BigNumContext;
use openssl::derive::Deriver;
use openssl::ec::{EcGroup, EcKey, EcPoint, PointConversionForm};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private, Public};
use openssl::sign::Signer;

use crate::aes_ctr;

/// Field size of secp224k1 in bytes.
const COORD_SIZE: usize = 28;
const POINT_SIZE: usize = 2 * COORD_SIZE;
const PAYLOAD_SIZE: usize = 32;
const TAG_SIZE: usize = 20;

/// Total size of an ECIES ciphertext for a 32 byte payload.
pub const CIPHERTEXT_SIZE: usize = POINT_SIZE + PAYLOAD_SIZE + TAG_SIZE;

fn curve() -> Result<EcGroup, Error> {
    Ok(EcGroup::from_curve_name(Nid::SECP224K1)?)
}

/// Generate a fresh secp224k1 keypair.
pub fn generate_keypair() -> Result<EcKey<Private>, Error> {
    Ok(EcKey::generate(&curve()?)?)
}

fn kdf1(shared: &[u8], counter: u32) -> [u8; 32] {
    let mut hasher = openssl::sha::Sha256::new();
    hasher.update(shared);
    hasher.update(&counter.to_be_bytes());
    hasher.finish()
}

fn derive_shared(private: &EcKey<Private>, peer: &EcKey<Public>) -> Result<Vec<u8>, Error> {
    let own = PKey::from_ec_key(private.clone())?;
    let peer = PKey::from_ec_key(peer.clone())?;
    let mut deriver = Deriver::new(&own)?;
    deriver.set_peer(&peer)?;
    Ok(deriver.derive_to_vec()?)
}

fn hmac_sha1(key: &[u8; 32], data: &[u8]) -> Result<[u8; TAG_SIZE], Error> {
    let pkey = PKey::hmac(key)?;
    let mut signer = Signer::new(MessageDigest::sha1(), &pkey)?;
    signer.update(data)?;
    let tag = signer.sign_to_vec()?;
    let mut out = [0u8; TAG_SIZE];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// Encrypt a 32 byte payload to the holder of `public`.
pub fn encrypt(public: &EcKey<Public>, payload: &[u8; 32]) -> Result<[u8; CIPHERTEXT_SIZE], Error> {
    let group = curve()?;
    let ephemeral = EcKey::generate(&group)?;

    let shared = derive_shared(&ephemeral, public)?;
    let enc_key = kdf1(&shared, 0);
    let mac_key = kdf1(&shared, 1);

    let mut ciphertext = *payload;
    aes_ctr::process(&enc_key, &[0u8; 8], &mut ciphertext)?;
    let tag = hmac_sha1(&mac_key, &ciphertext)?;

    let mut ctx = BigNumContext::new()?;
    let point =
        ephemeral
            .public_key()
            .to_bytes(&group, PointConversionForm::UNCOMPRESSED, &mut ctx)?;
    if point.len() != POINT_SIZE + 1 {
        bail!("unexpected EC point encoding size {}", point.len());
    }

    let mut out = [0u8; CIPHERTEXT_SIZE];
    out[..POINT_SIZE].copy_from_slice(&point[1..]); // strip the 0x04 prefix
    out[POINT_SIZE..POINT_SIZE + PAYLOAD_SIZE].copy_from_slice(&ciphertext);
    out[POINT_SIZE + PAYLOAD_SIZE..].copy_from_slice(&tag);
    Ok(out)
}

/// Decrypt a ciphertext produced by [`encrypt`].
pub fn decrypt(private: &EcKey<Private>, data: &[u8]) -> Result<[u8; 32], Error> {
    if data.len() < CIPHERTEXT_SIZE {
        bail!("ciphered master key too short ({} bytes)", data.len());
    }
    let group = curve()?;

    let mut encoded = [0u8; POINT_SIZE + 1];
    encoded[0] = 0x04;
    encoded[1..].copy_from_slice(&data[..POINT_SIZE]);
    let mut ctx = BigNumContext::new()?;
    let point = EcPoint::from_bytes(&group, &encoded, &mut ctx)
        .map_err(|err| format_err!("invalid ephemeral EC point - {}", err))?;
    let peer = EcKey::from_public_key(&group, &point)?;

    let shared = derive_shared(private, &peer)?;
    let enc_key = kdf1(&shared, 0);
    let mac_key = kdf1(&shared, 1);

    let ciphertext = &data[POINT_SIZE..POINT_SIZE + PAYLOAD_SIZE];
    let tag = &data[POINT_SIZE + PAYLOAD_SIZE..CIPHERTEXT_SIZE];
    let expected = hmac_sha1(&mac_key, ciphertext)?;
    if !openssl::memcmp::eq(&expected, tag) {
        bail!("integrity check failed");
    }

    let mut payload = [0u8; PAYLOAD_SIZE];
    payload.copy_from_slice(ciphertext);
    aes_ctr::process(&enc_key, &[0u8; 8], &mut payload)?;
    Ok(payload)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() -> Result<(), Error> {
        let key = generate_keypair()?;
        let public = EcKey::from_public_key(key.group(), key.public_key())?;

        let payload = [0x5au8; 32];
        let ciphered = encrypt(&public, &payload)?;
        assert_eq!(ciphered.len(), CIPHERTEXT_SIZE);
        assert_eq!(decrypt(&key, &ciphered)?, payload);
        Ok(())
    }

    #[test]
    fn wrong_key_fails() -> Result<(), Error> {
        let key = generate_keypair()?;
        let public = EcKey::from_public_key(key.group(), key.public_key())?;
        let other = generate_keypair()?;

        let ciphered = encrypt(&public, &[1u8; 32])?;
        assert!(decrypt(&other, &ciphered).is_err());
        Ok(())
    }

    #[test]
    fn tamper_detected() -> Result<(), Error> {
        let key = generate_keypair()?;
        let public = EcKey::from_public_key(key.group(), key.public_key())?;

        let mut ciphered = encrypt(&public, &[2u8; 32])?;
        ciphered[POINT_SIZE + 3] ^= 0x40;
        assert!(decrypt(&key, &ciphered).is_err());
        Ok(())
    }
}
