//! Key material handling for Frost backups.
//!
//! One long-lived 32 byte master key protects a whole backup set. It is
//! stored only in encrypted form: ECIES-wrapped inside the index file header,
//! with the ECIES private key kept in a user-level key vault, itself
//! encrypted under a password-derived key. Every multichunk gets a fresh
//! symmetric session key derived from the master key and a random salt.

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::{bail, format_err, Context, Error};
use openssl::ec::EcKey;

pub mod aes_ctr;
pub mod base85;
pub mod ecies;

/// Size of the ECIES-wrapped master key stored in the index main header.
pub const CIPHERED_MASTER_KEY_SIZE: usize = ecies::CIPHERTEXT_SIZE;

/// PBKDF1 iteration count for the password key.
const PBKDF_ITERATIONS: usize = 256;

/// Vault private keys are padded to a multiple of this before encryption.
const VAULT_PAD: usize = 32;

/// Derive the 32 byte password key.
///
/// The password bytes, each repetition followed by a NUL (so "a" and "aa"
/// derive differently), are concatenated until at least 32 bytes, then run
/// through an iterated SHA-256 (PBKDF1 discipline).
pub fn derive_password(password: &str) -> [u8; 32] {
    let mut input = Vec::with_capacity(64);
    while input.len() < 32 {
        input.extend_from_slice(password.as_bytes());
        input.push(0);
    }

    let mut digest = openssl::sha::sha256(&input);
    for _ in 1..PBKDF_ITERATIONS {
        digest = openssl::sha::sha256(&digest);
    }
    digest
}

/// Session key material for one multichunk.
pub struct SessionKey {
    pub key: [u8; 32],
    /// Stored in clear at the head of the multichunk ciphertext.
    pub salt: [u8; 32],
}

/// Holds the master key while the process runs and derives per-multichunk
/// session keys from it.
pub struct KeyFactory {
    master_key: [u8; 32],
}

impl KeyFactory {
    /// Create a new master key and register its private key in the vault.
    ///
    /// Generates an ECIES keypair, derives the master key from 64 bytes of
    /// OS randomness, appends the password-encrypted private key to the
    /// vault and returns the factory together with the ECIES-wrapped master
    /// key for the index file header.
    pub fn create_master_key(
        vault_path: &Path,
        password: &str,
        key_id: &str,
    ) -> Result<(Self, [u8; CIPHERED_MASTER_KEY_SIZE]), Error> {
        if vault_path.exists() {
            check_vault_permissions(vault_path)?;
            if find_vault_entry(vault_path, key_id)?.is_some() {
                bail!(
                    "key id '{}' already exists in key vault {:?}",
                    key_id,
                    vault_path
                );
            }
        } else if let Some(parent) = vault_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| format_err!("unable to create {:?} - {}", parent, err))?;
            }
        }

        let mut random = [0u8; 64];
        proxmox_sys::linux::fill_with_random_data(&mut random)?;
        let master_key = openssl::sha::sha256(&random);

        let keypair = ecies::generate_keypair()?;
        let public = EcKey::from_public_key(keypair.group(), keypair.public_key())?;
        let ciphered_master_key = ecies::encrypt(&public, &master_key)?;

        let der = keypair.private_key_to_der()?;
        let password_key = derive_password(password);

        let mut padded = der.clone();
        let tail = (VAULT_PAD - padded.len() % VAULT_PAD) % VAULT_PAD;
        if tail > 0 {
            let filler = proxmox_sys::linux::random_data(tail)?;
            padded.extend_from_slice(&filler);
        }
        aes_ecb(&password_key, &mut padded, true)?;

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o600)
            .open(vault_path)
            .map_err(|err| format_err!("unable to open key vault {:?} - {}", vault_path, err))?;
        writeln!(file, "{} {}", der.len(), key_id)?;
        writeln!(file, "{}", base85::encode(&padded))?;
        file.flush()?;

        log::info!("created key '{}' in vault {:?}", key_id, vault_path);

        Ok((Self { master_key }, ciphered_master_key))
    }

    /// Recover the master key from the vault and the index file's ciphered
    /// master key.
    pub fn load_private_key(
        vault_path: &Path,
        ciphered_master_key: &[u8],
        password: &str,
        key_id: &str,
    ) -> Result<Self, Error> {
        if !vault_path.exists() {
            bail!("key vault file {:?} does not exist", vault_path);
        }
        check_vault_permissions(vault_path)?;

        let (key_size, encoded) = find_vault_entry(vault_path, key_id)?
            .ok_or_else(|| format_err!("no key '{}' in key vault {:?}", key_id, vault_path))?;

        let mut padded = base85::decode(&encoded)
            .map_err(|err| format_err!("malformed entry in key vault {:?} - {}", vault_path, err))?;
        if key_size == 0 || key_size > padded.len() || padded.len() % VAULT_PAD != 0 {
            bail!("malformed entry in key vault {:?}", vault_path);
        }

        let password_key = derive_password(password);
        aes_ecb(&password_key, &mut padded, false)?;

        let private = EcKey::private_key_from_der(&padded[..key_size]).map_err(|_| {
            format_err!(
                "unable to decode the private key from key vault {:?} (wrong password?)",
                vault_path
            )
        })?;

        let master_key = ecies::decrypt(&private, ciphered_master_key).map_err(|_| {
            format_err!(
                "unable to decrypt the master key with key vault {:?} (wrong password, or wrong remote?)",
                vault_path
            )
        })?;

        Ok(Self { master_key })
    }

    /// Build a factory directly from a raw master key (test helper).
    pub fn with_master_key(master_key: [u8; 32]) -> Self {
        Self { master_key }
    }

    /// Derive a fresh session key for a new multichunk.
    pub fn derive_session_key(&self) -> Result<SessionKey, Error> {
        let mut salt = [0u8; 32];
        proxmox_sys::linux::fill_with_random_data(&mut salt)?;
        // hash the raw randomness so no RNG output reaches the file directly
        let salt = openssl::sha::sha256(&salt);
        Ok(SessionKey {
            key: self.derive_with_salt(&salt),
            salt,
        })
    }

    /// Re-derive the session key for a salt read back from a multichunk.
    pub fn derive_with_salt(&self, salt: &[u8; 32]) -> [u8; 32] {
        let mut hasher = openssl::sha::Sha256::new();
        hasher.update(&self.master_key);
        hasher.update(salt);
        hasher.finish()
    }
}

fn check_vault_permissions(path: &Path) -> Result<(), Error> {
    let stat = nix::sys::stat::stat(path)
        .map_err(|err| format_err!("unable to stat key vault {:?} - {}", path, err))?;
    if stat.st_mode & 0o777 != 0o600 {
        bail!(
            "key vault {:?} has mode {:o}, expected 600",
            path,
            stat.st_mode & 0o777
        );
    }
    Ok(())
}

/// Locate a vault entry by key id, returning the recorded private key size
/// and its base85 payload line.
fn find_vault_entry(path: &Path, key_id: &str) -> Result<Option<(usize, String)>, Error> {
    let content = proxmox_sys::fs::file_get_contents(path)?;
    let content = String::from_utf8(content)
        .with_context(|| format!("key vault {:?} is not valid UTF-8", path))?;

    let mut lines = content.lines();
    while let Some(header) = lines.next() {
        if header.trim().is_empty() {
            continue;
        }
        let payload = lines
            .next()
            .ok_or_else(|| format_err!("truncated entry in key vault {:?}", path))?;
        let mut parts = header.splitn(2, ' ');
        let size: usize = parts
            .next()
            .unwrap_or("")
            .parse()
            .map_err(|_| format_err!("malformed entry header in key vault {:?}", path))?;
        let id = parts.next().unwrap_or("");
        if id == key_id {
            return Ok(Some((size, payload.trim().to_string())));
        }
    }
    Ok(None)
}

/// AES-256-ECB over a block-aligned buffer, in place. Used only for vault
/// entries, which are single opaque blobs under a throwaway padding.
fn aes_ecb(key: &[u8; 32], data: &mut Vec<u8>, encrypt: bool) -> Result<(), Error> {
    use openssl::symm::{Cipher, Crypter, Mode};

    let mode = if encrypt { Mode::Encrypt } else { Mode::Decrypt };
    let mut crypter = Crypter::new(Cipher::aes_256_ecb(), mode, key, None)?;
    crypter.pad(false);

    let mut out = vec![0u8; data.len() + 16];
    let mut n = crypter.update(data, &mut out)?;
    n += crypter.finalize(&mut out[n..])?;
    out.truncate(n);
    *data = out;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn temp_vault(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("frost-keyvault-test-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn password_derivation_is_stable() {
        assert_eq!(derive_password("abc"), derive_password("abc"));
        assert_ne!(derive_password("a"), derive_password("aa"));
    }

    #[test]
    fn vault_round_trip() -> Result<(), Error> {
        let vault = temp_vault("roundtrip");
        let (factory, ciphered) = KeyFactory::create_master_key(&vault, "secret", "host1")?;

        let loaded = KeyFactory::load_private_key(&vault, &ciphered, "secret", "host1")?;
        assert_eq!(factory.master_key, loaded.master_key);

        // second key id appends to the same vault
        let (_, ciphered2) = KeyFactory::create_master_key(&vault, "other", "host2")?;
        KeyFactory::load_private_key(&vault, &ciphered2, "other", "host2")?;

        std::fs::remove_file(&vault)?;
        Ok(())
    }

    #[test]
    fn wrong_password_names_the_vault() -> Result<(), Error> {
        let vault = temp_vault("wrongpw");
        let (_, ciphered) = KeyFactory::create_master_key(&vault, "secret", "host1")?;

        let err = KeyFactory::load_private_key(&vault, &ciphered, "not-it", "host1")
            .expect_err("wrong password must not yield a master key");
        let msg = err.to_string();
        assert!(msg.contains("frost-keyvault-test"), "message: {}", msg);
        assert!(!msg.contains("not-it"), "message leaks the password: {}", msg);

        std::fs::remove_file(&vault)?;
        Ok(())
    }

    #[test]
    fn duplicate_key_id_rejected() -> Result<(), Error> {
        let vault = temp_vault("dup");
        KeyFactory::create_master_key(&vault, "secret", "host1")?;
        assert!(KeyFactory::create_master_key(&vault, "secret", "host1").is_err());
        std::fs::remove_file(&vault)?;
        Ok(())
    }

    #[test]
    fn session_keys_differ_per_salt() -> Result<(), Error> {
        let factory = KeyFactory::with_master_key([9u8; 32]);
        let a = factory.derive_session_key()?;
        let b = factory.derive_session_key()?;
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.key, b.key);
        assert_eq!(factory.derive_with_salt(&a.salt), a.key);
        Ok(())
    }
}
