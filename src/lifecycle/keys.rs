//! SSH key material for sandbox access

use russh_keys::key::KeyPair;
use russh_keys::PublicKeyBase64;

use crate::error::{ApiError, ApiResult};

/// Generate an Ed25519 SSH keypair.
///
/// Returns `(public_key, private_key)`: the public key as an OpenSSH
/// authorized-keys line, the private key PEM-encoded.
pub fn generate_ssh_keypair() -> ApiResult<(String, String)> {
    let key = KeyPair::generate_ed25519();

    let public_key = format!("{} {}", key.name(), key.public_key_base64());

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem)
        .map_err(|e| ApiError::External(format!("SSH key encoding failed: {}", e)))?;
    let private_key = String::from_utf8(pem)
        .map_err(|e| ApiError::External(format!("SSH key encoding failed: {}", e)))?;

    Ok((public_key, private_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_has_openssh_public_line_and_pem_private() {
        let (public_key, private_key) = generate_ssh_keypair().unwrap();

        assert!(public_key.starts_with("ssh-ed25519 "));
        assert_eq!(public_key.lines().count(), 1);
        assert!(private_key.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn keypairs_are_unique() {
        let (a, _) = generate_ssh_keypair().unwrap();
        let (b, _) = generate_ssh_keypair().unwrap();
        assert_ne!(a, b);
    }
}
