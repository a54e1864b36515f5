use argon2::{Algorithm, Argon2, Params, Version};
use crate::crypto::aes::{SecureKey, KEY_SIZE};
use crate::error::{AppError, Result};

/// The memory cost for Argon2 in MB.
const ARGON2_MEMORY_MB: u32 = 19;
/// The number of iterations for Argon2.
const ARGON2_ITERATIONS: u32 = 3;
/// The parallelism factor for Argon2.
const ARGON2_PARALLELISM: u32 = 1;

/// Upper bound on the memory cost, so a derivation always has bounded cost.
const MAX_MEMORY_KIB: u32 = 256 * 1024;
/// Upper bound on the iteration count.
const MAX_ITERATIONS: u32 = 10;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: ARGON2_MEMORY_MB * 1024,
            iterations: ARGON2_ITERATIONS,
            parallelism: ARGON2_PARALLELISM,
        }
    }
}

impl KdfParams {
    /// Rejects parameters Argon2 refuses or that exceed the cost ceiling.
    pub fn validate(&self) -> Result<()> {
        if self.memory_kib > MAX_MEMORY_KIB || self.iterations > MAX_ITERATIONS {
            return Err(AppError::Configuration(format!(
                "KDF cost too high (memory {} KiB, {} iterations)",
                self.memory_kib, self.iterations
            )));
        }
        self.to_argon2().map(|_| ())
    }

    fn to_argon2(&self) -> Result<Params> {
        Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| AppError::Configuration(format!("Argon2 params: {}", e)))
    }
}

/// Derives a key from a secret and salt using Argon2id.
pub fn derive_key(secret: &[u8], salt: &[u8], params: &KdfParams) -> Result<SecureKey> {
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2()?);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(secret, salt, &mut key)
        .map_err(|e| AppError::Encryption(format!("Argon2 key derivation error: {}", e)))?;
    Ok(SecureKey::new(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHEAP: KdfParams = KdfParams {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    };

    #[test]
    fn same_salt_same_key() {
        let a = derive_key(b"master-secret", b"0123456789abcdef", &CHEAP).unwrap();
        let b = derive_key(b"master-secret", b"0123456789abcdef", &CHEAP).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn different_salt_different_key() {
        let a = derive_key(b"master-secret", b"0123456789abcdef", &CHEAP).unwrap();
        let b = derive_key(b"master-secret", b"fedcba9876543210", &CHEAP).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn rejects_excessive_cost() {
        let params = KdfParams {
            memory_kib: MAX_MEMORY_KIB + 1,
            ..CHEAP
        };
        assert!(matches!(params.validate(), Err(AppError::Configuration(_))));
    }

    #[test]
    fn default_params_are_valid() {
        assert!(KdfParams::default().validate().is_ok());
    }
}
