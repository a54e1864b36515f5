//! Field-level encryption for personal data.
//!
//! Every call derives a fresh key from the master secret and a random salt
//! (Argon2id), then seals the value with AES-256-GCM under a random IV.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::config::EncryptionConfig;
use crate::crypto::aes::{self, NONCE_SIZE, TAG_SIZE};
use crate::crypto::kdf;
use crate::error::{AppError, Result};
use crate::models::personal_data::{EncryptedField, FieldValue, PersonalRecord};

/// The size of the per-operation KDF salt in bytes.
pub const SALT_SIZE: usize = 16;

/// Suffix of the marker key added next to each encrypted field.
pub const ENCRYPTED_MARKER_SUFFIX: &str = "_encrypted";

/// Columns that are always encrypted at rest.
pub const SENSITIVE_FIELDS: &[&str] = &[
    "first_name",
    "last_name",
    "email",
    "telefon",
    "strasse",
    "hausnummer",
    "arbeitgeber",
    "netto_monat_einkommen",
    "jahreseinkommen_vor_geburt",
    "partner_name",
    "besondere_umstaende",
    "besondere_beduerfnisse",
];

/// Encrypts and decrypts personal data fields.
#[derive(Clone)]
pub struct EncryptionEngine {
    config: Arc<EncryptionConfig>,
}

impl EncryptionEngine {
    /// Creates a new engine. Call [`validate_configuration`](Self::validate_configuration)
    /// at startup; encryption calls also fail with `Configuration` if the
    /// master secret is missing.
    pub fn new(config: EncryptionConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Fails unless a master secret of at least 32 characters is configured.
    pub fn validate_configuration(&self) -> Result<()> {
        self.config.validate()
    }

    fn master_secret(&self) -> Result<&[u8]> {
        self.config
            .master_secret
            .as_ref()
            .map(|s| s.as_bytes())
            .ok_or_else(|| AppError::Configuration("ENCRYPTION_KEY must be set".to_string()))
    }

    /// Encrypts a single field value.
    pub fn encrypt_field(&self, plaintext: &str) -> Result<EncryptedField> {
        let secret = self.master_secret()?;
        let salt = aes::random_bytes(SALT_SIZE);
        let key = kdf::derive_key(secret, &salt, &self.config.kdf)?;

        let sealed = aes::seal(&key, plaintext.as_bytes())?;

        Ok(EncryptedField {
            ciphertext: sealed.ciphertext,
            iv: sealed.nonce.to_vec(),
            salt,
            auth_tag: sealed.tag.to_vec(),
        })
    }

    /// Decrypts a single field value.
    ///
    /// Malformed input, a tag mismatch and non-UTF-8 plaintext all fail with
    /// the same `AppError::Decryption`.
    pub fn decrypt_field(&self, field: &EncryptedField) -> Result<String> {
        let secret = self.master_secret()?;

        let nonce: [u8; NONCE_SIZE] = field
            .iv
            .as_slice()
            .try_into()
            .map_err(|_| AppError::Decryption)?;
        let tag: [u8; TAG_SIZE] = field
            .auth_tag
            .as_slice()
            .try_into()
            .map_err(|_| AppError::Decryption)?;
        if field.salt.len() != SALT_SIZE {
            return Err(AppError::Decryption);
        }

        let key = kdf::derive_key(secret, &field.salt, &self.config.kdf)
            .map_err(|_| AppError::Decryption)?;
        let plaintext = Zeroizing::new(aes::open(&key, &field.ciphertext, &nonce, &tag)?);

        String::from_utf8(plaintext.to_vec()).map_err(|_| AppError::Decryption)
    }

    /// Encrypts every non-blank text value whose key is in [`SENSITIVE_FIELDS`]
    /// and marks it with `<key>_encrypted = true`. Other fields pass through.
    ///
    /// A record that already carries a marker key for a sensitive field is
    /// rejected with `Validation`.
    pub fn encrypt_personal_data_object(&self, record: PersonalRecord) -> Result<PersonalRecord> {
        if let Some((key, _)) = record.iter().find(|(key, _)| marker_base(key).is_some()) {
            return Err(AppError::Validation(format!("{} is a reserved marker key", key)));
        }

        let mut encrypted = PersonalRecord::new();

        for (key, value) in record {
            let sealed = match value.as_non_blank_text() {
                Some(text) if SENSITIVE_FIELDS.contains(&key.as_str()) => {
                    Some(self.encrypt_field(text)?)
                }
                _ => None,
            };

            match sealed {
                Some(field) => {
                    encrypted.insert(format!("{}{}", key, ENCRYPTED_MARKER_SUFFIX), true);
                    encrypted.insert(key, field);
                }
                None => encrypted.insert(key, value),
            }
        }

        tracing::debug!("Encrypted personal data record ({} keys)", encrypted.len());
        Ok(encrypted)
    }

    /// Reverses [`encrypt_personal_data_object`](Self::encrypt_personal_data_object).
    ///
    /// Markers of sensitive fields are dropped; any other `_encrypted` key
    /// passes through. A marked field that fails to decrypt becomes
    /// [`FieldValue::Undecryptable`] instead of failing the whole record.
    pub fn decrypt_personal_data_object(&self, record: PersonalRecord) -> Result<PersonalRecord> {
        self.master_secret()?;

        let marked: Vec<String> = record
            .iter()
            .filter_map(|(key, value)| {
                let base = marker_base(key)?;
                matches!(value, FieldValue::Bool(true)).then(|| base.to_string())
            })
            .collect();

        let mut decrypted = PersonalRecord::new();

        for (key, value) in record {
            if marker_base(&key).is_some_and(|base| marked.iter().any(|m| m == base)) {
                continue;
            }

            match value {
                FieldValue::Encrypted(ref field) if marked.contains(&key) => {
                    match self.decrypt_field(field) {
                        Ok(plain) => decrypted.insert(key, plain),
                        Err(_) => {
                            tracing::error!(field = %key, "Failed to decrypt field");
                            decrypted.insert(key, FieldValue::Undecryptable);
                        }
                    }
                }
                other => decrypted.insert(key, other),
            }
        }

        Ok(decrypted)
    }

    /// Deterministic salted SHA-256 digest for equality search. One-way.
    pub fn hash_for_search(&self, value: &str) -> Result<String> {
        let search_key = self.search_key()?;
        let digest = Sha256::new()
            .chain_update(search_key.as_slice())
            .chain_update(value.as_bytes())
            .finalize();
        Ok(hex::encode(digest))
    }

    /// Compares a value against a stored search digest in constant time.
    pub fn verify_search_hash(&self, value: &str, digest: &str) -> Result<bool> {
        let computed = self.hash_for_search(value)?;
        Ok(computed.as_bytes().ct_eq(digest.as_bytes()).into())
    }

    fn search_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        if let Some(salt) = &self.config.search_salt {
            return Ok(Zeroizing::new(salt.as_bytes().to_vec()));
        }

        // No dedicated salt: key the digest off the master secret instead.
        let secret = self.master_secret()?;
        let derived = Sha256::new()
            .chain_update(b"trustgate/search-salt/v1")
            .chain_update(secret)
            .finalize();
        Ok(Zeroizing::new(derived.to_vec()))
    }
}

/// Returns the sensitive field a marker key belongs to.
fn marker_base(key: &str) -> Option<&str> {
    key.strip_suffix(ENCRYPTED_MARKER_SUFFIX)
        .filter(|base| SENSITIVE_FIELDS.contains(base))
}

/// Generates `length` random bytes from the OS source, hex-encoded.
pub fn generate_secure_token(length: usize) -> String {
    hex::encode(aes::random_bytes(length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::KdfParams;

    const SECRET: &str = "unit-test-master-secret-0123456789abcdef";

    fn engine() -> EncryptionEngine {
        let mut config = EncryptionConfig::with_secret(SECRET);
        config.kdf = KdfParams {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        };
        EncryptionEngine::new(config)
    }

    #[test]
    fn round_trips_printable_strings() {
        let engine = engine();
        for s in ["", "a", "Müller-Lüdenscheidt", "Straße 12b, 20095 Hamburg", "~!@#$%^&*()"] {
            let field = engine.encrypt_field(s).unwrap();
            assert_eq!(engine.decrypt_field(&field).unwrap(), s);
        }
    }

    #[test]
    fn salt_and_iv_are_fresh_per_call() {
        let engine = engine();
        let a = engine.encrypt_field("same").unwrap();
        let b = engine.encrypt_field("same").unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.iv, b.iv);
        assert_eq!(a.salt.len(), SALT_SIZE);
        assert_eq!(a.iv.len(), NONCE_SIZE);
        assert_eq!(a.auth_tag.len(), TAG_SIZE);
    }

    #[test]
    fn flipping_any_ciphertext_bit_fails() {
        let engine = engine();
        let field = engine.encrypt_field("Erika").unwrap();
        for byte in 0..field.ciphertext.len() {
            for bit in 0..8 {
                let mut tampered = field.clone();
                tampered.ciphertext[byte] ^= 1 << bit;
                assert!(matches!(engine.decrypt_field(&tampered), Err(AppError::Decryption)));
            }
        }
    }

    #[test]
    fn flipping_tag_bit_fails() {
        let engine = engine();
        let field = engine.encrypt_field("Erika").unwrap();
        for byte in 0..TAG_SIZE {
            let mut tampered = field.clone();
            tampered.auth_tag[byte] ^= 0x80;
            assert!(matches!(engine.decrypt_field(&tampered), Err(AppError::Decryption)));
        }
    }

    #[test]
    fn malformed_lengths_fail_closed() {
        let engine = engine();
        let mut field = engine.encrypt_field("x").unwrap();
        field.iv.pop();
        assert!(matches!(engine.decrypt_field(&field), Err(AppError::Decryption)));

        let mut field = engine.encrypt_field("x").unwrap();
        field.auth_tag.clear();
        assert!(matches!(engine.decrypt_field(&field), Err(AppError::Decryption)));
    }

    #[test]
    fn missing_secret_is_configuration_error() {
        let engine = EncryptionEngine::new(EncryptionConfig {
            master_secret: None,
            search_salt: None,
            kdf: KdfParams::default(),
        });
        assert!(matches!(engine.encrypt_field("x"), Err(AppError::Configuration(_))));
        assert!(matches!(engine.validate_configuration(), Err(AppError::Configuration(_))));
    }

    #[test]
    fn encrypts_only_sensitive_non_blank_fields() {
        let engine = engine();
        let record: PersonalRecord = [
            ("first_name", FieldValue::from("Erika")),
            ("last_name", FieldValue::from("   ")),
            ("plz", FieldValue::from("20095")),
            ("kinder_anzahl", FieldValue::from(2i64)),
        ]
        .into_iter()
        .collect();

        let encrypted = engine.encrypt_personal_data_object(record).unwrap();

        assert!(matches!(encrypted.get("first_name"), Some(FieldValue::Encrypted(_))));
        assert_eq!(encrypted.get("first_name_encrypted"), Some(&FieldValue::Bool(true)));
        assert_eq!(encrypted.get("last_name"), Some(&FieldValue::from("   ")));
        assert!(!encrypted.contains_key("last_name_encrypted"));
        assert_eq!(encrypted.get("plz"), Some(&FieldValue::from("20095")));
        assert_eq!(encrypted.get("kinder_anzahl"), Some(&FieldValue::Integer(2)));

        let decrypted = engine.decrypt_personal_data_object(encrypted).unwrap();
        assert_eq!(decrypted.get("first_name"), Some(&FieldValue::from("Erika")));
        assert!(!decrypted.contains_key("first_name_encrypted"));
        assert_eq!(decrypted.len(), 4);
    }

    #[test]
    fn unrelated_encrypted_suffix_survives_round_trip() {
        let engine = engine();
        let record: PersonalRecord = [
            ("first_name", FieldValue::from("Erika")),
            ("notes_encrypted", FieldValue::from("keep me")),
            ("archive_encrypted", FieldValue::Bool(true)),
        ]
        .into_iter()
        .collect();

        let encrypted = engine.encrypt_personal_data_object(record.clone()).unwrap();
        assert_eq!(encrypted.get("notes_encrypted"), Some(&FieldValue::from("keep me")));

        let decrypted = engine.decrypt_personal_data_object(encrypted).unwrap();
        assert_eq!(decrypted, record);
    }

    #[test]
    fn preexisting_marker_is_rejected() {
        let engine = engine();
        let record: PersonalRecord = [
            ("email", FieldValue::from("erika@example.org")),
            ("email_encrypted", FieldValue::from("spoofed")),
        ]
        .into_iter()
        .collect();

        assert!(matches!(
            engine.encrypt_personal_data_object(record),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn corrupted_field_becomes_sentinel() {
        let engine = engine();
        let record: PersonalRecord = [
            ("first_name", FieldValue::from("Erika")),
            ("email", FieldValue::from("erika@example.org")),
        ]
        .into_iter()
        .collect();
        let encrypted = engine.encrypt_personal_data_object(record).unwrap();

        let mut corrupted = PersonalRecord::new();
        for (key, value) in encrypted {
            match value {
                FieldValue::Encrypted(mut field) if key == "email" => {
                    field.auth_tag[0] ^= 1;
                    corrupted.insert(key, field);
                }
                other => corrupted.insert(key, other),
            }
        }

        let decrypted = engine.decrypt_personal_data_object(corrupted).unwrap();
        assert_eq!(decrypted.get("first_name"), Some(&FieldValue::from("Erika")));
        assert_eq!(decrypted.get("email"), Some(&FieldValue::Undecryptable));
    }

    #[test]
    fn search_hash_is_deterministic_and_verifiable() {
        let engine = engine();
        let a = engine.hash_for_search("erika@example.org").unwrap();
        let b = engine.hash_for_search("erika@example.org").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, engine.hash_for_search("max@example.org").unwrap());
        assert!(engine.verify_search_hash("erika@example.org", &a).unwrap());
        assert!(!engine.verify_search_hash("max@example.org", &a).unwrap());
    }

    #[test]
    fn secure_token_has_requested_length() {
        let token = generate_secure_token(32);
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_secure_token(32));
    }
}
