//! OpenPGP key material: loading keys, sealing and opening envelopes,
//! and generating new keypairs.
//!
//! Envelopes are standard OpenPGP public-key encrypted messages (hybrid:
//! a fresh session key per value, wrapped once per recipient), carried
//! base64-encoded in parameter files.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use pgp::composed::{
	Deserializable, KeyType, Message, SecretKeyParamsBuilder, SignedPublicKey, SignedSecretKey,
};
use pgp::crypto::sym::SymmetricKeyAlgorithm;
use pgp::ser::Serialize;
use pgp::types::{KeyTrait, SecretKeyTrait};
use tracing::{debug, warn};

use super::SecretsError;

/// The configured private key, used to open envelopes.
pub struct Keyring {
	secret: SignedSecretKey,
	passphrase: Option<String>,
}

impl Keyring {
	/// Load an armored private key from disk.
	pub fn load(private_key: &Path, passphrase: Option<String>) -> Result<Self, SecretsError> {
		let data = fs::read(private_key).map_err(|source| SecretsError::Io {
			path: private_key.display().to_string(),
			source,
		})?;
		let (secret, _headers) = SignedSecretKey::from_armor_single(Cursor::new(data))
			.map_err(|e| SecretsError::Key {
				path: private_key.display().to_string(),
				reason: e.to_string(),
			})?;
		Ok(Self { secret, passphrase })
	}

	/// Open one envelope. Any failure (wrong key, wrong passphrase, garbage)
	/// is reported uniformly; the caller attaches the parameter key.
	pub fn open(&self, envelope: &[u8]) -> Result<String, SecretsError> {
		let message = Message::from_bytes(Cursor::new(envelope))
			.map_err(|e| SecretsError::Envelope(e.to_string()))?;
		let passphrase = self.passphrase.clone().unwrap_or_default();
		let (mut decrypted, _key_ids) = message
			.decrypt(|| passphrase, &[&self.secret])
			.map_err(|e| SecretsError::Envelope(e.to_string()))?;
		let decrypted_message = decrypted
			.next()
			.ok_or_else(|| SecretsError::Envelope("empty message".to_string()))?
			.map_err(|e| SecretsError::Envelope(e.to_string()))?;
		let content = decrypted_message
			.get_content()
			.map_err(|e| SecretsError::Envelope(e.to_string()))?
			.ok_or_else(|| SecretsError::Envelope("empty message".to_string()))?;
		String::from_utf8(content).map_err(|e| SecretsError::Envelope(e.to_string()))
	}
}

/// Seal `plaintext` for every recipient. Returns the binary envelope.
pub fn seal(plaintext: &str, recipients: &[SignedPublicKey]) -> Result<Vec<u8>, SecretsError> {
	let mut rng = rand::thread_rng();
	let refs: Vec<&SignedPublicKey> = recipients.iter().collect();
	let message = Message::new_literal("", plaintext);
	let encrypted = message
		.encrypt_to_keys(&mut rng, SymmetricKeyAlgorithm::AES256, &refs)
		.map_err(|e| SecretsError::Envelope(e.to_string()))?;
	encrypted
		.to_bytes()
		.map_err(|e| SecretsError::Envelope(e.to_string()))
}

/// Read every parseable armored public key below `dir` (flat, `*.key` files).
pub fn load_public_keys(dir: &Path) -> Result<Vec<SignedPublicKey>, SecretsError> {
	let entries = fs::read_dir(dir).map_err(|source| SecretsError::Io {
		path: dir.display().to_string(),
		source,
	})?;
	let mut paths: Vec<PathBuf> = entries
		.filter_map(|e| e.ok().map(|e| e.path()))
		.filter(|p| p.extension().is_some_and(|ext| ext == "key"))
		.collect();
	paths.sort();

	let mut keys = Vec::new();
	for path in paths {
		let data = match fs::read(&path) {
			Ok(data) => data,
			Err(e) => {
				warn!(path = %path.display(), error = %e, "skipping unreadable key file");
				continue;
			}
		};
		match SignedPublicKey::from_armor_single(Cursor::new(data)) {
			Ok((key, _)) => {
				debug!(path = %path.display(), "loaded public key");
				keys.push(key);
			}
			Err(e) => {
				// Private keys and stray files live in the same directory.
				debug!(path = %path.display(), error = %e, "not a public key, skipping");
			}
		}
	}

	if keys.is_empty() {
		return Err(SecretsError::NoPublicKeys {
			dir: dir.display().to_string(),
		});
	}
	Ok(keys)
}

/// Hex fingerprints of the recipient set, comma-joined, for the trailing
/// fingerprint block of a parameter file.
pub fn fingerprints(keys: &[SignedPublicKey]) -> String {
	keys.iter()
		.map(|key| hex(&key.fingerprint()))
		.collect::<Vec<_>>()
		.join(",")
}

fn hex(bytes: &[u8]) -> String {
	bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// A freshly generated keypair, armored.
pub struct GeneratedKeypair {
	pub public: String,
	pub private: String,
}

/// Generate an RSA keypair for `name <email>`.
pub fn generate(name: &str, email: &str) -> Result<GeneratedKeypair, SecretsError> {
	let params = SecretKeyParamsBuilder::default()
		.key_type(KeyType::Rsa(2048))
		.can_create_certificates(true)
		.can_sign(true)
		.can_encrypt(true)
		.primary_user_id(format!("{} <{}>", name, email))
		.build()
		.map_err(|e| SecretsError::Keygen(e.to_string()))?;
	let secret = params
		.generate()
		.map_err(|e| SecretsError::Keygen(e.to_string()))?;
	let signed_secret = secret
		.sign(String::new)
		.map_err(|e| SecretsError::Keygen(e.to_string()))?;
	let signed_public = signed_secret
		.public_key()
		.sign(&signed_secret, String::new)
		.map_err(|e| SecretsError::Keygen(e.to_string()))?;

	Ok(GeneratedKeypair {
		public: signed_public
			.to_armored_string(None)
			.map_err(|e| SecretsError::Keygen(e.to_string()))?,
		private: signed_secret
			.to_armored_string(None)
			.map_err(|e| SecretsError::Keygen(e.to_string()))?,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hex_encodes_fingerprint_bytes() {
		assert_eq!(hex(&[0x00, 0xab, 0xff]), "00abff");
	}

	// Keypair generation and a full seal/open roundtrip. RSA generation is
	// slow, so one test covers the whole path.
	#[test]
	fn generated_keypair_seals_and_opens() {
		let pair = generate("tester", "tester@example.com").unwrap();
		let dir = tempfile::tempdir().unwrap();
		let private_path = dir.path().join("private.key");
		std::fs::write(&private_path, &pair.private).unwrap();
		std::fs::write(dir.path().join("tester.key"), &pair.public).unwrap();

		let keyring = Keyring::load(&private_path, None).unwrap();
		let recipients = load_public_keys(dir.path()).unwrap();
		assert_eq!(recipients.len(), 1);

		let envelope = seal("s3cret", &recipients).unwrap();
		assert_eq!(keyring.open(&envelope).unwrap(), "s3cret");
	}

	#[test]
	fn foreign_envelope_fails_to_open() {
		let ours = generate("a", "a@example.com").unwrap();
		let theirs = generate("b", "b@example.com").unwrap();
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("private.key"), &ours.private).unwrap();
		std::fs::write(dir.path().join("b.key"), &theirs.public).unwrap();

		let keyring = Keyring::load(&dir.path().join("private.key"), None).unwrap();
		let recipients = load_public_keys(dir.path()).unwrap();
		let envelope = seal("hidden", &recipients).unwrap();
		assert!(keyring.open(&envelope).is_err());
	}
}
