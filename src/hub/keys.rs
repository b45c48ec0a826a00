//! The hub's persistent identity key pair.

use crate::transport::{format_public_key, KeyError};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use std::fs;
use std::io::Write;
use std::path::Path;

pub const PRIVATE_KEY_FILE: &str = "id_ed25519";
pub const PUBLIC_KEY_FILE: &str = "id_ed25519.pub";

const PEM_BEGIN: &str = "-----BEGIN FLEETWATCH ED25519 PRIVATE KEY-----";
const PEM_END: &str = "-----END FLEETWATCH ED25519 PRIVATE KEY-----";

/// Loaded key pair plus the public line handed out to agents.
pub struct HubKeys {
    pub signing_key: SigningKey,
    pub public_key: String,
}

impl HubKeys {
    /// Load the key pair from `data_dir`, generating it when neither file
    /// exists. A lone public key is an error: the private half is gone and
    /// silently replacing it would lock the hub out of every agent.
    pub fn load_or_generate(data_dir: &Path) -> Result<Self, KeyError> {
        let private_path = data_dir.join(PRIVATE_KEY_FILE);
        let public_path = data_dir.join(PUBLIC_KEY_FILE);

        match (private_path.exists(), public_path.exists()) {
            (false, false) => Self::generate(data_dir, &private_path, &public_path),
            (false, true) => Err(KeyError::InvalidPrivateKey(format!(
                "{} is missing but {} exists",
                private_path.display(),
                public_path.display()
            ))),
            (true, has_public) => {
                let signing_key = decode_private_key(&fs::read_to_string(&private_path)?)?;
                let public_key = format_public_key(&signing_key.verifying_key());

                if !has_public {
                    tracing::warn!("Public key missing, rewriting {}", public_path.display());
                    fs::write(&public_path, format!("{}\n", public_key))?;
                } else if fs::read_to_string(&public_path)?.trim() != public_key {
                    tracing::warn!(
                        "{} does not match the private key, using the derived key",
                        public_path.display()
                    );
                }

                Ok(Self {
                    signing_key,
                    public_key,
                })
            }
        }
    }

    fn generate(data_dir: &Path, private_path: &Path, public_path: &Path) -> Result<Self, KeyError> {
        fs::create_dir_all(data_dir)?;

        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key = format_public_key(&signing_key.verifying_key());

        write_private(private_path, &encode_private_key(&signing_key))?;
        fs::write(public_path, format!("{}\n", public_key))?;

        tracing::info!("ed25519 key pair generated successfully.");
        tracing::info!("Private key saved to: {}", private_path.display());
        tracing::info!("Public key saved to: {}", public_path.display());

        Ok(Self {
            signing_key,
            public_key,
        })
    }
}

fn encode_private_key(key: &SigningKey) -> String {
    format!("{}\n{}\n{}\n", PEM_BEGIN, STANDARD.encode(key.to_bytes()), PEM_END)
}

fn decode_private_key(text: &str) -> Result<SigningKey, KeyError> {
    let body: String = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && *l != PEM_BEGIN && *l != PEM_END)
        .collect();
    let bytes = STANDARD
        .decode(body)
        .map_err(|e| KeyError::InvalidPrivateKey(e.to_string()))?;
    let seed: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| KeyError::InvalidPrivateKey(format!("expected 32 bytes, got {}", b.len())))?;
    Ok(SigningKey::from_bytes(&seed))
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(contents.as_bytes())
}
