use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jsonwebtoken::{DecodingKey, EncodingKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tracing::{info, warn};

use crate::error::CryptoError;

pub const KEY_BITS: usize = 2048;

/// Where the node keeps its PEM files.
#[derive(Debug, Clone)]
pub struct KeyPaths {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
}

/// The node's signing identity. The private half never leaves this struct
/// except as the PEM written to `KeyPaths::private_key`.
#[derive(Clone)]
pub struct NodeKeys {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    private_pem: String,
    public_pem: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl fmt::Debug for NodeKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKeys")
            .field("public_pem", &self.public_pem)
            .finish_non_exhaustive()
    }
}

impl NodeKeys {
    /// Generate a fresh 2048-bit pair.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut rng = rand::rngs::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, KEY_BITS)?;
        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Encoding(e.to_string()))?
            .as_str()
            .to_owned();
        let public_key = RsaPublicKey::from(&private_key);
        let public_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;

        Self::assemble(private_key, public_key, private_pem, public_pem)
    }

    /// Parse a PKCS#8 private key and SPKI public key. The halves must match.
    pub fn from_pem(private_pem: &str, public_pem: &str) -> Result<Self, CryptoError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_pem)
            .map_err(|e| CryptoError::Load(format!("private key: {}", e)))?;
        let public_key = RsaPublicKey::from_public_key_pem(public_pem)
            .map_err(|e| CryptoError::Load(format!("public key: {}", e)))?;

        if RsaPublicKey::from(&private_key) != public_key {
            return Err(CryptoError::Load(
                "public key does not match private key".to_string(),
            ));
        }

        Self::assemble(
            private_key,
            public_key,
            private_pem.to_owned(),
            public_pem.to_owned(),
        )
    }

    fn assemble(
        private_key: RsaPrivateKey,
        public_key: RsaPublicKey,
        private_pem: String,
        public_pem: String,
    ) -> Result<Self, CryptoError> {
        let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let decoding_key = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;

        Ok(Self {
            private_key,
            public_key,
            private_pem,
            public_pem,
            encoding_key,
            decoding_key,
        })
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    /// Public PEM as sent in the `X-Node-Public-Key` header.
    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.public_pem.as_bytes())
    }

    pub fn jwt_encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    pub fn jwt_decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }
}

/// Load the key pair from disk, or generate and persist a new one when the
/// files are missing or unreadable.
///
/// Only a failure to *write* the generated pair is an error.
pub fn ensure_key_pair(paths: &KeyPaths) -> Result<NodeKeys, CryptoError> {
    match load_key_pair(paths) {
        Ok(keys) => {
            info!("Loaded node key pair from {:?}", paths.private_key);
            return Ok(keys);
        }
        Err(e) => {
            warn!("No usable key pair ({}), generating a new one", e);
        }
    }

    let keys = NodeKeys::generate()?;
    write_key_file(&paths.private_key, &keys.private_pem)?;
    write_key_file(&paths.public_key, &keys.public_pem)?;

    info!(
        "Generated new node key pair: private={:?}, public={:?}",
        paths.private_key, paths.public_key
    );
    Ok(keys)
}

fn load_key_pair(paths: &KeyPaths) -> Result<NodeKeys, CryptoError> {
    let private_pem = fs::read_to_string(&paths.private_key)
        .map_err(|e| CryptoError::Load(format!("{:?}: {}", paths.private_key, e)))?;
    let public_pem = fs::read_to_string(&paths.public_key)
        .map_err(|e| CryptoError::Load(format!("{:?}: {}", paths.public_key, e)))?;

    NodeKeys::from_pem(&private_pem, &public_pem)
}

fn write_key_file(path: &Path, contents: &str) -> Result<(), CryptoError> {
    let persist_err = |source| CryptoError::Persist {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(persist_err)?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(persist_err)?;
    file.write_all(contents.as_bytes()).map_err(persist_err)?;
    file.sync_all().map_err(persist_err)?;

    // The file may have existed with looser permissions before.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(persist_err)?;
    }

    Ok(())
}

/// RSASSA-PKCS1-v1_5 / SHA-256 over the UTF-8 bytes of `data`, base64 encoded.
pub fn sign_data(data: &str, private_key: &RsaPrivateKey) -> Result<String, CryptoError> {
    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    let signature = signing_key
        .try_sign(data.as_bytes())
        .map_err(|e| CryptoError::Signing(e.to_string()))?;

    Ok(STANDARD.encode(signature.to_bytes()))
}

/// Malformed base64 or a mismatched signature both yield `false`.
pub fn verify_signature(data: &str, signature: &str, public_key: &RsaPublicKey) -> bool {
    let Ok(bytes) = STANDARD.decode(signature) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(bytes.as_slice()) else {
        return false;
    };

    VerifyingKey::<Sha256>::new(public_key.clone())
        .verify(data.as_bytes(), &signature)
        .is_ok()
}
