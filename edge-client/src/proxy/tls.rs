use anyhow::{Context, Result};
use rustls::crypto::{aws_lc_rs, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// PEM material for the local server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    /// Client certificates must chain to this CA when set.
    pub client_ca: Option<PathBuf>,
}

/// Load TLS server configuration from PEM files.
///
/// If `client_ca` is set, clients must present a certificate signed by it.
pub fn load_server_config(paths: &TlsPaths) -> Result<ServerConfig> {
    let provider = Arc::new(aws_lc_rs::default_provider());
    let cert_chain = load_certs(&paths.cert)?;
    let key = load_private_key(&paths.key)?;

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?;

    let mut config = if let Some(ca_path) = &paths.client_ca {
        let verifier = client_verifier(ca_path, provider)?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(cert_chain, key)
            .context("Failed to create mTLS server config")?
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .context("Failed to create TLS server config")?
    };

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

fn client_verifier(
    ca_path: &Path,
    provider: Arc<CryptoProvider>,
) -> Result<Arc<dyn rustls::server::danger::ClientCertVerifier>> {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        root_store
            .add(cert)
            .context("Failed to add CA certificate to root store")?;
    }

    rustls::server::WebPkiClientVerifier::builder_with_provider(Arc::new(root_store), provider)
        .build()
        .context("Failed to build client certificate verifier")
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("Failed to open cert file: {:?}", path))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<_> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates from {:?}", path))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {:?}", path);
    }

    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("Failed to open key file: {:?}", path))?;
    let mut reader = BufReader::new(file);
    let key = private_key(&mut reader)
        .with_context(|| format!("Failed to parse private key from {:?}", path))?
        .with_context(|| format!("No private key found in {:?}", path))?;

    Ok(key)
}
