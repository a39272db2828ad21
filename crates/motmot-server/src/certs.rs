//! Server certificate bootstrap and CSR signing.

use anyhow::{Context, Result, bail};
use rcgen::{
    CertificateParams, CertificateSigningRequestParams, DistinguishedName, DnType, KeyPair,
};
use std::path::Path;

/// Write a self-signed certificate for `domain` and its private key unless
/// both files already exist. Returns whether anything was generated.
pub fn ensure_self_signed(cert_path: &Path, key_path: &Path, domain: &str) -> Result<bool> {
    match (cert_path.exists(), key_path.exists()) {
        (true, true) => return Ok(false),
        (false, false) => {}
        _ => bail!(
            "only one of {} and {} exists; refusing to overwrite it",
            cert_path.display(),
            key_path.display()
        ),
    }

    let mut params =
        CertificateParams::new(vec![domain.to_string()]).context("invalid certificate domain")?;
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, domain);
    name.push(DnType::OrganizationName, "motmot");
    name.push(DnType::OrganizationalUnitName, "server");
    params.distinguished_name = name;

    let key = KeyPair::generate().context("failed to generate server key")?;
    let cert = params
        .self_signed(&key)
        .context("failed to self-sign server certificate")?;

    for path in [cert_path, key_path] {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    std::fs::write(cert_path, cert.pem())
        .with_context(|| format!("failed to write {}", cert_path.display()))?;
    std::fs::write(key_path, key.serialize_pem())
        .with_context(|| format!("failed to write {}", key_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set permissions on {}", key_path.display()))?;
    }

    tracing::info!(%domain, cert = %cert_path.display(), "generated self-signed certificate");
    Ok(true)
}

/// Sign a PEM certificate signing request with the server's own
/// certificate and key. Returns the issued certificate as PEM.
pub fn sign_csr(csr_pem: &str, cert_path: &Path, key_path: &Path) -> Result<String> {
    let key_pem = std::fs::read_to_string(key_path)
        .with_context(|| format!("failed to read {}", key_path.display()))?;
    let cert_pem = std::fs::read_to_string(cert_path)
        .with_context(|| format!("failed to read {}", cert_path.display()))?;

    let key = KeyPair::from_pem(&key_pem)
        .with_context(|| format!("failed to parse private key {}", key_path.display()))?;
    let issuer = CertificateParams::from_ca_cert_pem(&cert_pem)
        .with_context(|| format!("failed to parse certificate {}", cert_path.display()))?
        .self_signed(&key)
        .context("server key does not match its certificate")?;

    let csr = CertificateSigningRequestParams::from_pem(csr_pem)
        .context("failed to parse certificate signing request")?;
    let signed = csr
        .signed_by(&issuer, &key)
        .context("failed to sign certificate request")?;
    Ok(signed.pem())
}
