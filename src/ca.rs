//! CA provisioner. Generates (or reuses) the proxy's self-signed CA
//! and installs it into the system trust store.
//!
//! rcgen does not generate RSA keys itself, so the RSA-2048 key material is
//! produced with the `rsa` crate and handed to rcgen as a signing key, the
//! same split rcgen's own RSA test fixtures use.

use std::path::{Path, PathBuf};

use rcgen::{CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, SanType, SerialNumber};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::rand_core::RngCore;
use rsa::RsaPrivateKey;
use tokio::process::Command;

use crate::error::InitError;

const KEY_BITS: usize = 2048;
const VALIDITY_YEARS: i64 = 10;

pub struct CaFiles {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Ensure a CA keypair exists at `PROXY_DIR/certs/` and is installed into the
/// system trust store. Reuses an existing, parseable keypair across boots.
pub async fn provision(
    proxy_dir: &Path,
    uid: nix::unistd::Uid,
    gid: nix::unistd::Gid,
    product: &str,
) -> Result<CaFiles, InitError> {
    let certs_dir = proxy_dir.join("certs");
    crate::platform::ensure_dir_owned(&certs_dir, uid, gid).map_err(|e| InitError::stage(&certs_dir, e))?;

    let cert_path = certs_dir.join("ca.crt");
    let key_path = certs_dir.join("ca.key");

    if !existing_pair_is_valid(&cert_path, &key_path) {
        tracing::info!("generating CA keypair");
        generate(&cert_path, &key_path, product)?;
        set_mode(&key_path, 0o600)?;
        set_mode(&cert_path, 0o644)?;
    } else {
        tracing::debug!("reusing existing CA keypair");
    }

    install_into_system_trust(&cert_path, product).await?;

    Ok(CaFiles { cert_path, key_path })
}

fn existing_pair_is_valid(cert_path: &Path, key_path: &Path) -> bool {
    let Ok(cert_pem) = std::fs::read_to_string(cert_path) else { return false };
    let Ok(key_pem) = std::fs::read_to_string(key_path) else { return false };
    cert_pem.contains("BEGIN CERTIFICATE") && KeyPair::from_pem(&key_pem).is_ok()
}

fn generate(cert_path: &Path, key_path: &Path, product: &str) -> Result<(), InitError> {
    let mut rng = rsa::rand_core::OsRng;
    let rsa_key = RsaPrivateKey::new(&mut rng, KEY_BITS).map_err(|e| InitError::Crypto(e.to_string()))?;
    let key_pem = rsa_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| InitError::Crypto(e.to_string()))?;
    let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| InitError::Crypto(e.to_string()))?;

    let mut params = CertificateParams::new(Vec::<String>::new()).map_err(|e| InitError::Crypto(e.to_string()))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, format!("{product} Proxy"));
    dn.push(DnType::CommonName, format!("{product} Proxy CA"));
    params.distinguished_name = dn;

    let mut serial_bytes = [0u8; 16];
    rng.fill_bytes(&mut serial_bytes);
    params.serial_number = Some(SerialNumber::from_slice(&serial_bytes));

    params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Constrained(0));
    params.key_usages = vec![
        rcgen::KeyUsagePurpose::KeyCertSign,
        rcgen::KeyUsagePurpose::CrlSign,
    ];
    params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
    params.subject_alt_names = vec![
        SanType::DnsName("localhost".try_into().map_err(|_| InitError::Crypto("invalid SAN".into()))?),
        SanType::IpAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
        SanType::IpAddress(std::net::IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)),
    ];
    let not_before = time::OffsetDateTime::now_utc();
    params.not_before = not_before;
    params.not_after = not_before + time::Duration::days(VALIDITY_YEARS * 365);

    let cert = params.self_signed(&key_pair).map_err(|e| InitError::Crypto(e.to_string()))?;

    if let Some(parent) = cert_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| InitError::stage(parent, e))?;
    }
    std::fs::write(cert_path, cert.pem()).map_err(|e| InitError::stage(cert_path, e))?;
    std::fs::write(key_path, key_pair.serialize_pem()).map_err(|e| InitError::stage(key_path, e))?;

    Ok(())
}

fn set_mode(path: &Path, mode: u32) -> Result<(), InitError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| InitError::stage(path, e))
}

/// Probe for a Debian-family refresh tool first, then RHEL-family. Neither
/// present is a warning, not a failure: system trust install is
/// optional-degraded at the orchestrator level.
async fn install_into_system_trust(cert_path: &Path, product: &str) -> Result<(), InitError> {
    if which("update-ca-certificates").await {
        let dest = Path::new("/usr/local/share/ca-certificates").join(format!("{product}-proxy-ca.crt"));
        std::fs::copy(cert_path, &dest).map_err(|e| InitError::stage(&dest, e))?;
        return run("update-ca-certificates", &[]).await;
    }

    if which("update-ca-trust").await {
        let dest = Path::new("/etc/pki/ca-trust/source/anchors").join(format!("{product}-proxy-ca.crt"));
        std::fs::copy(cert_path, &dest).map_err(|e| InitError::stage(&dest, e))?;
        return run("update-ca-trust", &["extract"]).await;
    }

    tracing::warn!("no recognized system trust refresh tool found, CA installed for the proxy only");
    Ok(())
}

async fn which(program: &str) -> bool {
    Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {program}"))
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

async fn run(program: &str, args: &[&str]) -> Result<(), InitError> {
    let status = Command::new(program)
        .args(args)
        .stdout(std::process::Stdio::inherit())
        .stderr(std::process::Stdio::inherit())
        .status()
        .await
        .map_err(|e| InitError::subprocess(program, e.to_string()))?;

    if !status.success() {
        return Err(InitError::subprocess(program, format!("exited with {status}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generate_writes_valid_pair() {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("ca.crt");
        let key_path = dir.path().join("ca.key");

        generate(&cert_path, &key_path, "sandboxd").unwrap();

        assert!(existing_pair_is_valid(&cert_path, &key_path));
    }

    #[test]
    fn rejects_garbage_pair() {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("ca.crt");
        let key_path = dir.path().join("ca.key");
        std::fs::write(&cert_path, "not a cert").unwrap();
        std::fs::write(&key_path, "not a key").unwrap();

        assert!(!existing_pair_is_valid(&cert_path, &key_path));
    }
}
