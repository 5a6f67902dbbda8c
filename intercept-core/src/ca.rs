use crate::config::CertificateConfig;
use crate::error::InterceptError;
use crate::Result;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use std::fs;
use std::path::Path;
use time::{Duration, OffsetDateTime};
use tracing::info;

const CA_COMMON_NAME: &str = "Intercept Root CA";
const CA_ORGANIZATION: &str = "Intercept";

/// Root CA used to mint per-host certificates for TLS interception.
///
/// The certificate and key live as `ca.pem` / `ca.key` (plus a `ca.crt` copy
/// for browser import) in the configured store directory.
pub struct CertificateAuthority {
    ca_cert: Certificate,
}

fn ca_params(validity_days: u32, key_pair: KeyPair) -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::OrganizationName, CA_ORGANIZATION);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let not_before = OffsetDateTime::now_utc() - Duration::days(1);
    params.not_before = not_before;
    params.not_after = not_before + Duration::days(i64::from(validity_days));
    params.key_pair = Some(key_pair);
    params
}

fn cert_error(context: &str, e: rcgen::Error) -> InterceptError {
    InterceptError::Certificate(format!("{}: {}", context, e))
}

impl CertificateAuthority {
    /// Loads the CA from the store directory, generating one on first use.
    pub fn load_or_generate(config: &CertificateConfig) -> Result<Self> {
        let ca_dir = Path::new(&config.cert_store_path);
        let cert_path = ca_dir.join("ca.pem");
        let key_path = ca_dir.join("ca.key");

        if cert_path.exists() && key_path.exists() {
            let key_pem = fs::read_to_string(&key_path)?;
            let ca = Self::from_key_pem(&key_pem, config.validity_days)?;
            info!(path = %cert_path.display(), "Loaded root CA");
            return Ok(ca);
        }

        fs::create_dir_all(ca_dir)?;
        let ca = Self::generate(config.validity_days)?;
        let cert_pem = ca.cert_pem()?;
        fs::write(&cert_path, &cert_pem)?;
        fs::write(&key_path, ca.key_pem())?;
        fs::write(cert_path.with_extension("crt"), &cert_pem)?;
        info!(path = %cert_path.display(), "Generated new root CA");
        Ok(ca)
    }

    pub fn generate(validity_days: u32) -> Result<Self> {
        let key_pair =
            KeyPair::generate(&PKCS_ECDSA_P256_SHA256).map_err(|e| cert_error("Failed to generate CA key", e))?;
        let ca_cert = Certificate::from_params(ca_params(validity_days, key_pair))
            .map_err(|e| cert_error("Failed to generate CA cert", e))?;
        Ok(Self { ca_cert })
    }

    /// Rebuilds the CA around a stored key. rcgen cannot load an existing
    /// certificate for signing, so the certificate is re-issued with the same
    /// subject and key.
    pub fn from_key_pem(key_pem: &str, validity_days: u32) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem).map_err(|e| cert_error("Failed to parse CA key", e))?;
        let ca_cert = Certificate::from_params(ca_params(validity_days, key_pair))
            .map_err(|e| cert_error("Failed to recreate CA cert", e))?;
        Ok(Self { ca_cert })
    }

    pub fn cert_pem(&self) -> Result<String> {
        self.ca_cert
            .serialize_pem()
            .map_err(|e| cert_error("Failed to serialize CA cert", e))
    }

    pub fn key_pem(&self) -> String {
        let mut key_pem = self.ca_cert.serialize_private_key_pem();
        if !key_pem.ends_with('\n') {
            key_pem.push('\n');
        }
        key_pem
    }

    /// DER certificate, as rustls expects it.
    pub fn cert_der(&self) -> Result<Vec<u8>> {
        self.ca_cert
            .serialize_der()
            .map_err(|e| cert_error("Failed to serialize CA cert DER", e))
    }

    pub fn key_der(&self) -> Vec<u8> {
        self.ca_cert.serialize_private_key_der()
    }
}
