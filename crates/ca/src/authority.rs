//! Root CA and device certificate lifecycle

use chrono::{Datelike, Duration, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, SerialNumber,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use trustplane_core::types::{DeviceId, MacAddr};
use trustplane_core::{AttestationReason, Error, Result};
use x509_parser::pem::parse_x509_pem;

use crate::revocation::RevocationList;

const ROOT_CERT_FILE: &str = "root-cert.pem";
const ROOT_KEY_FILE: &str = "root-key.pem";
const REVOCATION_FILE: &str = "revoked.json";

/// Device certificate validity in days
const DEVICE_CERT_VALIDITY_DAYS: i64 = 365;
/// Root validity in days
const ROOT_VALIDITY_DAYS: i64 = 3650;

/// A freshly issued device certificate
#[derive(Debug, Clone)]
pub struct IssuedCert {
    /// Lowercase hex serial, the revocation key
    pub serial: String,
    pub cert_pem: String,
    pub key_pem: String,
}

/// The single self-signed authority for all device certificates
pub struct CertificateAuthority {
    ca_dir: PathBuf,
    /// Original root PEM, used for validation-time parsing
    root_cert_pem: String,
    root_cert: rcgen::Certificate,
    root_key: KeyPair,
    revocations: Mutex<RevocationList>,
}

fn attestation_err(reason: AttestationReason) -> Error {
    Error::AttestationFailed { reason }
}

/// Day-granularity validity window ending `days` from now
///
/// not_before backs up one day so freshly issued certificates are valid
/// regardless of timezone.
fn validity_window(days: i64) -> (chrono::DateTime<Utc>, chrono::DateTime<Utc>) {
    (Utc::now() - Duration::days(1), Utc::now() + Duration::days(days))
}


/// Random positive 16-byte serial
fn random_serial() -> Vec<u8> {
    let mut serial: [u8; 16] = rand::random();
    // Keep the DER integer positive so the raw serial round-trips
    serial[0] &= 0x7f;
    serial.to_vec()
}

impl CertificateAuthority {
    /// Load the root pair from `ca_dir`, generating it on first run
    pub fn init_or_load_root(ca_dir: impl AsRef<Path>) -> Result<Self> {
        let ca_dir = ca_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&ca_dir).map_err(Error::storage)?;

        let cert_path = ca_dir.join(ROOT_CERT_FILE);
        let key_path = ca_dir.join(ROOT_KEY_FILE);

        let (root_cert_pem, root_cert, root_key) = if cert_path.exists() && key_path.exists() {
            let cert_pem = std::fs::read_to_string(&cert_path).map_err(Error::storage)?;
            let key_pem = std::fs::read_to_string(&key_path).map_err(Error::storage)?;
            let root_key = KeyPair::from_pem(&key_pem)
                .map_err(|e| Error::Internal(format!("root key unreadable: {}", e)))?;
            let params = CertificateParams::from_ca_cert_pem(&cert_pem)
                .map_err(|e| Error::Internal(format!("root cert unreadable: {}", e)))?;
            let root_cert = params
                .self_signed(&root_key)
                .map_err(|e| Error::Internal(format!("root cert rebuild failed: {}", e)))?;
            tracing::info!(dir = %ca_dir.display(), "loaded existing root CA");
            (cert_pem, root_cert, root_key)
        } else {
            let root_key = KeyPair::generate()
                .map_err(|e| Error::Internal(format!("root key generation failed: {}", e)))?;
            let mut params = CertificateParams::default();
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, "trustplane root ca");
            dn.push(DnType::OrganizationName, "trustplane");
            params.distinguished_name = dn;
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.serial_number = Some(SerialNumber::from(random_serial()));
            let (not_before, not_after) = validity_window(ROOT_VALIDITY_DAYS);
            params.not_before =
                rcgen::date_time_ymd(not_before.year(), not_before.month() as u8, not_before.day() as u8);
            params.not_after =
                rcgen::date_time_ymd(not_after.year(), not_after.month() as u8, not_after.day() as u8);

            let root_cert = params
                .self_signed(&root_key)
                .map_err(|e| Error::Internal(format!("root self-sign failed: {}", e)))?;
            let cert_pem = root_cert.pem();
            std::fs::write(&cert_path, &cert_pem).map_err(Error::storage)?;
            std::fs::write(&key_path, root_key.serialize_pem()).map_err(Error::storage)?;
            tracing::info!(dir = %ca_dir.display(), "generated new root CA");
            (cert_pem, root_cert, root_key)
        };

        let revocations = RevocationList::load(ca_dir.join(REVOCATION_FILE))?;

        Ok(Self {
            ca_dir,
            root_cert_pem,
            root_cert,
            root_key,
            revocations: Mutex::new(revocations),
        })
    }

    fn device_cert_path(&self, device_id: &DeviceId) -> PathBuf {
        self.ca_dir.join(format!("{}.pem", device_id))
    }

    fn device_key_path(&self, device_id: &DeviceId) -> PathBuf {
        self.ca_dir.join(format!("{}-key.pem", device_id))
    }

    /// Issue a device certificate signed by the root
    ///
    /// The device id becomes the subject common name and the MAC the
    /// organizational unit, binding the certificate to the device record.
    pub async fn issue(&self, device_id: &DeviceId, mac: &MacAddr) -> Result<IssuedCert> {
        let (not_before, not_after) = validity_window(DEVICE_CERT_VALIDITY_DAYS);
        self.issue_with_validity(device_id, mac, not_before, not_after)
    }

    fn issue_with_validity(
        &self,
        device_id: &DeviceId,
        mac: &MacAddr,
        not_before: chrono::DateTime<Utc>,
        not_after: chrono::DateTime<Utc>,
    ) -> Result<IssuedCert> {
        let key = KeyPair::generate()
            .map_err(|e| Error::Internal(format!("device key generation failed: {}", e)))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, device_id.as_str());
        dn.push(DnType::OrganizationalUnitName, mac.to_string());
        dn.push(DnType::OrganizationName, "trustplane device");
        params.distinguished_name = dn;
        let serial = random_serial();
        params.serial_number = Some(SerialNumber::from(serial.clone()));
        params.not_before =
            rcgen::date_time_ymd(not_before.year(), not_before.month() as u8, not_before.day() as u8);
        params.not_after =
            rcgen::date_time_ymd(not_after.year(), not_after.month() as u8, not_after.day() as u8);

        let cert = params
            .signed_by(&key, &self.root_cert, &self.root_key)
            .map_err(|e| Error::Internal(format!("certificate signing failed: {}", e)))?;

        let issued = IssuedCert {
            serial: hex::encode(&serial),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        };

        std::fs::write(self.device_cert_path(device_id), &issued.cert_pem)
            .map_err(Error::storage)?;
        std::fs::write(self.device_key_path(device_id), &issued.key_pem)
            .map_err(Error::storage)?;

        tracing::info!(device_id = %device_id, serial = %issued.serial, "issued device certificate");
        Ok(issued)
    }

    /// Read back a device's stored certificate
    pub async fn device_cert_pem(&self, device_id: &DeviceId) -> Result<String> {
        let path = self.device_cert_path(device_id);
        if !path.exists() {
            return Err(Error::not_found("certificate", device_id.as_str()));
        }
        std::fs::read_to_string(path).map_err(Error::storage)
    }

    /// Validate a presented certificate against the stored device identity
    ///
    /// Checks, in order: parseability, revocation, validity window,
    /// issuer + signature by the root, and subject binding. A revoked
    /// certificate never validates regardless of any other property.
    pub async fn validate(
        &self,
        cert_pem: &str,
        device_id: &DeviceId,
        mac: &MacAddr,
    ) -> Result<()> {
        let (_, pem) = parse_x509_pem(cert_pem.as_bytes())
            .map_err(|_| attestation_err(AttestationReason::Malformed))?;
        let cert = pem
            .parse_x509()
            .map_err(|_| attestation_err(AttestationReason::Malformed))?;

        let serial = hex::encode(cert.raw_serial());
        {
            let revocations = self.revocations.lock().unwrap_or_else(|e| e.into_inner());
            if revocations.is_revoked(&serial) {
                return Err(attestation_err(AttestationReason::Revoked));
            }
        }

        let now = Utc::now().timestamp();
        if cert.validity().not_before.timestamp() > now {
            return Err(attestation_err(AttestationReason::NotYetValid));
        }
        if cert.validity().not_after.timestamp() < now {
            return Err(attestation_err(AttestationReason::ExpiredCert));
        }

        let (_, root_pem) = parse_x509_pem(self.root_cert_pem.as_bytes())
            .map_err(|e| Error::Internal(format!("root pem unreadable: {}", e)))?;
        let root = root_pem
            .parse_x509()
            .map_err(|e| Error::Internal(format!("root cert unreadable: {}", e)))?;

        if cert.issuer().to_string() != root.subject().to_string()
            || cert.verify_signature(Some(root.public_key())).is_err()
        {
            return Err(attestation_err(AttestationReason::UnknownIssuer));
        }

        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|a| a.as_str().ok());
        let ou = cert
            .subject()
            .iter_organizational_unit()
            .next()
            .and_then(|a| a.as_str().ok());
        if cn != Some(device_id.as_str()) || ou != Some(mac.to_string().as_str()) {
            return Err(attestation_err(AttestationReason::SubjectMismatch));
        }

        Ok(())
    }

    /// Revoke a device's certificate; recorded with timestamp and reason
    pub async fn revoke(&self, device_id: &DeviceId, reason: &str) -> Result<()> {
        let cert_pem = self.device_cert_pem(device_id).await?;
        let (_, pem) = parse_x509_pem(cert_pem.as_bytes())
            .map_err(|_| attestation_err(AttestationReason::Malformed))?;
        let cert = pem
            .parse_x509()
            .map_err(|_| attestation_err(AttestationReason::Malformed))?;
        let serial = hex::encode(cert.raw_serial());

        let mut revocations = self.revocations.lock().unwrap_or_else(|e| e.into_inner());
        revocations.revoke(&serial, device_id.as_str(), reason)?;
        tracing::warn!(device_id = %device_id, serial = %serial, reason, "certificate revoked");
        Ok(())
    }

    /// Number of revoked certificates
    pub fn revoked_count(&self) -> usize {
        self.revocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
