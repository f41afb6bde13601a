//! # trustplane Certificate Authority
//!
//! Issues, validates, and revokes per-device X.509 certificates under a
//! single self-signed root. The store layout under `ca_dir` is one PEM pair
//! per device plus the root pair and a revocation list file:
//!
//! ```text
//! ca_dir/
//!   root-cert.pem
//!   root-key.pem
//!   revoked.json
//!   <device_id>.pem
//!   <device_id>-key.pem
//! ```
//!
//! Certificates carry the device id as the subject common name and the MAC
//! address as the organizational unit, so validation can bind a presented
//! certificate back to the stored device record. A revoked certificate
//! never validates again.

pub mod authority;
pub mod revocation;

pub use authority::{CertificateAuthority, IssuedCert};
pub use revocation::{RevocationList, RevokedEntry};
