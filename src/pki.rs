// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Certificate parsing for client certificates kept in Secrets.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::prelude::*;

/// PEM labels accepted as private keys.
const PRIVATE_KEY_LABELS: &[&str] = &["PRIVATE KEY", "RSA PRIVATE KEY", "EC PRIVATE KEY"];

/// Errors parsing certificate material.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CertificateError {
    /// The input is not PEM.
    #[error("failed to parse PEM: {0}")]
    Pem(String),

    /// The PEM block has an unexpected label.
    #[error("unexpected PEM block {found:?}, expected {expected}")]
    UnexpectedBlock {
        found: String,
        expected: &'static str,
    },

    /// The DER payload is not an X.509 certificate.
    #[error("failed to parse certificate: {0}")]
    X509(String),
}

/// Fields of a certificate the hooks care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCertificate {
    /// Subject common name, empty if absent.
    pub common_name: String,
    /// Issuer common name, empty if absent.
    pub issuer_common_name: String,
    /// Start of validity.
    pub not_before: DateTime<Utc>,
    /// End of validity.
    pub not_after: DateTime<Utc>,
}

impl ParsedCertificate {
    /// Returns true if the certificate expires within `window` of `now`.
    pub fn expires_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        self.not_after - now <= window
    }
}

/// Parses the first PEM block of `data` as an X.509 certificate.
pub fn parse_certificate_pem(data: &[u8]) -> Result<ParsedCertificate, CertificateError> {
    let block = ::pem::parse(data).map_err(|e| CertificateError::Pem(e.to_string()))?;
    if block.tag() != "CERTIFICATE" {
        return Err(CertificateError::UnexpectedBlock {
            found: block.tag().to_string(),
            expected: "CERTIFICATE",
        });
    }

    let (_, cert) = X509Certificate::from_der(block.contents())
        .map_err(|e| CertificateError::X509(e.to_string()))?;

    let cn = |name: &X509Name<'_>| {
        name.iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string()
    };

    Ok(ParsedCertificate {
        common_name: cn(cert.subject()),
        issuer_common_name: cn(cert.issuer()),
        not_before: timestamp(cert.validity().not_before.timestamp())?,
        not_after: timestamp(cert.validity().not_after.timestamp())?,
    })
}

/// Checks that `data` holds a PEM-encoded private key.
pub fn validate_private_key_pem(data: &[u8]) -> Result<(), CertificateError> {
    let block = ::pem::parse(data).map_err(|e| CertificateError::Pem(e.to_string()))?;
    if PRIVATE_KEY_LABELS.contains(&block.tag()) {
        Ok(())
    } else {
        Err(CertificateError::UnexpectedBlock {
            found: block.tag().to_string(),
            expected: "PRIVATE KEY",
        })
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, CertificateError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| CertificateError::X509(format!("validity timestamp {} out of range", secs)))
}

/// SHA-256 over `key ∥ value` for every entry in ascending key order, hex encoded.
///
/// Values are hashed as raw bytes.
pub fn checksum(data: &BTreeMap<String, Vec<u8>>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data {
        hasher.update(key.as_bytes());
        hasher.update(value);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_generated_certificate() {
        let generated = rcgen::generate_simple_self_signed(vec!["webhook".to_string()]).unwrap();
        let parsed = parse_certificate_pem(generated.cert.pem().as_bytes()).unwrap();
        assert!(parsed.not_after > parsed.not_before);
        assert!(!parsed.expires_within(Duration::days(1), Utc::now()));
        assert!(parsed.expires_within(Duration::days(365 * 5000), Utc::now()));
        validate_private_key_pem(generated.key_pair.serialize_pem().as_bytes()).unwrap();
    }

    #[test]
    fn test_rejects_key_as_certificate() {
        let generated = rcgen::generate_simple_self_signed(vec!["webhook".to_string()]).unwrap();
        let err = parse_certificate_pem(generated.key_pair.serialize_pem().as_bytes()).unwrap_err();
        assert!(matches!(err, CertificateError::UnexpectedBlock { .. }));
        assert!(parse_certificate_pem(b"not pem").is_err());
    }

    #[test]
    fn test_checksum_known_value() {
        let mut data = BTreeMap::new();
        data.insert("b".to_string(), b"2".to_vec());
        data.insert("a".to_string(), b"1".to_vec());
        assert_eq!(checksum(&data), hex::encode(Sha256::digest(b"a1b2")));
    }

    #[test]
    fn test_checksum_ignores_insertion_order() {
        let entries = [("ca.crt", "x"), ("ca.key", "y"), ("front-proxy-ca.crt", "z")];
        let forward: BTreeMap<String, Vec<u8>> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect();
        let reverse: BTreeMap<String, Vec<u8>> = entries
            .iter()
            .rev()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect();
        assert_eq!(checksum(&forward), checksum(&reverse));
        assert_eq!(checksum(&forward).len(), 64);
    }
}
