//! Offline Ed25519 entitlement check, with an optional online activation
//! path behind the `online-activation` feature and an explicit config flag.
//!
//! Ed25519 verification grounded on `PieProton-LexFlow`'s `verify_license`;
//! the network call (feature-gated, timeout, graceful `Result` on any
//! failure) grounded on `envvault`'s `version_check` module.

use crate::config::KernelConfig;
use crate::fsutil;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Compiled-in public key used to verify every licence offline. The
/// matching private key is held by the issuing authority and never reaches
/// source control.
const PUBLIC_KEY_BYTES: [u8; 32] = [
    25, 127, 107, 35, 225, 108, 133, 50, 198, 171, 200, 56, 250, 205, 94, 167, 137, 190, 12, 118,
    178, 146, 3, 52, 3, 155, 250, 139, 61, 54, 141, 97,
];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LicenseError {
    #[error("no_local_license")]
    NoLocalLicense,
    #[error("invalid_license_format")]
    InvalidLicenseFormat,
    #[error("invalid_signature")]
    InvalidSignature,
    #[error("invalid_product")]
    InvalidProduct,
    #[error("network_error")]
    NetworkError,
    #[error("timeout")]
    Timeout,
    #[error("parse_error")]
    ParseError,
    #[error("unknown_error: {0}")]
    Unknown(String),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LicenseError {
    fn from(e: std::io::Error) -> Self {
        LicenseError::Io(e.to_string())
    }
}

/// The signed entitlement. Field order is significant: `verifySignature`
/// canonicalizes by `serde_json::to_vec`-ing this exact struct, which
/// preserves declared field order rather than sorting keys, matching the
/// signer's insertion-order JSON (§9 "Canonical JSON for signatures").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Licence {
    pub product: String,
    pub issued_to: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LicenseFile {
    licence: Licence,
    signature: String,
    saved_at: DateTime<Utc>,
}

/// Outcome of a local license check.
#[derive(Debug, Clone, PartialEq)]
pub enum LicenseStatus {
    Valid(Licence),
    Invalid(LicenseError),
}

/// Runtime configuration for the license subsystem. `allow_online_activation`
/// resolves the spec's Open Question (a): the source permitted silent
/// online activation; here it must be explicitly turned on.
#[derive(Debug, Clone)]
pub struct LicenseConfig {
    pub product_tag: String,
    pub allow_online_activation: bool,
    pub entitlement_url: String,
}

impl LicenseConfig {
    pub fn new(product_tag: impl Into<String>) -> Self {
        Self {
            product_tag: product_tag.into(),
            allow_online_activation: false,
            entitlement_url: "https://licenses.example.invalid/v1/activate".to_string(),
        }
    }
}

pub struct LicenseVerifier {
    config: KernelConfig,
    license_config: LicenseConfig,
}

impl LicenseVerifier {
    pub fn new(config: KernelConfig, license_config: LicenseConfig) -> Self {
        Self { config, license_config }
    }

    /// Canonical-serializes `licence` and verifies `signature_b64` against
    /// the compiled-in public key.
    pub fn verify_signature(&self, licence: &Licence, signature_b64: &str) -> Result<(), LicenseError> {
        let public_key =
            VerifyingKey::from_bytes(&PUBLIC_KEY_BYTES).map_err(|_| LicenseError::InvalidSignature)?;

        let signature_bytes =
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, signature_b64)
                .map_err(|_| LicenseError::InvalidLicenseFormat)?;
        let signature =
            Signature::from_slice(&signature_bytes).map_err(|_| LicenseError::InvalidLicenseFormat)?;

        let canonical =
            serde_json::to_vec(licence).map_err(|_| LicenseError::InvalidLicenseFormat)?;

        public_key
            .verify(&canonical, &signature)
            .map_err(|_| LicenseError::InvalidSignature)
    }

    fn check_product(&self, licence: &Licence) -> Result<(), LicenseError> {
        if licence.product != self.license_config.product_tag {
            return Err(LicenseError::InvalidProduct);
        }
        Ok(())
    }

    /// Reads `license.json`, verifies its signature, and checks the product
    /// tag. Errors map exactly to the kinds named in §4.4.
    pub fn check_local_license(&self) -> LicenseStatus {
        match self.try_check_local_license() {
            Ok(licence) => LicenseStatus::Valid(licence),
            Err(e) => LicenseStatus::Invalid(e),
        }
    }

    fn try_check_local_license(&self) -> Result<Licence, LicenseError> {
        let path = self.config.license_path();
        if !path.exists() {
            return Err(LicenseError::NoLocalLicense);
        }
        let bytes = std::fs::read(&path)?;
        let file: LicenseFile =
            serde_json::from_slice(&bytes).map_err(|_| LicenseError::InvalidLicenseFormat)?;

        self.verify_signature(&file.licence, &file.signature)?;
        self.check_product(&file.licence)?;
        Ok(file.licence)
    }

    pub fn save_license(&self, licence: Licence, signature: String) -> Result<(), LicenseError> {
        fsutil::ensure_dir(&self.config.vault_dir)?;
        let file = LicenseFile { licence, signature, saved_at: Utc::now() };
        let bytes = serde_json::to_vec_pretty(&file).map_err(|e| LicenseError::Unknown(e.to_string()))?;
        fsutil::write_restricted(&self.config.license_path(), &bytes)?;
        Ok(())
    }

    /// Idempotent: deleting an absent license file is not an error.
    pub fn delete_license(&self) -> Result<(), LicenseError> {
        match std::fs::remove_file(self.config.license_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(feature = "online-activation")]
mod online {
    use super::*;
    use std::error::Error as _;
    use std::time::Duration;

    #[derive(Serialize)]
    struct ActivationRequest<'a> {
        #[serde(rename = "userKey")]
        user_key: &'a str,
        password: &'a str,
        program: &'a str,
    }

    #[derive(Deserialize)]
    struct ActivationResponse {
        licence: Licence,
        signature: String,
    }

    impl LicenseVerifier {
        /// POSTs an activation request to the configured entitlement
        /// endpoint. Returns `Err` unless `LicenseConfig.allow_online_activation`
        /// is set — the feature flag alone does not grant network access.
        pub fn check_license_with_server(
            &self,
            user_key: &str,
            password: &str,
        ) -> Result<Licence, LicenseError> {
            if !self.license_config.allow_online_activation {
                return Err(LicenseError::Unknown("online activation not enabled".into()));
            }

            let request =
                ActivationRequest { user_key, password, program: &self.license_config.product_tag };

            let response = ureq::post(&self.license_config.entitlement_url)
                .timeout(Duration::from_secs(10))
                .send_json(&request)
                .map_err(|e| match e {
                    ureq::Error::Status(_, _) => LicenseError::NetworkError,
                    ureq::Error::Transport(t) => {
                        let is_timeout = t
                            .source()
                            .and_then(|s| s.downcast_ref::<std::io::Error>())
                            .map(|io_err| io_err.kind() == std::io::ErrorKind::TimedOut)
                            .unwrap_or(false);
                        if is_timeout {
                            LicenseError::Timeout
                        } else {
                            LicenseError::NetworkError
                        }
                    }
                })?;

            let parsed: ActivationResponse =
                response.into_json().map_err(|_| LicenseError::ParseError)?;

            self.verify_signature(&parsed.licence, &parsed.signature)?;
            self.check_product(&parsed.licence)?;
            self.save_license(parsed.licence.clone(), parsed.signature)?;
            Ok(parsed.licence)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use tempfile::tempdir;

    fn test_keypair() -> SigningKey {
        SigningKey::from_bytes(&[42u8; 32])
    }

    fn sign(licence: &Licence, signing_key: &SigningKey) -> String {
        let canonical = serde_json::to_vec(licence).unwrap();
        let signature = signing_key.sign(&canonical);
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, signature.to_bytes())
    }

    fn verifier(dir: &std::path::Path) -> LicenseVerifier {
        LicenseVerifier::new(KernelConfig::new(dir.to_path_buf()), LicenseConfig::new("keyward"))
    }

    #[test]
    fn missing_license_reports_no_local_license() {
        let dir = tempdir().unwrap();
        let verifier = verifier(dir.path());
        let status = verifier.check_local_license();
        assert!(matches!(status, LicenseStatus::Invalid(LicenseError::NoLocalLicense)));
    }

    #[test]
    fn malformed_license_reports_invalid_format() {
        let dir = tempdir().unwrap();
        let verifier = verifier(dir.path());
        fsutil::ensure_dir(&dir.path().to_path_buf()).unwrap();
        std::fs::write(verifier.config.license_path(), b"not json").unwrap();
        let status = verifier.check_local_license();
        assert!(matches!(status, LicenseStatus::Invalid(LicenseError::InvalidLicenseFormat)));
    }

    #[test]
    fn correctly_signed_license_round_trips_through_save_and_check() {
        let signing_key = test_keypair();
        let licence = Licence {
            product: "keyward".to_string(),
            issued_to: "alice".to_string(),
            issued_at: Utc::now(),
            expires_at: None,
        };
        let signature = sign(&licence, &signing_key);

        let dir = tempdir().unwrap();
        let verifier = verifier(dir.path());
        verifier.save_license(licence.clone(), signature).unwrap();

        let status = verifier.check_local_license();
        assert!(matches!(status, LicenseStatus::Valid(ref l) if *l == licence));
    }

    #[test]
    fn wrong_product_tag_is_rejected() {
        let signing_key = test_keypair();
        let licence = Licence {
            product: "other-product".to_string(),
            issued_to: "alice".to_string(),
            issued_at: Utc::now(),
            expires_at: None,
        };
        let signature = sign(&licence, &signing_key);

        let dir = tempdir().unwrap();
        let verifier = verifier(dir.path());
        verifier.save_license(licence, signature).unwrap();

        let status = verifier.check_local_license();
        assert!(matches!(status, LicenseStatus::Invalid(LicenseError::InvalidProduct)));
    }

    #[test]
    fn canonical_json_is_stable_for_fixed_licence() {
        let licence = Licence {
            product: "keyward".to_string(),
            issued_to: "alice".to_string(),
            issued_at: DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z").unwrap().with_timezone(&Utc),
            expires_at: None,
        };
        let bytes = serde_json::to_vec(&licence).unwrap();
        let expected = br#"{"product":"keyward","issued_to":"alice","issued_at":"2025-01-01T00:00:00Z","expires_at":null}"#;
        assert_eq!(bytes, expected);
    }

    #[test]
    fn tampered_licence_fails_signature_check() {
        let signing_key = test_keypair();
        let licence = Licence {
            product: "keyward".to_string(),
            issued_to: "alice".to_string(),
            issued_at: Utc::now(),
            expires_at: None,
        };
        let signature = sign(&licence, &signing_key);

        let dir = tempdir().unwrap();
        let verifier = verifier(dir.path());

        let mut tampered = licence.clone();
        tampered.issued_to = "mallory".to_string();

        let result = verifier.verify_signature(&tampered, &signature);
        assert!(matches!(result, Err(LicenseError::InvalidSignature)));
    }
}
