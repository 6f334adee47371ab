/*
 * mitm.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Varco, an intercepting HTTP/HTTPS proxy.
 *
 * Varco is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Varco is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Varco.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Certificate authority for TLS interception. Leaf certificates are
//! synthesised per host (subject CN = host, SAN = host plus the origin's
//! own SAN entries), signed by the configured CA, and cached on disk as
//! `<host>.pem`. The cache key is a fingerprint of (host, CA, SAN set) so a
//! rotated CA or changed SAN set re-mints. Concurrent syntheses for one host
//! are coalesced: exactly one minting operation runs.
//!
//! Synthesised leaves reuse the CA's key pair, so the only private key in
//! play lives in memory for the process lifetime.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair, SanType,
    SerialNumber,
};
use sha2::{Digest, Sha256};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::ServerConfig;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::error::ProxyError;

const FINGERPRINT_PREFIX: &str = "# varco-fingerprint: ";

pub struct CertStore {
    ca_cert_pem: String,
    ca_cert_der: CertificateDer<'static>,
    ca_key: KeyPair,
    /// Issuer identity rebuilt from the CA PEM, used to sign leaves.
    ca_issuer: rcgen::Certificate,
    cert_dir: PathBuf,
    validity_days: u32,
    inflight: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    minted: AtomicUsize,
}

impl CertStore {
    /// Load CA material. Failures here are fatal at startup.
    pub fn load(
        ca_cert: &Path,
        ca_key: &Path,
        cert_dir: &Path,
        validity_days: u32,
    ) -> Result<Self, ProxyError> {
        let ca_cert_pem = fs::read_to_string(ca_cert)
            .map_err(|e| ProxyError::internal(format!("CA certificate unreadable: {}", e)))?;
        let ca_key_pem = fs::read_to_string(ca_key)
            .map_err(|e| ProxyError::internal(format!("CA key unreadable: {}", e)))?;
        let ca_cert_der = first_cert_der(&ca_cert_pem)
            .ok_or_else(|| ProxyError::internal("CA certificate PEM contains no certificate"))?;
        let ca_key = KeyPair::from_pem(&ca_key_pem)
            .map_err(|e| ProxyError::internal(format!("CA key invalid: {}", e)))?;
        let ca_params = CertificateParams::from_ca_cert_pem(&ca_cert_pem)
            .map_err(|e| ProxyError::internal(format!("CA certificate invalid: {}", e)))?;
        let ca_issuer = ca_params
            .self_signed(&ca_key)
            .map_err(|e| ProxyError::internal(format!("CA certificate rebuild: {}", e)))?;
        fs::create_dir_all(cert_dir)
            .map_err(|e| ProxyError::internal(format!("cert dir: {}", e)))?;
        Ok(Self {
            ca_cert_pem,
            ca_cert_der,
            ca_key,
            ca_issuer,
            cert_dir: cert_dir.to_path_buf(),
            validity_days,
            inflight: std::sync::Mutex::new(HashMap::new()),
            minted: AtomicUsize::new(0),
        })
    }

    /// How many leaves this process has minted. One per (host, CA, SAN set)
    /// however many tunnels race for it.
    pub fn minted(&self) -> usize {
        self.minted.load(Ordering::SeqCst)
    }

    /// Server-side TLS config for the client leg of an intercepted tunnel.
    /// `peer_cert_der` is the origin's leaf, when available, so its SAN
    /// entries carry over to the synthesised certificate.
    pub async fn server_config_for(
        &self,
        host: &str,
        peer_cert_der: Option<&[u8]>,
    ) -> Result<Arc<ServerConfig>, ProxyError> {
        let mut sans = vec![host.to_string()];
        if let Some(der) = peer_cert_der {
            for san in peer_san_entries(der) {
                if !sans.iter().any(|s| s.eq_ignore_ascii_case(&san)) {
                    sans.push(san);
                }
            }
        }
        let fingerprint = self.fingerprint(host, &sans);

        let gate = {
            let mut inflight = self.inflight.lock().expect("inflight lock");
            inflight
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _serial = gate.lock().await;

        let path = self.cert_dir.join(format!("{}.pem", sanitize_host(host)));
        let chain = match self.load_cached(&path, &fingerprint) {
            Some(chain) => chain,
            None => self.mint(host, &sans, &fingerprint, &path)?,
        };
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.ca_key.serialize_der()));
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| ProxyError::TlsIntercept(format!("server config: {}", e)))?;
        Ok(Arc::new(config))
    }

    fn fingerprint(&self, host: &str, sans: &[String]) -> String {
        let mut sorted: Vec<&str> = sans.iter().map(|s| s.as_str()).collect();
        sorted.sort_unstable();
        let mut hasher = Sha256::new();
        hasher.update(host.as_bytes());
        hasher.update([0]);
        hasher.update(self.ca_cert_der.as_ref());
        for san in sorted {
            hasher.update([0]);
            hasher.update(san.as_bytes());
        }
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Read a cached `<host>.pem` back, honouring its fingerprint line. Any
    /// mismatch or parse problem falls through to a fresh mint.
    fn load_cached(
        &self,
        path: &Path,
        fingerprint: &str,
    ) -> Option<Vec<CertificateDer<'static>>> {
        let text = fs::read_to_string(path).ok()?;
        let first = text.lines().next()?;
        let cached = first.strip_prefix(FINGERPRINT_PREFIX)?;
        if cached != fingerprint {
            return None;
        }
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut text.as_bytes())
            .collect::<Result<_, _>>()
            .ok()?;
        if certs.is_empty() {
            return None;
        }
        Some(certs)
    }

    fn mint(
        &self,
        host: &str,
        sans: &[String],
        fingerprint: &str,
        path: &Path,
    ) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| ProxyError::TlsIntercept(format!("cert params: {}", e)))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        for san in sans {
            let entry = match san.parse::<IpAddr>() {
                Ok(ip) => SanType::IpAddress(ip),
                Err(_) => SanType::DnsName(
                    san.clone()
                        .try_into()
                        .map_err(|_| ProxyError::TlsIntercept(format!("bad SAN: {}", san)))?,
                ),
            };
            params.subject_alt_names.push(entry);
        }
        params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(i64::from(self.validity_days));
        params
            .extended_key_usages
            .push(ExtendedKeyUsagePurpose::ServerAuth);

        // The leaf reuses the CA key pair; no per-host keys exist on disk.
        let cert = params
            .signed_by(&self.ca_key, &self.ca_issuer, &self.ca_key)
            .map_err(|e| ProxyError::TlsIntercept(format!("signing {}: {}", host, e)))?;
        self.minted.fetch_add(1, Ordering::SeqCst);
        eprintln!("[mitm] minted certificate for {}", host);

        let mut file = String::new();
        file.push_str(FINGERPRINT_PREFIX);
        file.push_str(fingerprint);
        file.push('\n');
        file.push_str(&cert.pem());
        file.push_str(&self.ca_cert_pem);
        if let Err(e) = fs::write(path, &file) {
            eprintln!("[mitm] cert cache write failed for {}: {}", host, e);
        }

        Ok(vec![cert.der().clone(), self.ca_cert_der.clone()])
    }
}

/// DNS and IP SAN entries of a certificate, as strings.
fn peer_san_entries(der: &[u8]) -> Vec<String> {
    let Ok((_, cert)) = X509Certificate::from_der(der) else {
        return Vec::new();
    };
    let Ok(Some(ext)) = cert.subject_alternative_name() else {
        return Vec::new();
    };
    ext.value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(d) => Some((*d).to_string()),
            GeneralName::IPAddress(bytes) => match bytes.len() {
                4 => {
                    let b: [u8; 4] = (*bytes).try_into().ok()?;
                    Some(IpAddr::from(b).to_string())
                }
                16 => {
                    let b: [u8; 16] = (*bytes).try_into().ok()?;
                    Some(IpAddr::from(b).to_string())
                }
                _ => None,
            },
            _ => None,
        })
        .collect()
}

/// Host as a cache file stem. Ports never appear; colons from IPv6 literals
/// would be illegal on some filesystems.
fn sanitize_host(host: &str) -> String {
    host.chars()
        .map(|c| if c == ':' || c == '/' { '_' } else { c })
        .collect()
}

fn first_cert_der(pem: &str) -> Option<CertificateDer<'static>> {
    rustls_pemfile::certs(&mut pem.as_bytes()).next()?.ok()
}

/// Mint a throwaway CA: (certificate PEM, key PEM). Fixture for exercising
/// the interception path without real CA material.
pub fn generate_test_ca() -> (String, String) {
    use rcgen::{BasicConstraints, IsCa, KeyUsagePurpose};
    let key = KeyPair::generate().expect("CA key");
    let mut params = CertificateParams::new(Vec::<String>::new()).expect("CA params");
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Varco Test CA");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    params.key_usages.push(KeyUsagePurpose::CrlSign);
    let cert = params.self_signed(&key).expect("CA self-sign");
    (cert.pem(), key.serialize_pem())
}
