// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Root certificate authority and per-host leaf certificates for the
//! intercepting proxy.

use crate::error::Error;
use anyhow::{Context, Result};
use dashmap::DashMap;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    PKCS_ECDSA_P256_SHA256,
};
use rustls::crypto::aws_lc_rs::sign::any_supported_type as aws_any_supported_type;
use rustls::pki_types::PrivateKeyDer as PrivateKey;
use rustls::sign::CertifiedKey;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

const CA_COMMON_NAME: &str = "scrape-cache CA";
const CA_ORGANIZATION: &str = "scrape-cache";

/// Process-wide hostname -> leaf certificate map.
///
/// Lookups are lock-free for readers. On a miss the generator runs outside
/// any map lock, so two concurrent misses for one host may both generate;
/// whichever result lands first is kept and handed to both callers.
#[derive(Debug, Default)]
pub struct CertStore {
    certs: DashMap<String, Arc<CertifiedKey>>,
}

impl CertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored certificate for `host`, generating it with `gen`
    /// only when none is stored yet.
    pub fn fetch<F>(&self, host: &str, gen: F) -> crate::Result<Arc<CertifiedKey>>
    where
        F: FnOnce() -> crate::Result<Arc<CertifiedKey>>,
    {
        if let Some(cert) = self.certs.get(host) {
            return Ok(cert.value().clone());
        }

        let generated = gen()?;
        let kept = self
            .certs
            .entry(host.to_string())
            .or_insert(generated)
            .value()
            .clone();
        Ok(kept)
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }
}

/// The root CA used to sign leaf certificates for intercepted hosts.
pub struct CertificateAuthority {
    ca_cert_pem: String,
    ca_key_pair: KeyPair,
    leaves: CertStore,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("leaves", &self.leaves.len())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Loads the CA from the specified paths, or generates and saves a new
    /// one if either file is missing.
    pub async fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        if cert_path.exists() && key_path.exists() {
            info!(path = %cert_path.display(), "loading existing CA");
            Self::load(cert_path, key_path).await
        } else {
            info!(path = %cert_path.display(), "generating new CA");
            Self::generate_and_save(cert_path, key_path).await
        }
    }

    /// A fresh CA that only lives in memory.
    pub fn generate() -> Result<Arc<Self>> {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .context("failed to generate CA key pair")?;
        let cert = ca_params()?
            .self_signed(&key_pair)
            .context("failed to self-sign CA certificate")?;
        Ok(Arc::new(Self::from_parts(cert.pem(), key_pair)))
    }

    async fn load(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        let cert_pem = fs::read_to_string(cert_path)
            .await
            .context("failed to read CA cert")?;
        let key_pem = fs::read_to_string(key_path)
            .await
            .context("failed to read CA key")?;

        let key_pair =
            KeyPair::from_pem(&key_pem).context("failed to parse CA key pair from PEM")?;

        Ok(Arc::new(Self::from_parts(cert_pem, key_pair)))
    }

    async fn generate_and_save(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        let ca = Self::generate()?;
        let key_pem = ca.ca_key_pair.serialize_pem();

        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        fs::write(cert_path, &ca.ca_cert_pem)
            .await
            .context("failed to write CA cert")?;
        fs::write(key_path, &key_pem)
            .await
            .context("failed to write CA key")?;

        Ok(ca)
    }

    fn from_parts(ca_cert_pem: String, ca_key_pair: KeyPair) -> Self {
        Self {
            ca_cert_pem,
            ca_key_pair,
            leaves: CertStore::new(),
        }
    }

    /// Leaf certificate for `host`, generated on first use and reused for
    /// the lifetime of this CA.
    pub fn cert_for_host(&self, host: &str) -> crate::Result<Arc<CertifiedKey>> {
        self.leaves.fetch(host, || {
            debug!(%host, "generating leaf certificate");
            self.sign_leaf(host)
                .map_err(|e| Error::Tls(format!("leaf certificate for {}: {:#}", host, e)))
        })
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Number of distinct hosts a leaf certificate has been issued for.
    pub fn issued(&self) -> usize {
        self.leaves.len()
    }

    fn sign_leaf(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, host);
        params.use_authority_key_identifier_extension = false;

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

        let issuer = Issuer::new(ca_params()?, &self.ca_key_pair);
        let cert = params.signed_by(&key_pair, &issuer)?;
        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();

        let leaf_cert = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| anyhow::anyhow!("no certificates parsed from PEM"))??;
        let leaf_key_bytes = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_bytes())
            .next()
            .ok_or_else(|| anyhow::anyhow!("no private keys parsed from PEM"))??;
        let leaf_key_der = PrivateKey::from(leaf_key_bytes);

        let signer = aws_any_supported_type(&leaf_key_der)
            .map_err(|e| anyhow::anyhow!("failed to create leaf key signer: {}", e))?;
        Ok(Arc::new(CertifiedKey::new(vec![leaf_cert], signer)))
    }
}

fn ca_params() -> Result<CertificateParams> {
    let mut params = CertificateParams::new(vec![]).context("failed to create CA params")?;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, CA_COMMON_NAME);
    params
        .distinguished_name
        .push(DnType::OrganizationName, CA_ORGANIZATION);
    Ok(params)
}
