//! Signing key material indexed by key identifier (kid).
//!
//! Keys are loaded once at startup from two additive sources:
//!
//! - a JSON document (usually the contents of an environment variable)
//!   mapping kid to PEM text
//! - a directory of `<kid>.pem` files
//!
//! A PEM may hold an RSA private key, in which case the public half is
//! derived, or a public key alone, which makes the kid verification-only.
//! After loading, the store is only ever read.

use crate::types::{AppError, Result};
use openssl::pkey::PKey;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Behavior required to resolve a kid to key material.
pub trait KeyLookup: Send + Sync {
    /// PEM text of the private key used to sign tokens for `kid`.
    fn private_key(&self, kid: &str) -> Result<String>;

    /// PEM text of the public key used to verify tokens for `kid`.
    fn public_key(&self, kid: &str) -> Result<String>;
}

/// Key material registered under one kid.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    /// Key id.
    pub kid: String,
    /// PEM private key, absent for verify-only keys.
    pub private_pem: Option<String>,
    /// PEM public key.
    pub public_pem: String,
}

impl KeyRecord {
    /// Builds a record from PEM text, deriving the public key when a private
    /// key is given.
    pub fn from_pem(kid: &str, pem: &str) -> Result<Self> {
        if let Ok(private) = PKey::private_key_from_pem(pem.as_bytes()) {
            let public = private
                .public_key_to_pem()
                .map_err(|e| AppError::Internal(format!("deriving public key [{}]: {}", kid, e)))?;
            let public_pem = String::from_utf8(public)
                .map_err(|e| AppError::Internal(format!("encoding public key [{}]: {}", kid, e)))?;

            return Ok(Self {
                kid: kid.to_string(),
                private_pem: Some(pem.to_string()),
                public_pem,
            });
        }

        PKey::public_key_from_pem(pem.as_bytes())
            .map_err(|e| AppError::Internal(format!("parsing pem for kid [{}]: {}", kid, e)))?;

        Ok(Self {
            kid: kid.to_string(),
            private_pem: None,
            public_pem: pem.to_string(),
        })
    }
}

/// In-memory key store.
#[derive(Debug, Default)]
pub struct KeyStore {
    store: HashMap<String, KeyRecord>,
}

impl KeyStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads keys from a JSON object of kid to PEM.
    ///
    /// An empty document loads nothing.
    pub fn load_by_json(&mut self, document: &str) -> Result<usize> {
        if document.trim().is_empty() {
            return Ok(0);
        }

        let keys: HashMap<String, String> = serde_json::from_str(document)
            .map_err(|e| AppError::InvalidArgument(format!("parsing key document: {}", e)))?;

        for (kid, pem) in &keys {
            self.insert(KeyRecord::from_pem(kid, pem)?);
        }

        info!(count = keys.len(), "loaded keys from json document");
        Ok(keys.len())
    }

    /// Loads keys from the JSON document held by the environment variable `var`.
    ///
    /// An unset variable loads nothing.
    pub fn load_by_env(&mut self, var: &str) -> Result<usize> {
        match std::env::var(var) {
            Ok(document) => self.load_by_json(&document),
            Err(_) => {
                debug!(var, "key environment variable not set");
                Ok(0)
            }
        }
    }

    /// Loads every `<kid>.pem` file directly inside `dir`.
    pub fn load_by_file_system(&mut self, dir: &Path) -> Result<usize> {
        let entries = fs::read_dir(dir).map_err(|e| {
            AppError::Internal(format!("reading key folder {}: {}", dir.display(), e))
        })?;

        let mut count = 0;
        for entry in entries {
            let entry = entry.map_err(|e| AppError::Internal(format!("walking key folder: {}", e)))?;
            let path = entry.path();

            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("pem") {
                continue;
            }

            let Some(kid) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let pem = fs::read_to_string(&path)
                .map_err(|e| AppError::Internal(format!("reading {}: {}", path.display(), e)))?;

            self.insert(KeyRecord::from_pem(kid, &pem)?);
            count += 1;
        }

        info!(count, folder = %dir.display(), "loaded keys from folder");
        Ok(count)
    }

    /// Adds a single record, replacing any previous record for the kid.
    pub fn insert(&mut self, record: KeyRecord) {
        self.store.insert(record.kid.clone(), record);
    }

    /// Number of kids loaded.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// True when no key is registered.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Loaded kids, sorted.
    pub fn kids(&self) -> Vec<String> {
        let mut kids: Vec<String> = self.store.keys().cloned().collect();
        kids.sort();
        kids
    }
}

impl KeyLookup for KeyStore {
    fn private_key(&self, kid: &str) -> Result<String> {
        let record = self
            .store
            .get(kid)
            .ok_or_else(|| AppError::NotFound(format!("kid [{}] lookup failed", kid)))?;

        record
            .private_pem
            .clone()
            .ok_or_else(|| AppError::NotFound(format!("kid [{}] has no private key", kid)))
    }

    fn public_key(&self, kid: &str) -> Result<String> {
        self.store
            .get(kid)
            .map(|record| record.public_pem.clone())
            .ok_or_else(|| AppError::NotFound(format!("kid [{}] lookup failed", kid)))
    }
}
