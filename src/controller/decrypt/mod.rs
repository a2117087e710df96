//! # Decryption
//!
//! Decryption of structured documents (dotenv/INI/JSON/YAML) within a source
//! archive. Encrypted documents are recognized by literal SOPS marker
//! substrings; anything without a marker passes through unchanged, so mixed
//! plain/encrypted trees are expected and cheap.

pub mod sops;

use crate::controller::digest::calculate_digest;
use crate::controller::error::ReconcileError;
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;
use zeroize::Zeroize;

/// Key-file suffix for PGP keyring imports.
pub const PGP_KEY_SUFFIX: &str = ".asc";
/// Key-file suffix for age identity imports.
pub const AGE_KEY_SUFFIX: &str = ".agekey";

/// Decrypts a single document, given the path it was found under. Returns
/// the input unchanged when the document carries no supported format marker.
pub trait Decryptor: Send + Sync {
    fn decrypt(&self, data: &[u8], path_hint: &Path) -> Result<Vec<u8>>;
}

/// Structured document formats the decryption engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Dotenv,
    Ini,
    Json,
    Yaml,
    Binary,
}

impl DocumentFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentFormat::Dotenv => "dotenv",
            DocumentFormat::Ini => "ini",
            DocumentFormat::Json => "json",
            DocumentFormat::Yaml => "yaml",
            DocumentFormat::Binary => "binary",
        }
    }

    /// File extension matching the format, used when staging documents for
    /// the decryption engine.
    pub fn extension(self) -> &'static str {
        match self {
            DocumentFormat::Dotenv => "env",
            DocumentFormat::Ini => "ini",
            DocumentFormat::Json => "json",
            DocumentFormat::Yaml => "yaml",
            DocumentFormat::Binary => "bin",
        }
    }

    /// Format implied by a path's extension; anything unrecognized is
    /// treated as binary.
    pub fn for_path(path: &Path) -> DocumentFormat {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => DocumentFormat::Yaml,
            Some("json") => DocumentFormat::Json,
            Some("env") => DocumentFormat::Dotenv,
            Some("ini") => DocumentFormat::Ini,
            _ => DocumentFormat::Binary,
        }
    }
}

const MARKERS: [(DocumentFormat, &[u8]); 4] = [
    (DocumentFormat::Dotenv, b"sops_mac=ENC["),
    (DocumentFormat::Ini, b"[sops]"),
    (DocumentFormat::Json, b"\"mac\": \"ENC["),
    (DocumentFormat::Yaml, b"mac: ENC["),
];

/// Detect an encrypted document by scanning for format marker substrings.
pub fn detect_encrypted_format(data: &[u8]) -> Option<DocumentFormat> {
    MARKERS
        .iter()
        .find(|(_, marker)| contains_subslice(data, marker))
        .map(|(format, _)| *format)
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// Decryption key material, keyed by key-file name. The suffix of each name
/// determines the key class. Raw key bytes are wiped on drop.
#[derive(Debug, Default)]
pub struct KeyBundle {
    keys: BTreeMap<String, Vec<u8>>,
}

impl KeyBundle {
    pub fn new(keys: BTreeMap<String, Vec<u8>>) -> Self {
        KeyBundle { keys }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.keys.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Digest over the full bundle; part of the generator fingerprint so
    /// cache entries are never shared across key bundles.
    pub fn digest(&self) -> String {
        calculate_digest(&self.keys)
    }
}

impl Drop for KeyBundle {
    fn drop(&mut self) {
        for value in self.keys.values_mut() {
            value.zeroize();
        }
    }
}

/// Construct the decryptor for the given provider. `None` when the bundle
/// is empty (nothing to decrypt with); an unsupported provider name is a
/// fatal configuration error.
pub fn new_decryptor(
    provider: Option<&str>,
    keys: KeyBundle,
) -> Result<Option<Box<dyn Decryptor>>, ReconcileError> {
    if keys.is_empty() {
        return Ok(None);
    }
    match provider.unwrap_or("sops") {
        "sops" | "" => {
            let decryptor = sops::SopsDecryptor::new(keys).map_err(ReconcileError::Fatal)?;
            Ok(Some(Box::new(decryptor)))
        }
        other => Err(ReconcileError::fatal(format!(
            "invalid decryption provider: {other}"
        ))),
    }
}
