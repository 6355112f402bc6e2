//! Workflow artifact validation
//!
//! An artifact is a wasm binary, optionally gzip-compressed, carrying two
//! custom sections: `interfaceVersion` (must be [`SUPPORTED_INTERFACE_VERSION`])
//! and `bundleIdentifier` (must be non-empty). Validation happens before any
//! compilation so a bad candidate never touches the running instance.

use flate2::read::GzDecoder;
use std::io::Read;
use tracing::debug;
use wasmparser::{Parser, Payload};

use super::types::{EeaResult, ValidationError};

pub const SUPPORTED_INTERFACE_VERSION: &str = "1.0.0";
pub const INTERFACE_VERSION_SECTION: &str = "interfaceVersion";
pub const BUNDLE_IDENTIFIER_SECTION: &str = "bundleIdentifier";

/// Bundle reported in hello messages when nothing is loaded
pub const NULL_BUNDLE: &str = "nullVersion";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A validated artifact
#[derive(Debug, Clone)]
pub struct ModuleArtifact {
    /// Raw bytes as received, persisted after a successful swap
    raw: Vec<u8>,
    /// Uncompressed wasm
    wasm: Vec<u8>,
    pub interface_version: String,
    pub bundle_identifier: String,
}

impl ModuleArtifact {
    /// Inflate if needed, then read and check the metadata sections
    pub fn parse(bytes: impl Into<Vec<u8>>) -> EeaResult<Self> {
        let raw = bytes.into();
        let wasm = if is_gzip(&raw) {
            inflate(&raw)?
        } else {
            raw.clone()
        };

        let mut interface_version = None;
        let mut bundle_identifier = None;

        for payload in Parser::new(0).parse_all(&wasm) {
            let payload = payload.map_err(|e| ValidationError::Malformed(e.to_string()))?;
            if let Payload::CustomSection(reader) = payload {
                let value = || String::from_utf8_lossy(reader.data()).into_owned();
                match reader.name() {
                    INTERFACE_VERSION_SECTION => interface_version = Some(value()),
                    BUNDLE_IDENTIFIER_SECTION => bundle_identifier = Some(value()),
                    _ => {}
                }
            }
        }

        let interface_version = match interface_version {
            Some(v) if v == SUPPORTED_INTERFACE_VERSION => v,
            other => return Err(ValidationError::UnsupportedInterfaceVersion(other).into()),
        };
        let bundle_identifier = bundle_identifier
            .filter(|id| !id.is_empty())
            .ok_or(ValidationError::MissingBundleIdentifier)?;

        debug!(
            %bundle_identifier,
            %interface_version,
            compressed = is_gzip(&raw),
            "Artifact validated"
        );

        Ok(Self {
            raw,
            wasm,
            interface_version,
            bundle_identifier,
        })
    }

    pub fn wasm(&self) -> &[u8] {
        &self.wasm
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn is_compressed(&self) -> bool {
        is_gzip(&self.raw)
    }
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

fn inflate(bytes: &[u8]) -> EeaResult<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| ValidationError::Malformed(format!("gzip: {}", e)))?;
    Ok(out)
}
