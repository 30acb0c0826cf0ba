//! Dataset options
//!
//! Validates the backend tuning annotations against fixed value sets. Values
//! outside a set are logged and dropped; they never fail a create.

use crate::domain::annotations::{
    self, AnnotationSet, ATIME, BLOCKSIZE, CASESENSITIVE, CHECKSUM, COMPRESSION, EXEC, LOGBIAS,
    SNAPDIR, SYNC,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// User property recording which volume a dataset or snapshot was made for
pub const TRACKING_PROPERTY: &str = "zfspv:pvref";

pub const MIN_RECORD_SIZE: u64 = 512;
pub const MAX_RECORD_SIZE: u64 = 131_072;

const CHECKSUM_VALUES: &[&str] = &[
    "on", "off", "fletcher2", "fletcher4", "sha256", "noparity", "sha512", "skein",
];
const COMPRESSION_VALUES: &[&str] = &[
    "on", "off", "lzjb", "zle", "lz4", "gzip", "gzip-1", "gzip-2", "gzip-3", "gzip-4", "gzip-5",
    "gzip-6", "gzip-7", "gzip-8", "gzip-9",
];
const ON_OFF_VALUES: &[&str] = &["on", "off"];
const SYNC_VALUES: &[&str] = &["standard", "always", "disabled"];
const SNAPDIR_VALUES: &[&str] = &["hidden", "visible"];
const CASESENSITIVITY_VALUES: &[&str] = &["sensitive", "insensitive", "mixed"];
const LOGBIAS_VALUES: &[&str] = &["latency", "throughput"];

// =============================================================================
// Quota Mode
// =============================================================================

/// How the requested size is applied to a new dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaMode {
    /// No size limit or guarantee
    Ignore,
    #[default]
    Quota,
    Reserve,
    Both,
}

impl QuotaMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ignore" => Some(QuotaMode::Ignore),
            "quota" => Some(QuotaMode::Quota),
            "reserve" | "reservation" => Some(QuotaMode::Reserve),
            "both" => Some(QuotaMode::Both),
            _ => None,
        }
    }

    /// ZFS properties carrying `size_bytes` for this mode
    pub fn properties(&self, size_bytes: u64) -> Vec<(&'static str, u64)> {
        match self {
            QuotaMode::Ignore => vec![],
            QuotaMode::Quota => vec![("quota", size_bytes)],
            QuotaMode::Reserve => vec![("reservation", size_bytes)],
            QuotaMode::Both => vec![("quota", size_bytes), ("reservation", size_bytes)],
        }
    }
}

// =============================================================================
// Dataset Options
// =============================================================================

/// Validated tuning options for a new dataset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetOptions {
    pub recordsize: Option<u64>,
    pub checksum: Option<String>,
    pub compression: Option<String>,
    pub atime: Option<String>,
    pub exec: Option<String>,
    pub sync: Option<String>,
    pub snapdir: Option<String>,
    pub casesensitivity: Option<String>,
    pub logbias: Option<String>,
}

impl DatasetOptions {
    /// Collect every recognised tuning annotation, dropping invalid values
    pub fn from_annotations(annotations: &AnnotationSet) -> Self {
        Self {
            recordsize: annotations.get(BLOCKSIZE).and_then(|v| {
                let size = record_size(v);
                if size.is_none() {
                    warn!("Ignoring {} annotation value: {}", BLOCKSIZE, v);
                }
                size
            }),
            checksum: enumerated(annotations, CHECKSUM, CHECKSUM_VALUES),
            compression: enumerated(annotations, COMPRESSION, COMPRESSION_VALUES),
            atime: enumerated(annotations, ATIME, ON_OFF_VALUES),
            exec: enumerated(annotations, EXEC, ON_OFF_VALUES),
            sync: enumerated(annotations, SYNC, SYNC_VALUES),
            snapdir: enumerated(annotations, SNAPDIR, SNAPDIR_VALUES),
            casesensitivity: enumerated(annotations, CASESENSITIVE, CASESENSITIVITY_VALUES),
            logbias: enumerated(annotations, LOGBIAS, LOGBIAS_VALUES),
        }
    }

    /// Options as `(zfs property, value)` pairs in a stable order
    pub fn properties(&self) -> Vec<(&'static str, String)> {
        let mut props = Vec::new();
        if let Some(size) = self.recordsize {
            props.push(("recordsize", size.to_string()));
        }
        let named = [
            ("checksum", &self.checksum),
            ("compression", &self.compression),
            ("atime", &self.atime),
            ("exec", &self.exec),
            ("sync", &self.sync),
            ("snapdir", &self.snapdir),
            ("casesensitivity", &self.casesensitivity),
            ("logbias", &self.logbias),
        ];
        for (name, value) in named {
            if let Some(value) = value {
                props.push((name, value.clone()));
            }
        }
        props
    }
}

/// Accept a record size only if it is a power of two within the ZFS limits
pub fn record_size(value: &str) -> Option<u64> {
    let size: u64 = value.trim().parse().ok()?;
    if (MIN_RECORD_SIZE..=MAX_RECORD_SIZE).contains(&size) && size.is_power_of_two() {
        Some(size)
    } else {
        None
    }
}

/// Round `size_bytes` up to a whole number of records
pub fn round_up_to_record(size_bytes: u64, record_size: u64) -> u64 {
    if record_size == 0 {
        return size_bytes;
    }
    size_bytes.div_ceil(record_size).saturating_mul(record_size)
}

fn enumerated(annotations: &AnnotationSet, key: &str, accepted: &[&str]) -> Option<String> {
    let raw = annotations.get(key)?;
    let value = raw.trim().to_ascii_lowercase();
    if accepted.contains(&value.as_str()) {
        Some(value)
    } else {
        warn!(
            "Unexpected {} annotation value: {}",
            key.trim_start_matches(annotations::ANNOTATION_BASE),
            raw
        );
        None
    }
}
