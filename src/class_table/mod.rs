//! Known record classes and block classification.
//!
//! # Identity rules
//! A block's `(class_id, major_version, minor_version)` names a record class
//! version; `data_id` names a sub-type inside that version.  A reader only
//! trusts a header whose full [`RecordKey`] appears in the table.  The table is
//! consulted by the recovery engine (to judge realignment candidates) and by
//! diagnostics; it never changes how a well-formed block is decoded.
//!
//! # Built-in families
//!
//! | class_id | Domain       | Versions → data ids              |
//! |---------:|--------------|----------------------------------|
//! | `0x0001` | experiment   | 1.0 → 1..=3, 1.1 → 1..=4         |
//! | `0x0002` | gps_pvt      | 1.0 → 1..=3, 2.0 → 1..=4         |
//! | `0x0003` | camera       | 1.0 → 1..=2, 1.1 → 1..=3         |
//! | `0x0004` | lidar        | 1.0 → 1..=3                      |
//! | `0x0005` | positioning  | 1.0 → 1..=2                      |
//! | `0x0006` | weather      | 1.0 → 1                          |

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::block::{checksum, BlockHeader, RecordKey};

// ── Frozen class ids ─────────────────────────────────────────────────────────

pub const CLASS_EXPERIMENT:  u16 = 0x0001;
pub const CLASS_GPS_PVT:     u16 = 0x0002;
pub const CLASS_CAMERA:      u16 = 0x0003;
pub const CLASS_LIDAR:       u16 = 0x0004;
pub const CLASS_POSITIONING: u16 = 0x0005;
pub const CLASS_WEATHER:     u16 = 0x0006;

// ── Data ids used by the built-in validators ─────────────────────────────────

pub const EXPERIMENT_INFO:     u16 = 1;
pub const EXPERIMENT_COMMENT:  u16 = 3;
pub const PVT_POSITION:        u16 = 1;
pub const PVT_VELOCITY:        u16 = 2;
pub const CAMERA_IMAGE:        u16 = 1;
pub const LIDAR_FRAME:         u16 = 1;
pub const WEATHER_CONDITIONS:  u16 = 1;

// ── Status ───────────────────────────────────────────────────────────────────

/// Classification of one block against the table.  Diagnostic only; never
/// propagated as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockStatus {
    Ok,
    BadClassId,
    BadMajorVersion,
    BadMinorVersion,
    BadDataId,
    BadPayload,
}

impl BlockStatus {
    pub fn is_ok(self) -> bool {
        self == BlockStatus::Ok
    }

    pub fn label(self) -> &'static str {
        match self {
            BlockStatus::Ok              => "ok",
            BlockStatus::BadClassId      => "unknown class id",
            BlockStatus::BadMajorVersion => "unknown major version",
            BlockStatus::BadMinorVersion => "unknown minor version",
            BlockStatus::BadDataId       => "unknown data id",
            BlockStatus::BadPayload      => "payload checksum mismatch",
        }
    }
}

// ── Table ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ClassSpec {
    class_id: u16,
    name:     String,
    /// `(major, minor)` → accepted data ids.
    versions: BTreeMap<(u8, u8), BTreeSet<u16>>,
}

#[derive(Debug, Clone)]
pub struct ClassTable {
    classes: BTreeMap<u16, ClassSpec>,
    keys:    Vec<RecordKey>,
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ClassTable {
    pub fn builder() -> ClassTableBuilder {
        ClassTableBuilder::default()
    }

    pub fn builtin() -> Self {
        Self::builder()
            .class(CLASS_EXPERIMENT, "experiment", &[((1, 0), &[1, 2, 3]), ((1, 1), &[1, 2, 3, 4])])
            .class(CLASS_GPS_PVT, "gps_pvt", &[((1, 0), &[1, 2, 3]), ((2, 0), &[1, 2, 3, 4])])
            .class(CLASS_CAMERA, "camera", &[((1, 0), &[1, 2]), ((1, 1), &[1, 2, 3])])
            .class(CLASS_LIDAR, "lidar", &[((1, 0), &[1, 2, 3])])
            .class(CLASS_POSITIONING, "positioning", &[((1, 0), &[1, 2])])
            .class(CLASS_WEATHER, "weather", &[((1, 0), &[1])])
            .build()
    }

    pub fn class_name(&self, class_id: u16) -> Option<&str> {
        self.classes.get(&class_id).map(|c| c.name.as_str())
    }

    /// Every accepted record key, sorted.
    pub fn keys(&self) -> &[RecordKey] {
        &self.keys
    }

    pub fn accepts(&self, key: &RecordKey) -> bool {
        self.classify_key(key).is_ok()
    }

    /// Walk class → major → minor → data id.  Returns `Ok` when the key is
    /// known; the payload is not looked at.
    pub fn classify_key(&self, key: &RecordKey) -> BlockStatus {
        let Some(spec) = self.classes.get(&key.class_id) else {
            return BlockStatus::BadClassId;
        };
        if !spec.versions.keys().any(|(major, _)| *major == key.major_version) {
            return BlockStatus::BadMajorVersion;
        }
        let Some(data_ids) = spec.versions.get(&(key.major_version, key.minor_version)) else {
            return BlockStatus::BadMinorVersion;
        };
        if !data_ids.contains(&key.data_id) {
            return BlockStatus::BadDataId;
        }
        BlockStatus::Ok
    }

    pub fn classify_header(&self, header: &BlockHeader) -> BlockStatus {
        self.classify_key(&header.key())
    }

    /// Full classification: header against the table, then the checksum.
    pub fn classify(&self, header: &BlockHeader, payload: &[u8], stored_checksum: u32) -> BlockStatus {
        match self.classify_header(header) {
            BlockStatus::Ok if checksum(header, payload) != stored_checksum => BlockStatus::BadPayload,
            status => status,
        }
    }

    /// Known keys within `max_bit_errors` bit flips of `key` (over the six
    /// checksum-prefix bytes), nearest first.  `key` itself is excluded.
    pub fn nearest_keys(&self, key: &RecordKey, max_bit_errors: u32) -> Vec<RecordKey> {
        let mut found: Vec<(u32, RecordKey)> = self
            .keys
            .iter()
            .map(|k| (bit_distance(k, key), *k))
            .filter(|(d, _)| *d > 0 && *d <= max_bit_errors)
            .collect();
        found.sort();
        found.into_iter().map(|(_, k)| k).collect()
    }
}

fn bit_distance(a: &RecordKey, b: &RecordKey) -> u32 {
    (a.class_id ^ b.class_id).count_ones()
        + (a.major_version ^ b.major_version).count_ones()
        + (a.minor_version ^ b.minor_version).count_ones()
        + (a.data_id ^ b.data_id).count_ones()
}

// ── Builder ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ClassTableBuilder {
    classes: BTreeMap<u16, ClassSpec>,
}

impl ClassTableBuilder {
    /// Register (or extend) a class with its accepted versions and data ids.
    pub fn class(mut self, class_id: u16, name: &str, versions: &[((u8, u8), &[u16])]) -> Self {
        let spec = self.classes.entry(class_id).or_insert_with(|| ClassSpec {
            class_id,
            name:     name.to_string(),
            versions: BTreeMap::new(),
        });
        for (version, data_ids) in versions {
            spec.versions.entry(*version).or_default().extend(data_ids.iter().copied());
        }
        self
    }

    pub fn build(self) -> ClassTable {
        let mut keys = Vec::new();
        for spec in self.classes.values() {
            for ((major, minor), data_ids) in &spec.versions {
                for data_id in data_ids {
                    keys.push(RecordKey::new(spec.class_id, *major, *minor, *data_id));
                }
            }
        }
        keys.sort();
        ClassTable { classes: self.classes, keys }
    }
}
