use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::lock;

/// The four customization surfaces a script can touch. The engine stores
/// their records; applying them is the consumer's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomizationKind {
    ModelPart,
    Nameplate,
    Camera,
    EmoteWheel,
}

impl CustomizationKind {
    pub const ALL: [CustomizationKind; 4] = [
        CustomizationKind::ModelPart,
        CustomizationKind::Nameplate,
        CustomizationKind::Camera,
        CustomizationKind::EmoteWheel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CustomizationKind::ModelPart => "model_part",
            CustomizationKind::Nameplate => "nameplate",
            CustomizationKind::Camera => "camera",
            CustomizationKind::EmoteWheel => "emote_wheel",
        }
    }
}

impl FromStr for CustomizationKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        CustomizationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| format!("unknown customization kind '{value}'"))
    }
}

/// Opaque field bag for one accessor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomizationRecord {
    pub fields: BTreeMap<String, Value>,
}

impl CustomizationRecord {
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

pub type SharedRecord = Arc<Mutex<CustomizationRecord>>;

/// Accessor → record with get-or-create semantics. Records are never removed.
#[derive(Debug, Default)]
pub struct CustomizationMap {
    records: Mutex<HashMap<String, SharedRecord>>,
}

impl CustomizationMap {
    pub fn get_or_create(&self, accessor: &str) -> SharedRecord {
        let mut records = lock(&self.records);
        records
            .entry(accessor.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CustomizationRecord::default())))
            .clone()
    }

    pub fn get(&self, accessor: &str) -> Option<SharedRecord> {
        lock(&self.records).get(accessor).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn accessors(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.records).keys().cloned().collect();
        names.sort();
        names
    }
}

/// One map per customization kind, owned by a script instance.
#[derive(Debug, Default)]
pub struct Customizations {
    model_parts: CustomizationMap,
    nameplates: CustomizationMap,
    cameras: CustomizationMap,
    emote_wheel: CustomizationMap,
}

impl Customizations {
    pub fn map(&self, kind: CustomizationKind) -> &CustomizationMap {
        match kind {
            CustomizationKind::ModelPart => &self.model_parts,
            CustomizationKind::Nameplate => &self.nameplates,
            CustomizationKind::Camera => &self.cameras,
            CustomizationKind::EmoteWheel => &self.emote_wheel,
        }
    }

    pub fn get_or_create(&self, kind: CustomizationKind, accessor: &str) -> SharedRecord {
        self.map(kind).get_or_create(accessor)
    }

    pub fn get(&self, kind: CustomizationKind, accessor: &str) -> Option<SharedRecord> {
        self.map(kind).get(accessor)
    }
}
