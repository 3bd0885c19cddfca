//! Tolerant reader for a task's resource-allocation field.
//!
//! The stored field is polymorphic: a JSON list (of bare resource ids or
//! objects), the same list serialized into a string, or nothing at all. It is
//! decoded once into [`AllocationField`], which keeps the canonical list and
//! remembers the source shape so write-back reproduces it.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::debug;

use crate::reconcile::IdMapping;

/// Keys that may carry the resource reference, in priority order.
const RESOURCE_ID_KEYS: [&str; 7] = [
    "resourceId",
    "recursoId",
    "resource_id",
    "recurso_id",
    "id",
    "userId",
    "user_id",
];

const QUANTITY_KEYS: [&str; 3] = ["quantity", "quantidade", "qty"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub resource_id: String,
    /// Headcount-equivalent.
    pub quantity: f64,
}

impl Allocation {
    pub fn new(resource_id: impl Into<String>, quantity: f64) -> Self {
        Self {
            resource_id: resource_id.into(),
            quantity,
        }
    }
}

/// How the field was stored when it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationShape {
    List,
    Text,
    #[default]
    Absent,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AllocationField {
    items: Vec<Allocation>,
    shape: AllocationShape,
}

/// Resource ids compare trimmed and case-insensitively.
pub fn same_resource_id(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

impl AllocationField {
    pub fn new(items: Vec<Allocation>) -> Self {
        Self {
            items,
            shape: AllocationShape::List,
        }
    }

    /// Decodes a raw stored value. Never fails: anything unreadable is an
    /// empty list.
    pub fn parse(raw: &Value) -> Self {
        match raw {
            Value::Array(elements) => Self {
                items: normalize(elements),
                shape: AllocationShape::List,
            },
            Value::String(text) => Self::from_text(text),
            _ => Self::default(),
        }
    }

    pub fn from_text(text: &str) -> Self {
        let items = if text.trim().is_empty() {
            Vec::new()
        } else {
            match serde_json::from_str::<Value>(text) {
                Ok(Value::Array(elements)) => normalize(&elements),
                Ok(_) => {
                    debug!("Allocation text is not a list, treating as empty");
                    Vec::new()
                }
                Err(e) => {
                    debug!(error = %e, "Malformed allocation text, treating as empty");
                    Vec::new()
                }
            }
        };

        Self {
            items,
            shape: AllocationShape::Text,
        }
    }

    pub fn items(&self) -> &[Allocation] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Allocation> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn shape(&self) -> AllocationShape {
        self.shape
    }

    pub fn is_absent(&self) -> bool {
        self.shape == AllocationShape::Absent && self.items.is_empty()
    }

    pub fn push(&mut self, allocation: Allocation) {
        if self.shape == AllocationShape::Absent {
            self.shape = AllocationShape::List;
        }
        self.items.push(allocation);
    }

    pub fn references(&self, resource_id: &str) -> bool {
        self.items
            .iter()
            .any(|a| same_resource_id(&a.resource_id, resource_id))
    }

    /// Copy without any allocation pointing at `resource_id`, same shape.
    pub fn without_resource(&self, resource_id: &str) -> Self {
        Self {
            items: self
                .items
                .iter()
                .filter(|a| !same_resource_id(&a.resource_id, resource_id))
                .cloned()
                .collect(),
            shape: self.shape,
        }
    }

    /// Rewrites resource references that were reconciled to permanent ids.
    /// `None` when nothing pointed at a remapped id.
    pub fn remap_resources(&self, mapping: &IdMapping) -> Option<Self> {
        let mut changed = false;
        let items: Vec<Allocation> = self
            .items
            .iter()
            .map(|a| {
                let mut a = a.clone();
                changed |= mapping.remap(&mut a.resource_id);
                a
            })
            .collect();
        changed.then(|| Self {
            items,
            shape: self.shape,
        })
    }

    /// The canonical list encoded as JSON text.
    pub fn to_text(&self) -> String {
        serde_json::to_string(&self.items).unwrap_or_else(|_| "[]".to_string())
    }

    /// Encodes back into the representation the field was read from.
    pub fn to_raw(&self) -> Value {
        match self.shape {
            AllocationShape::Text => Value::String(self.to_text()),
            AllocationShape::Absent if self.items.is_empty() => Value::Null,
            AllocationShape::List | AllocationShape::Absent => Value::Array(
                self.items
                    .iter()
                    .map(|a| {
                        let mut obj = Map::new();
                        obj.insert("resourceId".into(), Value::from(a.resource_id.clone()));
                        obj.insert("quantity".into(), Value::from(a.quantity));
                        Value::Object(obj)
                    })
                    .collect(),
            ),
        }
    }
}

impl<'a> IntoIterator for &'a AllocationField {
    type Item = &'a Allocation;
    type IntoIter = std::slice::Iter<'a, Allocation>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl Serialize for AllocationField {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_raw().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AllocationField {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

fn normalize(elements: &[Value]) -> Vec<Allocation> {
    elements.iter().filter_map(parse_element).collect()
}

fn parse_element(element: &Value) -> Option<Allocation> {
    match element {
        Value::String(id) if !id.trim().is_empty() => Some(Allocation::new(id.clone(), 1.0)),
        Value::Number(n) => Some(Allocation::new(n.to_string(), 1.0)),
        Value::Object(obj) => {
            let resource_id = RESOURCE_ID_KEYS
                .iter()
                .find_map(|key| obj.get(*key).and_then(id_value))?;
            let quantity = QUANTITY_KEYS
                .iter()
                .find_map(|key| obj.get(*key).and_then(quantity_value))
                .unwrap_or(1.0);
            Some(Allocation::new(resource_id, quantity))
        }
        _ => None,
    }
}

fn id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn quantity_value(value: &Value) -> Option<f64> {
    let quantity = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    quantity.filter(|q| q.is_finite())
}
