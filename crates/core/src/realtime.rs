//! Row-level change events pushed by the remote store.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::models::{CollectionKind, Entity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One insert/update/delete with the full record payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: CollectionKind,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
}

impl ChangeEvent {
    pub fn inserted<T: Entity + Serialize>(record: &T) -> Result<Self> {
        Ok(Self {
            table: T::KIND,
            kind: ChangeKind::Insert,
            new: Some(serde_json::to_value(record)?),
            old: None,
        })
    }

    pub fn updated<T: Entity + Serialize>(record: &T, previous: Option<&T>) -> Result<Self> {
        Ok(Self {
            table: T::KIND,
            kind: ChangeKind::Update,
            new: Some(serde_json::to_value(record)?),
            old: previous.map(serde_json::to_value).transpose()?,
        })
    }

    pub fn deleted<T: Entity + Serialize>(record: &T) -> Result<Self> {
        Ok(Self {
            table: T::KIND,
            kind: ChangeKind::Delete,
            new: None,
            old: Some(serde_json::to_value(record)?),
        })
    }

    /// Delete event carrying only the primary and tenant ids.
    pub fn deleted_id(table: CollectionKind, id: &str, tenant_id: &str) -> Self {
        Self {
            table,
            kind: ChangeKind::Delete,
            new: None,
            old: Some(serde_json::json!({ "id": id, "tenantId": tenant_id })),
        }
    }

    pub fn new_record<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        Ok(self.new.clone().map(serde_json::from_value).transpose()?)
    }

    /// Primary id of the affected row, from `old` for deletes and `new`
    /// otherwise.
    pub fn record_id(&self) -> Option<&str> {
        let payload = match self.kind {
            ChangeKind::Delete => self.old.as_ref().or(self.new.as_ref()),
            _ => self.new.as_ref().or(self.old.as_ref()),
        };
        payload.and_then(|v| v.get("id")).and_then(Value::as_str)
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .and_then(|v| v.get("tenantId"))
            .and_then(Value::as_str)
    }
}

/// Applies an event to the `tenant_id` slice of a collection: inserts and
/// updates upsert by id, deletes remove by id. Records of other tenants are
/// never matched. Returns `None` when the collection is unchanged.
pub fn apply_change<T: Entity + DeserializeOwned>(
    items: &[T],
    event: &ChangeEvent,
    tenant_id: &str,
) -> Result<Option<Vec<T>>> {
    let owned = |item: &T, id: &str| item.id() == id && item.tenant_id() == tenant_id;
    match event.kind {
        ChangeKind::Insert | ChangeKind::Update => {
            let Some(record) = event.new_record::<T>()? else {
                return Ok(None);
            };
            if record.tenant_id() != tenant_id {
                return Ok(None);
            }
            let mut next = items.to_vec();
            match next.iter_mut().find(|item| owned(item, record.id())) {
                Some(existing) => *existing = record,
                None => next.push(record),
            }
            Ok(Some(next))
        }
        ChangeKind::Delete => {
            let Some(id) = event.record_id() else {
                return Ok(None);
            };
            if !items.iter().any(|item| owned(item, id)) {
                return Ok(None);
            }
            Ok(Some(items.iter().filter(|item| !owned(item, id)).cloned().collect()))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::{Resource, ResourceKind};

    fn resource(id: &str, name: &str) -> Resource {
        Resource {
            id: id.into(),
            tenant_id: "c1".into(),
            name: name.into(),
            kind: ResourceKind::Human,
            hourly_cost: None,
            active: true,
        }
    }

    #[test]
    fn update_replaces_by_primary_id() {
        let items = vec![resource("r1", "Pedreiro"), resource("r2", "Servente")];
        let event = ChangeEvent::updated(&resource("r2", "Carpinteiro"), None).unwrap();

        let next = apply_change(&items, &event, "c1").unwrap().unwrap();
        assert_eq!(next.len(), 2);
        assert_eq!(next[1].name, "Carpinteiro");
    }

    #[test]
    fn insert_of_unknown_id_appends() {
        let items = vec![resource("r1", "Pedreiro")];
        let event = ChangeEvent::inserted(&resource("r3", "Eletricista")).unwrap();
        let next = apply_change(&items, &event, "c1").unwrap().unwrap();
        assert_eq!(next.last().unwrap().id, "r3");
    }

    #[test]
    fn delete_uses_old_payload() {
        let items = vec![resource("r1", "Pedreiro"), resource("r2", "Servente")];
        let event = ChangeEvent::deleted_id(CollectionKind::Resources, "r1", "c1");
        assert_eq!(event.tenant_id(), Some("c1"));

        let next = apply_change(&items, &event, "c1").unwrap().unwrap();
        assert_eq!(next, vec![resource("r2", "Servente")]);
        assert!(apply_change(&next, &event, "c1").unwrap().is_none());
    }

    #[test]
    fn delete_without_tenant_leaves_other_tenants_alone() {
        let mut foreign = resource("r1", "Pedreiro");
        foreign.tenant_id = "c2".into();
        let items = vec![foreign.clone(), resource("r1", "Pedreiro")];
        let event: ChangeEvent = serde_json::from_value(json!({
            "table": "resources",
            "kind": "DELETE",
            "old": {"id": "r1"}
        }))
        .unwrap();

        let next = apply_change(&items, &event, "c1").unwrap().unwrap();
        assert_eq!(next, vec![foreign.clone()]);
        assert!(apply_change(&[foreign], &event, "c1").unwrap().is_none());
    }

    #[test]
    fn upsert_does_not_replace_another_tenants_record() {
        let mut foreign = resource("r1", "Pedreiro");
        foreign.tenant_id = "c2".into();
        let event = ChangeEvent::updated(&resource("r1", "Carpinteiro"), None).unwrap();

        let next = apply_change(&[foreign.clone()], &event, "c1").unwrap().unwrap();
        assert_eq!(next.len(), 2);
        assert_eq!(next[0], foreign);
        assert_eq!(next[1].name, "Carpinteiro");
    }

    #[test]
    fn wire_format() {
        let event: ChangeEvent = serde_json::from_value(json!({
            "table": "daily_logs",
            "kind": "DELETE",
            "old": {"id": "log-1"}
        }))
        .unwrap();
        assert_eq!(event.table, CollectionKind::DailyLogs);
        assert_eq!(event.record_id(), Some("log-1"));
    }
}
