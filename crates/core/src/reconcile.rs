//! Temporary-id reconciliation.
//!
//! Records created offline carry a placeholder id (`p-1718000000000`). The
//! remote upsert answers with a mapping from each placeholder to the
//! permanent id it assigned, which is then applied to local state.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{CollectionKind, Entity};

/// Old (temporary) id to new (permanent) id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdMapping(HashMap<String, String>);

impl IdMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, old_id: impl Into<String>, new_id: impl Into<String>) {
        self.0.insert(old_id.into(), new_id.into());
    }

    pub fn get(&self, old_id: &str) -> Option<&str> {
        self.0.get(old_id).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Rewrites `id` in place if it is a mapped old id.
    pub fn remap(&self, id: &mut String) -> bool {
        match self.0.get(id.as_str()) {
            Some(new_id) if new_id != id => {
                *id = new_id.clone();
                true
            }
            _ => false,
        }
    }
}

impl From<HashMap<String, String>> for IdMapping {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, String)> for IdMapping {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

pub fn temporary_id(kind: CollectionKind, now: DateTime<Utc>) -> String {
    format!("{}{}", kind.temporary_prefixes()[0], now.timestamp_millis())
}

pub fn is_temporary(kind: CollectionKind, id: &str) -> bool {
    id.is_empty()
        || kind
            .temporary_prefixes()
            .iter()
            .any(|prefix| id.starts_with(prefix))
}

/// Applies `mapping` to the id field of every record owned by `tenant_id`.
/// Returns the rewritten collection and how many records changed; all other
/// fields and other tenants' records are untouched. Applying the same
/// mapping again changes nothing.
///
/// A record that already carries a new id while its temporary twin is still
/// present is the pushed echo of the same upsert and gets dropped.
pub fn apply_mapping<T: Entity>(items: &[T], mapping: &IdMapping, tenant_id: &str) -> (Vec<T>, usize) {
    let owned = |item: &T| item.tenant_id() == tenant_id;
    let echoes: HashSet<&str> = items
        .iter()
        .filter(|item| owned(item))
        .filter_map(|item| mapping.get(item.id()))
        .filter(|new_id| mapping.get(new_id).is_none())
        .collect();

    let mut changed = 0;
    let items = items
        .iter()
        .filter(|item| !(owned(item) && echoes.contains(item.id())))
        .map(|item| match mapping.get(item.id()) {
            Some(new_id) if owned(item) && new_id != item.id() => {
                changed += 1;
                let mut item = item.clone();
                item.set_id(new_id.to_string());
                item
            }
            _ => item.clone(),
        })
        .collect();
    (items, changed)
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone};

    use super::*;
    use crate::models::{Project, ProjectStatus};

    fn project(id: &str, name: &str) -> Project {
        Project {
            id: id.into(),
            tenant_id: "c1".into(),
            name: name.into(),
            description: None,
            client_name: None,
            location: "Obra".into(),
            status: ProjectStatus::Planning,
            start_date: NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2025, 3, 28).unwrap(),
            budget: 100_000.0,
            logo_url: None,
            baseline_set: false,
        }
    }

    fn mapping() -> IdMapping {
        let mut mapping = IdMapping::new();
        mapping.insert("p-1", "5f0c1e4a-0000-4000-8000-000000000001");
        mapping
    }

    #[test]
    fn rewrites_only_the_id_of_matching_records() {
        let items = vec![project("p-1", "Nova"), project("a1b2", "Antiga")];
        let (out, changed) = apply_mapping(&items, &mapping(), "c1");

        assert_eq!(changed, 1);
        assert_eq!(out[0].id, "5f0c1e4a-0000-4000-8000-000000000001");
        assert_eq!(out[0].name, "Nova");
        assert_eq!(out[0].budget, items[0].budget);
        assert_eq!(out[1], items[1]);
    }

    #[test]
    fn applying_twice_is_a_no_op() {
        let items = vec![project("p-1", "Nova"), project("p-2", "Outra")];
        let (once, _) = apply_mapping(&items, &mapping(), "c1");
        let (twice, changed) = apply_mapping(&once, &mapping(), "c1");

        assert_eq!(once, twice);
        assert_eq!(changed, 0);
    }

    #[test]
    fn echoed_record_is_superseded_by_local_one() {
        let mut echo = project("5f0c1e4a-0000-4000-8000-000000000001", "Eco");
        echo.budget = 1.0;
        let items = vec![project("p-1", "Nova"), echo];
        let (out, changed) = apply_mapping(&items, &mapping(), "c1");

        assert_eq!(changed, 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "Nova");
    }

    #[test]
    fn other_tenants_records_keep_colliding_ids() {
        let mut foreign = project("p-1", "Vizinha");
        foreign.tenant_id = "c2".into();
        let mut foreign_echo = project("5f0c1e4a-0000-4000-8000-000000000001", "Vizinha eco");
        foreign_echo.tenant_id = "c2".into();
        let items = vec![project("p-1", "Nova"), foreign.clone(), foreign_echo.clone()];

        let (out, changed) = apply_mapping(&items, &mapping(), "c1");
        assert_eq!(changed, 1);
        assert_eq!(out[0].id, "5f0c1e4a-0000-4000-8000-000000000001");
        assert_eq!(out[1], foreign);
        assert_eq!(out[2], foreign_echo);
    }

    #[test]
    fn remap_single_reference() {
        let mut selected = "p-1".to_string();
        assert!(mapping().remap(&mut selected));
        assert!(!mapping().remap(&mut selected));
        assert_eq!(selected, "5f0c1e4a-0000-4000-8000-000000000001");
    }

    #[test]
    fn temporary_ids_use_collection_prefix() {
        let now = Utc.with_ymd_and_hms(2025, 1, 6, 12, 0, 0).unwrap();
        let id = temporary_id(CollectionKind::Projects, now);
        assert_eq!(id, format!("p-{}", now.timestamp_millis()));
        assert!(is_temporary(CollectionKind::Projects, &id));

        assert!(is_temporary(CollectionKind::Resources, "res-12"));
        assert!(is_temporary(CollectionKind::Resources, "r-12"));
        assert!(!is_temporary(CollectionKind::Tasks, "p-12"));
        assert!(!is_temporary(
            CollectionKind::Tasks,
            "5f0c1e4a-0000-4000-8000-000000000001"
        ));
    }
}
