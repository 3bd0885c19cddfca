//! Tenant scoping of global collections.
//!
//! Collections hold records of every tenant the session has seen. Screens
//! only ever get the sub-sequence owned by the session tenant.

use std::sync::Arc;

use crate::models::{Entity, Tenant, User};

/// Records owned by `tenant_id`, in source order. An empty tenant id (no
/// authenticated tenant) matches nothing.
pub fn scoped<'a, T: Entity>(
    items: &'a [T],
    tenant_id: &'a str,
) -> impl Iterator<Item = &'a T> + 'a {
    items
        .iter()
        .filter(move |item| !tenant_id.is_empty() && item.tenant_id() == tenant_id)
}

pub fn scope<T: Entity>(items: &[T], tenant_id: &str) -> Vec<T> {
    scoped(items, tenant_id).cloned().collect()
}

/// Replaces one tenant's slice of a global collection. Records of other
/// tenants are kept in place; `updated` is appended with its tenant id forced
/// to `tenant_id`.
pub fn merge_tenant_slice<T: Entity>(all: &[T], tenant_id: &str, updated: Vec<T>) -> Vec<T> {
    let mut merged: Vec<T> = all
        .iter()
        .filter(|item| item.tenant_id() != tenant_id)
        .cloned()
        .collect();
    merged.extend(updated.into_iter().map(|mut item| {
        item.set_tenant_id(tenant_id.to_string());
        item
    }));
    merged
}

/// The tenant a session acts for. Superadmins act for the first tenant of
/// the global collection; everyone else for their own.
pub fn active_tenant<'a>(user: &User, tenants: &'a [Tenant]) -> Option<&'a Tenant> {
    if user.role.is_superadmin() {
        return tenants.first();
    }
    tenants.iter().find(|t| t.id == user.tenant_id)
}

/// Memoized tenant view of a collection.
///
/// Collections are replaced, never edited in place, so identity of the
/// source `Arc` tells whether the cached view is stale.
#[derive(Debug)]
pub struct TenantView<T> {
    source: Option<Arc<Vec<T>>>,
    tenant_id: String,
    view: Arc<Vec<T>>,
}

impl<T> Default for TenantView<T> {
    fn default() -> Self {
        Self {
            source: None,
            tenant_id: String::new(),
            view: Arc::new(Vec::new()),
        }
    }
}

impl<T: Entity> TenantView<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, source: &Arc<Vec<T>>, tenant_id: &str) -> Arc<Vec<T>> {
        let fresh = self
            .source
            .as_ref()
            .is_some_and(|cached| Arc::ptr_eq(cached, source))
            && self.tenant_id == tenant_id;

        if !fresh {
            self.view = Arc::new(scope(source, tenant_id));
            self.source = Some(Arc::clone(source));
            self.tenant_id = tenant_id.to_string();
        }
        Arc::clone(&self.view)
    }
}
