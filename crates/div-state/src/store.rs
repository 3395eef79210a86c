//! ResourceStore: namespaced, label-filterable CRUD and watch over
//! resource tables.
//!
//! Every operation routes a [`Kind`] to its table with
//! [`tables::table_name`](crate::tables::table_name). A backend
//! `MissingTable` surfaces as [`StateError::TableNotFound`], which tells
//! the user which definition to apply. An existing table with no matching
//! rows surfaces as [`StateError::ResourceNotFound`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use div_core::{CoreError, CustomResourceDefinition, Kind, Resource, Selector, selector};

use crate::backend::{Backend, ChangeKind, Item};
use crate::error::{StateError, StateResult};
use crate::feed::{ChangeFeed, FeedSubscription};
use crate::tables::{self, HASH_KEY};

const WATCH_BUFFER: usize = 64;

/// Live view returned by [`ResourceStore::watch`]: the matching snapshot
/// first, then every matching insert or modify.
pub struct Watch {
    pub resources: mpsc::Receiver<Resource>,
    pub errors: mpsc::Receiver<StateError>,
}

/// Resource access for one (database, namespace).
#[derive(Clone)]
pub struct ResourceStore {
    backend: Arc<dyn Backend>,
    database: String,
    namespace: String,
    throttle_backoff: Duration,
    poll_interval: Duration,
}

impl ResourceStore {
    pub fn new(backend: Arc<dyn Backend>, database: &str, namespace: &str) -> Self {
        Self {
            backend,
            database: database.to_string(),
            namespace: namespace.to_string(),
            throttle_backoff: Duration::from_secs(3),
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Delay between retries of a throttled `list_kinds` scan.
    pub fn with_throttle_backoff(mut self, backoff: Duration) -> Self {
        self.throttle_backoff = backoff;
        self
    }

    /// Change-feed polling interval used by `watch`.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn table_name(&self, kind: Kind) -> String {
        tables::table_name(&self.database, &self.namespace, kind.resource_name())
    }

    fn routing_error(&self, kind: Kind, table: &str, err: StateError) -> StateError {
        match err {
            StateError::MissingTable(_) => StateError::TableNotFound {
                kind: kind.to_string(),
                table: table.to_string(),
            },
            other => other,
        }
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Look up `name` (or scan the whole kind when `name` is empty) and keep
    /// the resources matching every selector.
    pub fn get(
        &self,
        kind: Kind,
        name: Option<&str>,
        selectors: &[Selector],
    ) -> StateResult<Vec<Resource>> {
        let table = self.table_name(kind);
        let name = name.filter(|n| !n.is_empty());
        let items = match name {
            Some(name) => self
                .backend
                .get_item(&table, name)
                .map(|item| item.into_iter().collect()),
            None => self.backend.scan(&table),
        }
        .map_err(|e| self.routing_error(kind, &table, e))?;

        let mut resources = Vec::with_capacity(items.len());
        for item in items {
            let resource = decode(item)?;
            if selector::matches_all(selectors, resource.labels()) {
                resources.push(resource);
            }
        }
        if resources.is_empty() {
            return Err(StateError::ResourceNotFound {
                kind: kind.to_string(),
                name: name.map(str::to_string),
                table,
            });
        }
        debug!(%kind, count = resources.len(), "resources read");
        Ok(resources)
    }

    /// `get` by name, with "not found" as `None`.
    pub fn get_optional(&self, kind: Kind, name: &str) -> StateResult<Option<Resource>> {
        match self.get(kind, Some(name), &[]) {
            Ok(mut found) => Ok(found.pop()),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// All kind definitions, retrying while the backend throttles.
    ///
    /// An unprovisioned database has no definitions table and yields an
    /// empty list.
    pub async fn list_kinds(&self) -> StateResult<Vec<CustomResourceDefinition>> {
        let table = self.table_name(Kind::CustomResourceDefinition);
        loop {
            match self.backend.scan(&table) {
                Ok(items) => {
                    return items
                        .into_iter()
                        .map(|item| decode(item).map(|r| CustomResourceDefinition::from_resource(&r)))
                        .collect();
                }
                Err(StateError::Throttled(reason)) => {
                    warn!(
                        %table,
                        %reason,
                        backoff_ms = self.throttle_backoff.as_millis() as u64,
                        "definition scan throttled, retrying"
                    );
                    tokio::time::sleep(self.throttle_backoff).await;
                }
                Err(StateError::MissingTable(_)) => return Ok(Vec::new()),
                Err(e) => return Err(e),
            }
        }
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Upsert a resource by its key. Last writer wins.
    ///
    /// Applying a `CustomResourceDefinition` creates the definitions table
    /// and the namespaced table of the kind it names.
    pub fn apply(&self, resource: &Resource) -> StateResult<()> {
        if resource.name_hash_key.is_empty() {
            return Err(StateError::Write(format!(
                "{} has an empty {HASH_KEY}",
                resource.kind
            )));
        }
        if resource.kind == Kind::CustomResourceDefinition {
            let crd = CustomResourceDefinition::from_resource(resource);
            let kind = crd
                .kind()
                .ok_or_else(|| CoreError::UnknownKind(crd.metadata.name.clone()))?;
            self.backend
                .create_table(&self.table_name(Kind::CustomResourceDefinition))?;
            self.backend.create_table(&self.table_name(kind))?;
            info!(%kind, namespace = %self.namespace, "kind table provisioned");
        }

        let table = self.table_name(resource.kind);
        let item = serde_json::to_value(resource).map_err(|e| StateError::Serialize(e.to_string()))?;
        self.backend
            .put_item(&table, &item)
            .map_err(|e| self.routing_error(resource.kind, &table, e))?;
        info!(
            kind = %resource.kind,
            name = %resource.name_hash_key,
            namespace = %self.namespace,
            "resource applied"
        );
        Ok(())
    }

    /// Read one resource from a `.json` or `.toml` file and apply it.
    ///
    /// `name_hash_key` defaults to `metadata.name`, and the spec must decode
    /// for its kind.
    pub fn apply_file(&self, path: &Path) -> StateResult<Resource> {
        let content = std::fs::read_to_string(path)?;
        let mut value: serde_json::Value = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str(&content).map_err(|e| StateError::Deserialize(e.to_string()))?
            }
            Some("toml") => {
                let parsed: toml::Value = toml::from_str(&content)
                    .map_err(|e| StateError::Deserialize(e.to_string()))?;
                serde_json::to_value(parsed).map_err(|e| StateError::Deserialize(e.to_string()))?
            }
            _ => {
                return Err(StateError::Deserialize(format!(
                    "{}: expected a .json or .toml file",
                    path.display()
                )));
            }
        };
        if let Some(obj) = value.as_object_mut() {
            if !obj.contains_key(HASH_KEY) {
                if let Some(name) = obj.get("metadata").and_then(|m| m.get("name")).cloned() {
                    obj.insert(HASH_KEY.to_string(), name);
                }
            }
        }
        let resource = decode(value)?;
        div_core::TypedSpec::decode(&resource)?;
        self.apply(&resource)?;
        Ok(resource)
    }

    /// Apply the definition of each kind whose table does not exist yet.
    /// Returns how many were applied.
    pub fn provision(&self, crds: &[CustomResourceDefinition]) -> StateResult<usize> {
        let mut applied = 0;
        for crd in crds {
            let kind = crd
                .kind()
                .ok_or_else(|| CoreError::UnknownKind(crd.metadata.name.clone()))?;
            if self.backend.table_exists(&self.table_name(kind))? {
                continue;
            }
            self.apply(&crd.to_resource())?;
            applied += 1;
        }
        Ok(applied)
    }

    pub fn delete(&self, kind: Kind, name: &str) -> StateResult<()> {
        let table = self.table_name(kind);
        let existed = self
            .backend
            .delete_item(&table, name)
            .map_err(|e| self.routing_error(kind, &table, e))?;
        if !existed {
            return Err(StateError::ResourceNotFound {
                kind: kind.to_string(),
                name: Some(name.to_string()),
                table,
            });
        }
        info!(%kind, %name, namespace = %self.namespace, "resource deleted");
        Ok(())
    }

    // ── Watch ──────────────────────────────────────────────────────

    /// Emit every matching resource once, then every later insert or modify
    /// that matches. Removals are not emitted.
    ///
    /// The change feed is subscribed before the snapshot is read, so a
    /// resource written between the two is seen at least once.
    pub fn watch(
        &self,
        kind: Kind,
        name: Option<&str>,
        selectors: Vec<Selector>,
        shutdown: watch::Receiver<bool>,
    ) -> StateResult<Watch> {
        let table = self.table_name(kind);
        let feed = ChangeFeed::new(self.backend.clone(), table.clone())
            .with_poll_interval(self.poll_interval);
        let subscription = feed
            .subscribe(shutdown.clone())
            .map_err(|e| self.routing_error(kind, &table, e))?;

        let name = name.filter(|n| !n.is_empty()).map(str::to_string);
        let snapshot = match self.get(kind, name.as_deref(), &selectors) {
            Ok(found) => found,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        debug!(%kind, %table, snapshot = snapshot.len(), "watch started");

        let (resource_tx, resources) = mpsc::channel(WATCH_BUFFER);
        let (error_tx, errors) = mpsc::channel(WATCH_BUFFER);
        let filter = WatchFilter { name, selectors };
        tokio::spawn(forward_changes(
            snapshot,
            subscription,
            filter,
            resource_tx,
            error_tx,
            shutdown,
        ));
        Ok(Watch { resources, errors })
    }
}

fn decode(item: Item) -> StateResult<Resource> {
    serde_json::from_value(item).map_err(|e| StateError::Deserialize(e.to_string()))
}

struct WatchFilter {
    name: Option<String>,
    selectors: Vec<Selector>,
}

impl WatchFilter {
    fn matches(&self, resource: &Resource) -> bool {
        self.name
            .as_deref()
            .is_none_or(|n| n == resource.name_hash_key)
            && selector::matches_all(&self.selectors, resource.labels())
    }
}

async fn forward_changes(
    snapshot: Vec<Resource>,
    mut subscription: FeedSubscription,
    filter: WatchFilter,
    resources: mpsc::Sender<Resource>,
    errors: mpsc::Sender<StateError>,
    mut shutdown: watch::Receiver<bool>,
) {
    for resource in snapshot {
        if resources.send(resource).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            record = subscription.records.recv() => {
                let Some(record) = record else {
                    debug!("watch feed closed");
                    return;
                };
                if record.change == ChangeKind::Remove {
                    continue;
                }
                let Some(image) = record.new_image else {
                    continue;
                };
                match decode(image) {
                    Ok(resource) if filter.matches(&resource) => {
                        if resources.send(resource).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = errors.send(e).await;
                    }
                }
            }
            Some(e) = subscription.errors.recv() => {
                let _ = errors.send(e).await;
            }
            _ = resources.closed() => {
                debug!("watch receiver dropped");
                return;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("watch shutting down");
                    return;
                }
            }
        }
    }
}
