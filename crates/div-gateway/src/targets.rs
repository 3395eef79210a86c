//! The projects and applications a gateway serves.
//!
//! Resolved once at startup and never mutated; the event loop only asks
//! whether a resource falls inside it.

use std::collections::BTreeSet;

use tracing::{info, warn};

use div_core::{ApplicationSpec, Kind, KindSpec};
use div_state::ResourceStore;

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Targets {
    cluster: String,
    projects: BTreeSet<String>,
    apps: BTreeSet<String>,
}

impl Targets {
    /// Read projects (all, or only `project_filter`) and the applications
    /// that belong to them (all, or only `app_filter`).
    ///
    /// A filter naming a project that does not exist fails. An application
    /// without a `project` field is corrupt state and fails as an invariant.
    pub fn resolve(
        store: &ResourceStore,
        cluster: &str,
        project_filter: Option<&str>,
        app_filter: Option<&str>,
    ) -> GatewayResult<Self> {
        let project_filter = project_filter.filter(|p| !p.is_empty());
        let app_filter = app_filter.filter(|a| !a.is_empty());

        let projects: BTreeSet<String> = match store.get(Kind::Project, project_filter, &[]) {
            Ok(found) => found.into_iter().map(|p| p.name_hash_key).collect(),
            Err(e) if e.is_not_found() => match project_filter {
                Some(name) => return Err(GatewayError::NoProject(name.to_string())),
                None => {
                    warn!(namespace = %store.namespace(), "no projects found");
                    BTreeSet::new()
                }
            },
            Err(e) => return Err(e.into()),
        };

        let known_apps = match store.get(Kind::Application, None, &[]) {
            Ok(found) => found,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let mut apps = BTreeSet::new();
        for app in known_apps {
            if app_filter.is_some_and(|name| name != app.name_hash_key) {
                continue;
            }
            let spec = ApplicationSpec::decode(&app).map_err(GatewayError::corrupt)?;
            if projects.contains(&spec.project) {
                apps.insert(app.name_hash_key);
            }
        }

        info!(%cluster, ?projects, ?apps, "gateway targets resolved");
        Ok(Self {
            cluster: cluster.to_string(),
            projects,
            apps,
        })
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn projects(&self) -> &BTreeSet<String> {
        &self.projects
    }

    pub fn apps(&self) -> &BTreeSet<String> {
        &self.apps
    }

    /// The (project, app) pair is served by this gateway.
    pub fn includes(&self, project: &str, app: &str) -> bool {
        self.projects.contains(project) && self.apps.contains(app)
    }

    /// As [`includes`](Self::includes), and the resource is for this cluster.
    pub fn includes_on_cluster(&self, project: &str, app: &str, cluster: &str) -> bool {
        self.includes(project, app) && cluster == self.cluster
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use div_core::{Config, ProjectSpec, Resource};
    use div_state::RedbBackend;
    use serde_json::Map;

    fn store() -> ResourceStore {
        let backend = RedbBackend::open_in_memory().unwrap();
        let store = ResourceStore::new(Arc::new(backend), "mydb", "default");
        store
            .provision(&Config::scaffold("mydb").spec.custom_resource_definitions)
            .unwrap();
        store
    }

    fn project(store: &ResourceStore, name: &str) {
        store.apply(&ProjectSpec {}.into_resource(name).unwrap()).unwrap();
    }

    fn app(store: &ResourceStore, name: &str, project: &str) {
        let spec = ApplicationSpec {
            project: project.into(),
        };
        store.apply(&spec.into_resource(name).unwrap()).unwrap();
    }

    #[test]
    fn apps_follow_their_projects() {
        let store = store();
        project(&store, "myproj");
        project(&store, "other");
        app(&store, "app1", "myproj");
        app(&store, "app2", "other");
        app(&store, "orphan", "gone");

        let all = Targets::resolve(&store, "prod1", None, None).unwrap();
        assert_eq!(all.projects().len(), 2);
        assert!(all.includes("myproj", "app1"));
        assert!(all.includes("other", "app2"));
        assert!(!all.apps().contains("orphan"));

        let one = Targets::resolve(&store, "prod1", Some("myproj"), None).unwrap();
        assert!(one.includes("myproj", "app1"));
        assert!(!one.includes("other", "app2"));
        assert!(one.includes_on_cluster("myproj", "app1", "prod1"));
        assert!(!one.includes_on_cluster("myproj", "app1", "prod2"));
    }

    #[test]
    fn app_filter_narrows_the_set() {
        let store = store();
        project(&store, "myproj");
        app(&store, "app1", "myproj");
        app(&store, "app2", "myproj");

        let targets = Targets::resolve(&store, "prod1", None, Some("app2")).unwrap();
        assert_eq!(targets.apps().iter().collect::<Vec<_>>(), ["app2"]);
    }

    #[test]
    fn unknown_project_filter_fails_fast() {
        let store = store();
        project(&store, "myproj");
        let err = Targets::resolve(&store, "prod1", Some("nope"), None).unwrap_err();
        assert!(matches!(err, GatewayError::NoProject(ref name) if name == "nope"));
        assert_eq!(err.to_string(), "no project named \"nope\" found");
    }

    #[test]
    fn empty_namespace_has_no_targets() {
        let targets = Targets::resolve(&store(), "prod1", None, None).unwrap();
        assert!(targets.projects().is_empty() && targets.apps().is_empty());
    }

    #[test]
    fn application_without_project_is_an_invariant_violation() {
        let store = store();
        project(&store, "myproj");
        let broken = Resource::new(Kind::Application, "app1", Map::new());
        store.apply(&broken).unwrap();

        let err = Targets::resolve(&store, "prod1", None, None).unwrap_err();
        assert!(matches!(err, GatewayError::Invariant(_)));
    }
}
