//! Reverse dependency index: for each component, the set of components that
//! declare it as a dependency. The reconciler keeps the index current on
//! every pass; the watch mapper consults it to requeue dependents as soon as
//! a dependency becomes ready, instead of leaving them to their error
//! backoff.

use crate::crd::Component;
use kube::ResourceExt;
use kube_runtime::reflector::ObjectRef;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

#[derive(Default)]
pub struct DependencyIndex {
    /// `namespace/name` dependency key to the (namespace, name) pairs of the
    /// components depending on it.
    dependents: Mutex<HashMap<String, BTreeSet<(String, String)>>>,
}

impl DependencyIndex {
    /// Record the component's declared dependencies, replacing whatever it
    /// declared on earlier passes.
    pub fn update(&self, component: &Component) {
        let id = (
            component.metadata.namespace.clone().unwrap_or_default(),
            component.name_any(),
        );
        let keys = component.dependency_keys();

        let mut dependents = self.dependents.lock().expect("dependency index poisoned");
        dependents.retain(|_, ids| {
            ids.remove(&id);
            !ids.is_empty()
        });
        for key in keys {
            dependents.entry(key).or_default().insert(id.clone());
        }
    }

    /// Drop every trace of the component, called when it is deleted.
    pub fn forget(&self, namespace: &str, name: &str) {
        let id = (namespace.to_string(), name.to_string());
        let mut dependents = self.dependents.lock().expect("dependency index poisoned");
        dependents.retain(|_, ids| {
            ids.remove(&id);
            !ids.is_empty()
        });
    }

    /// Object references of the components depending on the given
    /// `namespace/name` key.
    pub fn dependents_of(&self, key: &str) -> Vec<ObjectRef<Component>> {
        let dependents = self.dependents.lock().expect("dependency index poisoned");
        dependents
            .get(key)
            .map(|ids| {
                ids.iter()
                    .map(|(namespace, name)| ObjectRef::new(name).within(namespace))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Watch mapper: a component that turned ready re-enqueues the components
/// waiting on it; components in any other state trigger nothing.
pub fn dependents_to_requeue(
    index: &DependencyIndex,
    component: &Component,
) -> Vec<ObjectRef<Component>> {
    if !component.is_ready() {
        return Vec::new();
    }
    index.dependents_of(&component.namespaced_name().to_string())
}
