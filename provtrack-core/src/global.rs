//! Process-wide tracker.
//!
//! Interceptors built with [`Interceptor::global`](crate::intercept::Interceptor::global)
//! resolve the tracker here on every call, so a tracker installed after the
//! interceptor was created is still picked up. Nothing is installed
//! implicitly.

use std::sync::{Arc, RwLock};

use crate::config::RunConfig;
use crate::tracker::{SessionHandle, Tracker};

static GLOBAL: RwLock<Option<Arc<Tracker>>> = RwLock::new(None);

/// Install `tracker` as the process-wide tracker, returning the previous one.
pub fn install(tracker: Arc<Tracker>) -> Option<Arc<Tracker>> {
    let mut slot = GLOBAL.write().unwrap_or_else(|e| e.into_inner());
    slot.replace(tracker)
}

/// The installed tracker, if any.
pub fn tracker() -> Option<Arc<Tracker>> {
    GLOBAL.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Remove the installed tracker. Its run is left as is; stop it first if
/// it should be committed.
pub fn uninstall() -> Option<Arc<Tracker>> {
    GLOBAL.write().unwrap_or_else(|e| e.into_inner()).take()
}

/// Start the installed tracker, installing a new one built from `config`
/// when none is present.
pub fn start(config: RunConfig) -> (Arc<Tracker>, SessionHandle) {
    let tracker = {
        let mut slot = GLOBAL.write().unwrap_or_else(|e| e.into_inner());
        slot.get_or_insert_with(|| Arc::new(Tracker::new(config)))
            .clone()
    };
    let handle = tracker.start();
    (tracker, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{NodeId, Params, TransformEdge};
    use crate::intercept::{Interceptor, OperationVocabulary, Traced};
    use crate::run::RunStatus;

    fn extend(data: &Traced<Vec<i64>>) -> Option<NodeId> {
        let out = data
            .derive("extend", Params::new(), |v| {
                Ok::<_, String>(v.iter().copied().chain([0]).collect::<Vec<_>>())
            })
            .unwrap();
        out.last_node().map(|n| n.node)
    }

    // One test owns the global slot; parallel tests must not touch it.
    #[test]
    fn test_global_lifecycle() {
        uninstall();
        assert!(tracker().is_none());

        // Resolved per call: nothing installed yet, so events are dropped.
        let interceptor = Interceptor::global(OperationVocabulary::new(["load", "extend"]));
        let data = interceptor
            .source("load", Params::new(), || Ok::<_, String>(vec![1, 2]))
            .unwrap();
        assert!(data.last_node().is_none());
        assert_eq!(extend(&data), None);

        let (first, handle) = start(RunConfig::new("demo", "global"));
        let loaded = interceptor
            .source("load", Params::new(), || Ok::<_, String>(vec![3]))
            .unwrap();
        assert_eq!(loaded.last_node().unwrap().session_id, handle.session_id);
        assert_eq!(extend(&loaded), Some(NodeId(2)));
        let snap = first.snapshot().unwrap();
        assert_eq!(snap.nodes.len(), 2);
        assert_eq!(snap.edges, vec![TransformEdge::new(NodeId(1), NodeId(2))]);

        assert_eq!(first.session().unwrap(), handle);
        let (again, same) = start(RunConfig::new("ignored", "ignored"));
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(handle, same);
        assert_eq!(again.run_config().project_name, "demo");

        let replacement = Arc::new(Tracker::new(RunConfig::default()));
        let previous = install(replacement.clone()).unwrap();
        assert!(Arc::ptr_eq(&previous, &first));
        assert!(Arc::ptr_eq(&tracker().unwrap(), &replacement));

        // The replacement is not started; events are dropped again.
        assert_eq!(extend(&loaded), None);

        first.stop(RunStatus::Finished).unwrap();
        assert_eq!(first.last_run().unwrap().status, RunStatus::Finished);
        assert!(uninstall().is_some());
        assert!(tracker().is_none());
        assert_eq!(extend(&loaded), None);
    }
}
