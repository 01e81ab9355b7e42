use serde_json::{Map, Value};

use server::graph::{sorted, sorted_workers, Graph};

/// Views an observer may subscribe to over the feed protocol.
pub const KNOWN_VIEWS: &[&str] = &[
    "summary",
    "processing",
    "stacks",
    "who-has",
    "ncores",
    "tasks",
];

/// Render one named view of the live scheduler state.
pub fn render(graph: &Graph, name: &str) -> Option<Value> {
    match name {
        "summary" => Some(json!({
            "tasks": graph.tasks.len(),
            "waiting": graph.waiting.len(),
            "in-memory": graph.who_has.len(),
            "processing": graph.processing.values().map(|p| p.len()).sum::<usize>(),
            "workers": graph.ncores.len(),
            "clients": graph.wants_what.len(),
        })),
        "processing" => {
            let mut view = Map::new();
            for worker in sorted_workers(graph.processing.keys().cloned()) {
                let keys = sorted(graph.processing[&worker].iter().cloned());
                view.insert(worker.to_string(), json!(keys));
            }
            Some(Value::Object(view))
        }
        "stacks" => {
            let mut view = Map::new();
            for worker in sorted_workers(graph.stacks.keys().cloned()) {
                view.insert(worker.to_string(), json!(graph.stacks[&worker]));
            }
            Some(Value::Object(view))
        }
        "who-has" => {
            let mut view = Map::new();
            for key in sorted(graph.who_has.keys().cloned()) {
                let workers: Vec<String> = sorted_workers(graph.who_has[&key].iter().cloned())
                    .into_iter()
                    .map(|w| w.to_string())
                    .collect();
                view.insert(key, json!(workers));
            }
            Some(Value::Object(view))
        }
        "ncores" => {
            let mut view = Map::new();
            for worker in sorted_workers(graph.ncores.keys().cloned()) {
                view.insert(worker.to_string(), json!(graph.ncores[&worker]));
            }
            Some(Value::Object(view))
        }
        "tasks" => Some(json!(sorted(graph.tasks.keys().cloned()))),
        _ => None,
    }
}
