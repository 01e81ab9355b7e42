use std::collections::{HashMap, HashSet};

use common::id::{TaskKey, WorkerId};
use errors::{ErrorKind, Result};
use server::graph::{sorted_workers, Graph};

/// Candidates within this many bytes of the cheapest transfer compete
/// on stack length instead of locality.
pub const TRANSFER_SLACK: u64 = 4096;

/// The stack pushes produced by a bulk assignment, plus the keys that
/// could not be placed at all.
pub struct Assignment {
    pub new_stacks: HashMap<WorkerId, Vec<TaskKey>>,
    pub unplaced: Vec<(TaskKey, String)>,
}

/// Select a worker for one runnable task.
///
/// Restrictions narrow the candidates first; a loose restriction falls
/// back to the general policy when no live worker matches. Among the
/// remaining candidates data locality wins, then the shortest stack,
/// then the lexicographically smallest address.
pub fn decide_worker(graph: &Graph, key: &TaskKey) -> Result<WorkerId> {
    if graph.stacks.is_empty() {
        bail!(ErrorKind::NoWorkers);
    }
    let empty = HashSet::new();
    let deps = graph.dependencies.get(key).unwrap_or(&empty);

    let mut candidates = holders_of(graph, deps);
    if candidates.is_empty() {
        candidates = graph.stacks.keys().cloned().collect();
    }
    if let Some(hosts) = graph.restrictions.get(key) {
        candidates.retain(|w| hosts.contains(&w.ip().to_string()));
        if candidates.is_empty() {
            candidates = graph
                .stacks
                .keys()
                .filter(|w| hosts.contains(&w.ip().to_string()))
                .cloned()
                .collect();
        }
        if candidates.is_empty() {
            if !graph.loose_restrictions.contains(key) {
                bail!(ErrorKind::Placement(key.clone()));
            }
            candidates = holders_of(graph, deps);
            if candidates.is_empty() {
                candidates = graph.stacks.keys().cloned().collect();
            }
        }
    }
    Ok(pick(graph, deps, candidates))
}

/// Live workers already holding some input of the task.
fn holders_of(graph: &Graph, deps: &HashSet<TaskKey>) -> Vec<WorkerId> {
    let mut holders: HashSet<WorkerId> = HashSet::new();
    for dep in deps {
        if let Some(workers) = graph.who_has.get(dep) {
            holders.extend(workers.iter().cloned());
        }
    }
    holders
        .into_iter()
        .filter(|w| graph.stacks.contains_key(w))
        .collect()
}

/// Move small data toward large data, smooth load within the slack.
fn pick(graph: &Graph, deps: &HashSet<TaskKey>, candidates: Vec<WorkerId>) -> WorkerId {
    debug_assert!(!candidates.is_empty());
    let mut scored: Vec<(u64, usize, String, WorkerId)> = candidates
        .into_iter()
        .map(|worker| {
            let transfer: u64 = deps.iter()
                .filter(|dep| {
                    !graph
                        .who_has
                        .get(*dep)
                        .map_or(false, |ws| ws.contains(&worker))
                })
                .map(|dep| graph.nbytes.get(dep).cloned().unwrap_or(0))
                .sum();
            let depth = graph.stacks.get(&worker).map_or(0, |s| s.len());
            (transfer, depth, worker.to_string(), worker)
        })
        .collect();
    let cheapest = scored.iter().map(|entry| entry.0).min().unwrap();
    scored.retain(|entry| entry.0 <= cheapest.saturating_add(TRANSFER_SLACK));
    scored.sort_by(|a, b| (a.1, &a.2).cmp(&(b.1, &b.2)));
    scored[0].3
}

/// Assign a batch of runnable keys. Dependency-free, unrestricted keys
/// are spread over all workers in priority order; the rest go through
/// `decide_worker` one by one against the growing stacks.
pub fn assign_many_tasks(graph: &mut Graph, keys: Vec<TaskKey>) -> Result<Assignment> {
    if graph.stacks.is_empty() {
        bail!(ErrorKind::NoWorkers);
    }
    let mut assignment = Assignment {
        new_stacks: HashMap::new(),
        unplaced: Vec::new(),
    };
    let mut leaves = Vec::new();
    let mut ready = Vec::new();
    for key in keys {
        let runnable = graph
            .waiting
            .get(&key)
            .map_or(false, |pending| pending.is_empty());
        if !runnable {
            continue; // not runnable after all
        }
        graph.waiting.remove(&key);
        let plain = graph
            .dependencies
            .get(&key)
            .map_or(true, |deps| deps.is_empty())
            && !graph.restrictions.contains_key(&key);
        if plain {
            leaves.push(key);
        } else {
            ready.push(key);
        }
    }
    leaves.sort_by_key(|k| (graph.keyorder.get(k).cloned().unwrap_or(0), k.clone()));

    let workers = sorted_workers(graph.stacks.keys().cloned());
    if !leaves.is_empty() {
        let chunk = (leaves.len() + workers.len() - 1) / workers.len();
        for (index, worker) in workers.iter().enumerate() {
            let lo = ::std::cmp::min(index * chunk, leaves.len());
            let hi = ::std::cmp::min(lo + chunk, leaves.len());
            if lo == hi {
                continue;
            }
            // reversed so the most urgent key ends on top of the stack
            let batch: Vec<TaskKey> = leaves[lo..hi].iter().rev().cloned().collect();
            graph
                .stacks
                .get_mut(worker)
                .unwrap()
                .extend(batch.iter().cloned());
            assignment
                .new_stacks
                .entry(*worker)
                .or_insert_with(Vec::new)
                .extend(batch);
        }
    }

    for key in ready {
        match decide_worker(graph, &key) {
            Ok(worker) => {
                graph.stacks.get_mut(&worker).unwrap().push(key.clone());
                assignment
                    .new_stacks
                    .entry(worker)
                    .or_insert_with(Vec::new)
                    .push(key);
            }
            Err(e) => {
                assignment.unplaced.push((key, format!("{}", e)));
            }
        }
    }
    Ok(assignment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use errors::ErrorKind;

    fn addr(text: &str) -> WorkerId {
        text.parse().unwrap()
    }

    fn keys(names: &[&str]) -> HashSet<TaskKey> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn hosts(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn graph_with_workers(addrs: &[WorkerId]) -> Graph {
        let mut graph = Graph::new();
        for a in addrs {
            graph.ncores.insert(*a, 4);
            graph.stacks.insert(*a, Vec::new());
            graph.processing.insert(*a, HashSet::new());
            graph.has_what.insert(*a, HashSet::new());
        }
        graph
    }

    #[test]
    fn decide_worker_prefers_dependency_holders() {
        let alice = addr("10.0.0.1:8000");
        let bob = addr("10.0.0.2:8000");
        let mut graph = graph_with_workers(&[alice, bob]);
        for i in 0..100 {
            let x = format!("x-{}", i);
            let y = format!("y-{}", i);
            let holder = if i % 2 == 0 { alice } else { bob };
            graph.who_has.insert(x.clone(), Some(holder).into_iter().collect());
            graph.nbytes.insert(x.clone(), 0);
            graph.dependencies.insert(y.clone(), keys(&[x.as_str()]));
            graph.dependencies.insert(x, HashSet::new());
        }
        let mut hits = 0;
        for i in 0..100 {
            let y = format!("y-{}", i);
            let worker = decide_worker(&graph, &y).unwrap();
            graph.stacks.get_mut(&worker).unwrap().push(y);
            let holder = if i % 2 == 0 { alice } else { bob };
            if worker == holder {
                hits += 1;
            }
        }
        assert!(hits > 90);
    }

    #[test]
    fn decide_worker_with_restrictions() {
        let alice = addr("10.0.0.1:8000");
        let bob = addr("10.0.0.2:8000");
        let charlie = addr("10.0.0.3:8000");
        let mut graph = graph_with_workers(&[alice, bob, charlie]);
        graph.dependencies.insert("x".to_string(), HashSet::new());
        graph
            .restrictions
            .insert("x".to_string(), hosts(&["10.0.0.1", "10.0.0.3"]));

        let result = decide_worker(&graph, &"x".to_string()).unwrap();
        assert!(result == alice || result == charlie);

        graph.stacks.insert(alice, vec!["t1".into(), "t2".into(), "t3".into()]);
        graph.stacks.insert(charlie, vec!["t4".into(), "t5".into(), "t6".into()]);
        let result = decide_worker(&graph, &"x".to_string()).unwrap();
        assert!(result == alice || result == charlie);

        // a dependency held only by an excluded worker changes nothing
        graph.dependencies.insert("x".to_string(), keys(&["y"]));
        graph
            .who_has
            .insert("y".to_string(), Some(bob).into_iter().collect());
        graph.nbytes.insert("y".to_string(), 0);
        let result = decide_worker(&graph, &"x".to_string()).unwrap();
        assert!(result == alice || result == charlie);
    }

    #[test]
    fn decide_worker_with_loose_restrictions() {
        let alice = addr("10.0.0.1:8000");
        let bob = addr("10.0.0.2:8000");
        let charlie = addr("10.0.0.3:8000");
        let mut graph = graph_with_workers(&[alice, bob, charlie]);
        graph.stacks.insert(alice, vec!["t1".into(), "t2".into(), "t3".into()]);
        graph.stacks.insert(charlie, vec!["t4".into()]);
        graph.dependencies.insert("x".to_string(), HashSet::new());
        graph
            .restrictions
            .insert("x".to_string(), hosts(&["10.0.0.1", "10.0.0.3"]));

        assert_eq!(decide_worker(&graph, &"x".to_string()).unwrap(), charlie);

        graph.loose_restrictions.insert("x".to_string());
        assert_eq!(decide_worker(&graph, &"x".to_string()).unwrap(), charlie);

        // no live worker matches: strict fails, loose falls back
        graph
            .restrictions
            .insert("x".to_string(), hosts(&["10.0.0.4", "10.0.0.5"]));
        graph.loose_restrictions.remove(&"x".to_string());
        match decide_worker(&graph, &"x".to_string()) {
            Err(::errors::Error(ErrorKind::Placement(ref key), _)) => assert_eq!(key, "x"),
            other => panic!("expected placement error, got {:?}", other.map(|w| w.to_string())),
        }
        graph.loose_restrictions.insert("x".to_string());
        assert_eq!(decide_worker(&graph, &"x".to_string()).unwrap(), bob);
    }

    #[test]
    fn decide_worker_without_workers() {
        let graph = Graph::new();
        match decide_worker(&graph, &"x".to_string()) {
            Err(::errors::Error(ErrorKind::NoWorkers, _)) => {}
            other => panic!("expected no-workers error, got {:?}", other.map(|w| w.to_string())),
        }
    }

    #[test]
    fn decide_worker_is_deterministic() {
        let alice = addr("10.0.0.1:8000");
        let bob = addr("10.0.0.2:8000");
        let mut graph = graph_with_workers(&[alice, bob]);
        graph.dependencies.insert("x".to_string(), HashSet::new());
        let first = decide_worker(&graph, &"x".to_string()).unwrap();
        for _ in 0..20 {
            assert_eq!(decide_worker(&graph, &"x".to_string()).unwrap(), first);
        }
        // equal stacks tie-break on address order
        assert_eq!(first, alice);
    }

    #[test]
    fn assign_many_tasks_spreads_and_follows_data() {
        let alice = addr("10.0.0.1:8000");
        let bob = addr("10.0.0.2:8000");
        let mut graph = graph_with_workers(&[alice, bob]);
        graph.dependencies.insert("y".to_string(), keys(&["x"]));
        graph.dependencies.insert("b".to_string(), keys(&["a"]));
        graph.dependencies.insert("x".to_string(), HashSet::new());
        graph.dependencies.insert("a".to_string(), HashSet::new());
        graph.waiting.insert("y".to_string(), HashSet::new());
        graph.waiting.insert("a".to_string(), HashSet::new());
        graph.waiting.insert("b".to_string(), keys(&["a"]));
        graph
            .who_has
            .insert("x".to_string(), Some(alice).into_iter().collect());
        graph.nbytes.insert("x".to_string(), 100);

        let assignment =
            assign_many_tasks(&mut graph, vec!["y".to_string(), "a".to_string()]).unwrap();

        assert!(graph.stacks[&alice].contains(&"y".to_string()));
        let everywhere: Vec<TaskKey> = graph.stacks[&alice]
            .iter()
            .chain(graph.stacks[&bob].iter())
            .cloned()
            .collect();
        assert!(everywhere.contains(&"a".to_string()));
        assert!(!graph.waiting.contains_key("a"));
        assert!(!graph.waiting.contains_key("y"));
        // b was not runnable and stays waiting
        assert!(graph.waiting.contains_key("b"));

        let assigned: usize = assignment.new_stacks.values().map(|v| v.len()).sum();
        assert_eq!(assigned, 2);
        assert!(assignment.unplaced.is_empty());
    }

    #[test]
    fn assign_many_tasks_with_restrictions() {
        let alice = addr("10.0.0.1:8000");
        let bob = addr("10.0.0.2:8000");
        let mut graph = graph_with_workers(&[alice, bob]);
        graph.dependencies.insert("y".to_string(), keys(&["x"]));
        graph.dependencies.insert("a".to_string(), HashSet::new());
        graph.waiting.insert("y".to_string(), HashSet::new());
        graph.waiting.insert("a".to_string(), HashSet::new());
        graph
            .who_has
            .insert("x".to_string(), Some(alice).into_iter().collect());
        graph.nbytes.insert("x".to_string(), 0);
        graph
            .restrictions
            .insert("y".to_string(), hosts(&["10.0.0.2"]));
        graph
            .restrictions
            .insert("a".to_string(), hosts(&["10.0.0.1"]));

        assign_many_tasks(&mut graph, vec!["y".to_string(), "a".to_string()]).unwrap();

        assert!(graph.stacks[&bob].contains(&"y".to_string()));
        assert!(graph.stacks[&alice].contains(&"a".to_string()));
        assert!(!graph.waiting.contains_key("a"));
        assert!(!graph.waiting.contains_key("y"));
    }
}
