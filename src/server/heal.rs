use std::collections::{HashMap, HashSet};

use common::id::{ClientId, TaskKey, WorkerId};
use common::protocol::Response;
use server::graph::{sorted, Graph, Outcome};

/// A fresh plan reconstructed from the authoritative inputs.
#[derive(Debug, PartialEq)]
pub struct HealResult {
    pub waiting: HashMap<TaskKey, HashSet<TaskKey>>,
    pub waiting_data: HashMap<TaskKey, HashSet<TaskKey>>,
    pub stacks: HashMap<WorkerId, Vec<TaskKey>>,
    pub processing: HashMap<WorkerId, HashSet<TaskKey>>,
    pub released: HashSet<TaskKey>,
    pub finished_results: HashSet<TaskKey>,
    pub in_play: HashSet<TaskKey>,
}

/// Reconstruct a consistent plan from worker-reported truth.
///
/// `who_has`, `stacks` and `processing` are authoritative; the waiting
/// sets are rebuilt from scratch. Desired keys are the sinks of the
/// dependency graph plus `desired`. The function is pure and idempotent,
/// so a failure during recovery can simply retry it.
pub fn heal(
    dependencies: &HashMap<TaskKey, HashSet<TaskKey>>,
    dependents: &HashMap<TaskKey, HashSet<TaskKey>>,
    who_has: &HashMap<TaskKey, HashSet<WorkerId>>,
    stacks: &HashMap<WorkerId, Vec<TaskKey>>,
    processing: &HashMap<WorkerId, HashSet<TaskKey>>,
    desired: &HashSet<TaskKey>,
) -> HealResult {
    let mut outputs: HashSet<TaskKey> = dependents
        .iter()
        .filter(|&(_, consumers)| consumers.is_empty())
        .map(|(key, _)| key.clone())
        .collect();
    outputs.extend(
        desired
            .iter()
            .filter(|key| dependents.contains_key(*key))
            .cloned(),
    );

    // everything a desired key transitively needs, trimmed below data
    // that is already in memory
    let mut accessible: HashSet<TaskKey> = HashSet::new();
    let mut stack: Vec<TaskKey> = outputs.iter().cloned().collect();
    while let Some(key) = stack.pop() {
        if !accessible.insert(key.clone()) {
            continue;
        }
        if who_has.contains_key(&key) {
            continue;
        }
        if let Some(deps) = dependencies.get(&key) {
            stack.extend(deps.iter().cloned());
        }
    }

    let released: HashSet<TaskKey> = dependents
        .keys()
        .filter(|key| !accessible.contains(*key) && !who_has.contains_key(*key))
        .cloned()
        .collect();

    // keep a worker placement only while it is still valid: the key is
    // needed, not yet in memory, has all inputs in memory, and appears
    // in exactly one place
    let mut new_stacks: HashMap<WorkerId, Vec<TaskKey>> =
        stacks.keys().map(|w| (*w, Vec::new())).collect();
    let mut new_processing: HashMap<WorkerId, HashSet<TaskKey>> =
        processing.keys().map(|w| (*w, HashSet::new())).collect();
    let mut placed: HashSet<TaskKey> = HashSet::new();
    {
        let satisfied = |key: &TaskKey| {
            dependencies
                .get(key)
                .map_or(true, |deps| deps.iter().all(|d| who_has.contains_key(d)))
        };
        let keep = |key: &TaskKey, placed: &HashSet<TaskKey>| {
            accessible.contains(key) && !who_has.contains_key(key) && !placed.contains(key)
                && satisfied(key)
        };
        let mut workers: Vec<WorkerId> = processing.keys().cloned().collect();
        workers.sort_by_key(|w| w.to_string());
        for worker in &workers {
            for key in sorted(processing[worker].iter().cloned()) {
                if keep(&key, &placed) {
                    placed.insert(key.clone());
                    new_processing.get_mut(worker).unwrap().insert(key);
                }
            }
        }
        let mut workers: Vec<WorkerId> = stacks.keys().cloned().collect();
        workers.sort_by_key(|w| w.to_string());
        for worker in &workers {
            for key in stacks[worker].iter() {
                if keep(key, &placed) {
                    placed.insert(key.clone());
                    new_stacks.get_mut(worker).unwrap().push(key.clone());
                }
            }
        }
    }

    // everything needed, not in memory and not placed must wait
    let mut waiting: HashMap<TaskKey, HashSet<TaskKey>> = HashMap::new();
    for key in &accessible {
        if who_has.contains_key(key) || placed.contains(key) {
            continue;
        }
        let pending: HashSet<TaskKey> = dependencies
            .get(key)
            .map(|deps| {
                deps.iter()
                    .filter(|d| !who_has.contains_key(*d))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        waiting.insert(key.clone(), pending);
    }

    let mut waiting_data: HashMap<TaskKey, HashSet<TaskKey>> = HashMap::new();
    for key in &accessible {
        let consumers: HashSet<TaskKey> = dependents
            .get(key)
            .map(|cs| {
                cs.iter()
                    .filter(|c| accessible.contains(*c) && !who_has.contains_key(*c))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        waiting_data.insert(key.clone(), consumers);
    }

    let finished_results: HashSet<TaskKey> = outputs
        .iter()
        .filter(|key| who_has.contains_key(*key))
        .cloned()
        .collect();

    let mut in_play: HashSet<TaskKey> = accessible;
    in_play.extend(who_has.keys().cloned());

    HealResult {
        waiting: waiting,
        waiting_data: waiting_data,
        stacks: new_stacks,
        processing: new_processing,
        released: released,
        finished_results: finished_results,
        in_play: in_play,
    }
}

impl Graph {
    /// Recompute the whole plan from the authoritative indexes and
    /// replace the derived ones.
    pub fn run_heal(&mut self) -> Outcome {
        debug!("Healing scheduler state");
        let desired: HashSet<TaskKey> = self.who_wants.keys().cloned().collect();
        let result = heal(
            &self.dependencies,
            &self.dependents,
            &self.who_has,
            &self.stacks,
            &self.processing,
            &desired,
        );
        self.waiting = result.waiting;
        self.waiting_data = result.waiting_data;
        self.stacks = result.stacks;
        self.processing = result.processing;
        self.released = result.released;
        self.finished_results = result.finished_results;
        self.in_play = result.in_play;
        Outcome::default()
    }

    /// Narrow reconciliation when specific keys are reported gone: the
    /// lost keys and all still-required producers go back to waiting and
    /// interested clients learn about the loss.
    pub fn heal_missing_data(&mut self, lost: &[TaskKey]) -> Outcome {
        info!("Healing missing data: {:?}", lost);
        let mut out = Outcome::default();
        let mut per_client: HashMap<ClientId, Vec<TaskKey>> = HashMap::new();
        for key in lost {
            if let Some(workers) = self.who_has.remove(key) {
                for worker in workers {
                    if let Some(held) = self.has_what.get_mut(&worker) {
                        held.remove(key);
                    }
                }
            }
            self.in_play.remove(key);
            self.finished_results.remove(key);
            if let Some(clients) = self.who_wants.get(key) {
                for client in clients {
                    per_client
                        .entry(client.clone())
                        .or_insert_with(Vec::new)
                        .push(key.clone());
                }
            }
        }
        for client in sorted(per_client.keys().cloned()) {
            let keys = per_client.remove(&client).unwrap();
            out.reports.push((client, Response::LostData { keys: keys }));
        }
        for key in lost {
            if self.tasks.contains_key(key) {
                self.restore_key(key);
            } else if !self.who_has.contains_key(key) {
                warn!("Lost key {} has no task to recompute it", key);
            }
        }
        match self.queue_ready() {
            Ok(more) => out.merge(more),
            Err(e) => error!("Re-queue after healing missing data failed: {}", e),
        }
        out
    }

    /// Put a key and its unresolved producers back into waiting.
    fn restore_key(&mut self, key: &TaskKey) {
        if self.in_play.contains(key) || self.who_has.contains_key(key) {
            return;
        }
        let deps: Vec<TaskKey> = self.dependencies
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for dep in sorted(deps.clone()) {
            if self.tasks.contains_key(&dep) || self.who_has.contains_key(&dep) {
                self.restore_key(&dep);
            } else {
                warn!("Producer {} of {} is not recomputable", dep, key);
            }
            self.waiting_data
                .entry(dep.clone())
                .or_insert_with(HashSet::new)
                .insert(key.clone());
        }
        let pending: HashSet<TaskKey> = deps.iter()
            .filter(|d| !self.who_has.contains_key(*d))
            .cloned()
            .collect();
        self.waiting.insert(key.clone(), pending);
        self.released.remove(key);
        self.in_play.insert(key.clone());
    }
}
