use std::collections::{HashMap, HashSet};

use serde_json;

use common::id::{ClientId, TaskKey, WorkerId};
use common::protocol::{ArgList, Blob, Response, TaskSpec};
use errors::{Error, ErrorKind, Result};

/// Side effects a handler wants performed once its state mutation is
/// committed: reports routed to clients, operations pushed to workers,
/// and data deletions to batch for the next tick.
#[derive(Default, Debug)]
pub struct Outcome {
    pub reports: Vec<(ClientId, Response)>,
    pub worker_msgs: Vec<(WorkerId, Response)>,
    pub deletions: Vec<(WorkerId, TaskKey)>,
}

impl Outcome {
    pub fn merge(&mut self, other: Outcome) {
        self.reports.extend(other.reports);
        self.worker_msgs.extend(other.worker_msgs);
        self.deletions.extend(other.deletions);
    }
}

/// The whole scheduler state: a cross-consistent set of indexes over
/// tasks, data locations, workers and clients. All handlers mutate it
/// from the reactor thread and leave it consistent between suspension
/// points.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    /// All known, not yet forgotten tasks.
    pub tasks: HashMap<TaskKey, TaskSpec>,
    /// Direct inputs of each task.
    pub dependencies: HashMap<TaskKey, HashSet<TaskKey>>,
    /// Inverse of `dependencies`.
    pub dependents: HashMap<TaskKey, HashSet<TaskKey>>,
    /// Unresolved inputs; present iff the task is neither runnable,
    /// running, nor in memory.
    pub waiting: HashMap<TaskKey, HashSet<TaskKey>>,
    /// Pending consumers; data may be freed only when empty and no
    /// client wants the key.
    pub waiting_data: HashMap<TaskKey, HashSet<TaskKey>>,
    /// Canonical data locations.
    pub who_has: HashMap<TaskKey, HashSet<WorkerId>>,
    /// Inverse of `who_has`.
    pub has_what: HashMap<WorkerId, HashSet<TaskKey>>,
    /// Ready but unsent tasks per worker, newest on top.
    pub stacks: HashMap<WorkerId, Vec<TaskKey>>,
    /// Dispatched and not yet completed tasks per worker.
    pub processing: HashMap<WorkerId, HashSet<TaskKey>>,
    /// Worker capacities.
    pub ncores: HashMap<WorkerId, u32>,
    /// Every key currently anywhere in the pipeline.
    pub in_play: HashSet<TaskKey>,
    /// Known keys whose data is neither present nor needed.
    pub released: HashSet<TaskKey>,
    /// Client-desired keys that have completed.
    pub finished_results: HashSet<TaskKey>,
    /// Hard placement constraints, as host names.
    pub restrictions: HashMap<TaskKey, HashSet<String>>,
    /// Restricted keys allowed to fall back anywhere.
    pub loose_restrictions: HashSet<TaskKey>,
    /// Clients holding interest in a key.
    pub who_wants: HashMap<TaskKey, HashSet<ClientId>>,
    /// Inverse of `who_wants`.
    pub wants_what: HashMap<ClientId, HashSet<TaskKey>>,
    /// Reported in-memory sizes, used for locality scoring.
    pub nbytes: HashMap<TaskKey, u64>,
    /// Topological priority hints.
    pub keyorder: HashMap<TaskKey, i64>,
    pub exceptions: HashMap<TaskKey, Blob>,
    pub tracebacks: HashMap<TaskKey, Blob>,
    /// The original failing ancestor of every erred key.
    pub exceptions_blame: HashMap<TaskKey, TaskKey>,

    /// Admission sequence for keys without a client-provided priority.
    pub(crate) order_counter: i64,
}

/// Equality covers the observable indexes; the admission counter is a
/// bookkeeping detail.
impl PartialEq for Graph {
    fn eq(&self, other: &Graph) -> bool {
        self.tasks == other.tasks && self.dependencies == other.dependencies
            && self.dependents == other.dependents && self.waiting == other.waiting
            && self.waiting_data == other.waiting_data && self.who_has == other.who_has
            && self.has_what == other.has_what && self.stacks == other.stacks
            && self.processing == other.processing && self.ncores == other.ncores
            && self.in_play == other.in_play && self.released == other.released
            && self.finished_results == other.finished_results
            && self.restrictions == other.restrictions
            && self.loose_restrictions == other.loose_restrictions
            && self.who_wants == other.who_wants && self.wants_what == other.wants_what
            && self.nbytes == other.nbytes && self.keyorder == other.keyorder
            && self.exceptions == other.exceptions && self.tracebacks == other.tracebacks
            && self.exceptions_blame == other.exceptions_blame
    }
}

fn text_blob(message: &str) -> Blob {
    Blob::from(serde_json::to_vec(&message).unwrap_or_else(|_| b"null".to_vec()))
}

pub fn sorted<T: Ord, I: IntoIterator<Item = T>>(items: I) -> Vec<T> {
    let mut v: Vec<T> = items.into_iter().collect();
    v.sort();
    v
}

/// Workers sorted by their rendered address, for deterministic choices.
pub fn sorted_workers<I: IntoIterator<Item = WorkerId>>(items: I) -> Vec<WorkerId> {
    let mut v: Vec<WorkerId> = items.into_iter().collect();
    v.sort_by_key(|w| w.to_string());
    v
}

impl Graph {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn wanted(&self, key: &TaskKey) -> bool {
        self.who_wants.get(key).map_or(false, |s| !s.is_empty())
    }

    pub fn next_order(&mut self) -> i64 {
        self.order_counter += 1;
        self.order_counter
    }

    /// Register a worker together with the keys already in its store.
    pub fn add_worker(
        &mut self,
        address: WorkerId,
        ncores: u32,
        keys: Vec<TaskKey>,
    ) -> Result<Outcome> {
        if self.ncores.contains_key(&address) {
            bail!(ErrorKind::Protocol(format!(
                "worker {} already registered",
                address
            )));
        }
        info!("New worker {} with {} cores", address, ncores);
        self.ncores.insert(address, ncores);
        self.stacks.insert(address, Vec::new());
        self.processing.insert(address, HashSet::new());
        self.has_what.insert(address, HashSet::new());
        let mut out = Outcome::default();
        for key in keys {
            self.mark_key_in_memory(&key, &[address], None, &mut out);
        }
        out.merge(self.queue_ready()?);
        Ok(out)
    }

    /// Record interest of a client in a key.
    pub fn client_wants(&mut self, client: &ClientId, key: &TaskKey) {
        self.who_wants
            .entry(key.clone())
            .or_insert_with(HashSet::new)
            .insert(client.clone());
        self.wants_what
            .entry(client.clone())
            .or_insert_with(HashSet::new)
            .insert(key.clone());
        if self.who_has.contains_key(key) {
            self.finished_results.insert(key.clone());
        }
    }

    /// Register out-of-band data locations, as reported by a client that
    /// ingested data directly onto workers.
    pub fn update_data(
        &mut self,
        who_has: HashMap<TaskKey, HashSet<WorkerId>>,
        nbytes: HashMap<TaskKey, u64>,
        client: Option<ClientId>,
    ) -> Outcome {
        debug!("Updating data locations for {} keys", who_has.len());
        let mut out = Outcome::default();
        let keys = sorted(who_has.keys().cloned());
        for key in &keys {
            let workers = sorted_workers(who_has[key].iter().cloned());
            let size = nbytes.get(key).cloned();
            self.mark_key_in_memory(key, &workers, size, &mut out);
        }
        if let Some(client) = client {
            for key in &keys {
                self.client_wants(&client, key);
            }
        }
        out
    }

    /// A worker completed a task and holds its result.
    pub fn mark_task_finished(
        &mut self,
        worker: &WorkerId,
        key: &TaskKey,
        nbytes: u64,
    ) -> Outcome {
        let mut out = Outcome::default();
        if let Some(p) = self.processing.get_mut(worker) {
            p.remove(key);
        }
        if !self.tasks.contains_key(key) && !self.wanted(key) {
            // completed after being forgotten; drop the data right away
            debug!("Task {} finished after release, deleting result", key);
            out.deletions.push((*worker, key.clone()));
            out.merge(self.ensure_occupied(worker));
            return out;
        }
        self.mark_key_in_memory(key, &[*worker], Some(nbytes), &mut out);
        out.merge(self.ensure_occupied(worker));
        out
    }

    /// Record a key as present on the given workers, unblock dependents
    /// and notify interested clients.
    pub fn mark_key_in_memory(
        &mut self,
        key: &TaskKey,
        workers: &[WorkerId],
        nbytes: Option<u64>,
        out: &mut Outcome,
    ) {
        debug!("Key {} in memory on {:?}", key, workers);
        for worker in workers {
            self.who_has
                .entry(key.clone())
                .or_insert_with(HashSet::new)
                .insert(*worker);
            self.has_what
                .entry(*worker)
                .or_insert_with(HashSet::new)
                .insert(key.clone());
            if let Some(p) = self.processing.get_mut(worker) {
                p.remove(key);
            }
        }
        if let Some(size) = nbytes {
            self.nbytes.insert(key.clone(), size);
        }
        self.waiting.remove(key);
        self.released.remove(key);
        self.in_play.insert(key.clone());

        // unblock dependents, most urgent first
        let mut dependents: Vec<TaskKey> = self.dependents
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        dependents.sort_by_key(|k| (-self.keyorder.get(k).cloned().unwrap_or(0), k.clone()));
        let mut ready = Vec::new();
        for dep in dependents {
            if let Some(pending) = self.waiting.get_mut(&dep) {
                pending.remove(key);
                if pending.is_empty() {
                    ready.push(dep);
                }
            }
        }
        for dep in ready {
            self.waiting.remove(&dep);
            self.mark_ready_to_run(dep, out);
        }

        // our inputs lose a pending consumer, maybe freeing their data
        let deps: Vec<TaskKey> = self.dependencies
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for dep in sorted(deps) {
            let drained = match self.waiting_data.get_mut(&dep) {
                Some(consumers) => {
                    consumers.remove(key);
                    consumers.is_empty()
                }
                None => false,
            };
            if drained && !self.wanted(&dep) && self.who_has.contains_key(&dep) {
                self.delete_data_one(&dep, out);
            }
        }

        if self.wanted(key) {
            self.finished_results.insert(key.clone());
        }
        if let Some(clients) = self.who_wants.get(key) {
            for client in sorted(clients.iter().cloned()) {
                out.reports.push((
                    client,
                    Response::KeyInMemory {
                        key: key.clone(),
                        nbytes: nbytes,
                    },
                ));
            }
        }
    }

    /// Place one runnable task on a worker stack, or park it when no
    /// worker is available yet.
    fn mark_ready_to_run(&mut self, key: TaskKey, out: &mut Outcome) {
        if self.exceptions_blame.contains_key(&key) {
            return;
        }
        match ::server::schedule::decide_worker(self, &key) {
            Ok(worker) => {
                self.stacks
                    .entry(worker)
                    .or_insert_with(Vec::new)
                    .push(key);
                out.merge(self.ensure_occupied(&worker));
            }
            Err(Error(ErrorKind::NoWorkers, _)) => {
                // parked as ready until a worker registers
                self.waiting.insert(key, HashSet::new());
            }
            Err(e) => {
                warn!("Task {} cannot be placed: {}", key, e);
                self.record_failure(&key, &format!("{}", e), out);
            }
        }
    }

    /// Drain a worker's stack into `processing` up to its core count,
    /// emitting one compute message per dispatched task.
    pub fn ensure_occupied(&mut self, address: &WorkerId) -> Outcome {
        let mut out = Outcome::default();
        loop {
            let capacity = self.ncores.get(address).cloned().unwrap_or(0) as usize;
            let busy = self.processing.get(address).map_or(0, |p| p.len());
            if busy >= capacity {
                break;
            }
            let key = match self.stacks.get_mut(address).and_then(|s| s.pop()) {
                Some(key) => key,
                None => break,
            };
            // stale entries may have completed or been forgotten meanwhile
            if self.who_has.contains_key(&key) || !self.tasks.contains_key(&key) {
                continue;
            }
            match self.compute_msg(&key) {
                Ok(msg) => {
                    debug!("Dispatching task {} to worker {}", key, address);
                    self.processing
                        .entry(*address)
                        .or_insert_with(HashSet::new)
                        .insert(key.clone());
                    out.worker_msgs.push((*address, msg));
                }
                Err(e) => {
                    warn!("Cannot dispatch task {}: {}", key, e);
                    self.record_failure(&key, &format!("cannot dispatch: {}", e), &mut out);
                }
            }
        }
        out
    }

    fn compute_msg(&self, key: &TaskKey) -> Result<Response> {
        let spec = self.tasks.get(key).ok_or_else(|| {
            Error::from(ErrorKind::InconsistentState(format!(
                "no spec for task {}",
                key
            )))
        })?;
        let deps: Vec<TaskKey> = self.dependencies
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        let mut who_has = HashMap::new();
        for dep in deps {
            let workers = sorted_workers(
                self.who_has
                    .get(&dep)
                    .map(|s| s.iter().cloned().collect())
                    .unwrap_or_else(Vec::new),
            );
            who_has.insert(dep, workers);
        }
        match *spec {
            TaskSpec::Alias(ref target) => Ok(Response::ComputeTask {
                key: key.clone(),
                function: Blob::from(b"identity".to_vec()),
                args: ArgList::Each(vec![Blob::from(serde_json::to_vec(target)?)]),
                kwargs: None,
                who_has: who_has,
            }),
            TaskSpec::Run(ref run) => Ok(Response::ComputeTask {
                key: key.clone(),
                function: run.function.clone(),
                args: run.args.clone(),
                kwargs: run.kwargs.clone(),
                who_has: who_has,
            }),
        }
    }

    /// Assign every parked ready task and fill worker pipelines.
    pub fn queue_ready(&mut self) -> Result<Outcome> {
        let mut out = Outcome::default();
        if self.ncores.is_empty() {
            return Ok(out);
        }
        let ready: Vec<TaskKey> = sorted(
            self.waiting
                .iter()
                .filter(|&(key, pending)| {
                    pending.is_empty() && !self.exceptions_blame.contains_key(key)
                })
                .map(|(key, _)| key.clone()),
        );
        if ready.is_empty() {
            return Ok(out);
        }
        let assignment = ::server::schedule::assign_many_tasks(self, ready)?;
        for (key, reason) in assignment.unplaced {
            self.record_failure(&key, &reason, &mut out);
        }
        for worker in sorted_workers(assignment.new_stacks.keys().cloned()) {
            out.merge(self.ensure_occupied(&worker));
        }
        Ok(out)
    }

    /// A worker reported a task failure.
    pub fn mark_task_erred(
        &mut self,
        worker: &WorkerId,
        key: &TaskKey,
        exception: Blob,
        traceback: Blob,
    ) -> Outcome {
        let mut out = Outcome::default();
        let was_processing = self.processing
            .get_mut(worker)
            .map_or(false, |p| p.remove(key));
        if !was_processing {
            debug!("Ignoring stale error report for {} from {}", key, worker);
            return out;
        }
        debug!("Task {} erred on worker {}", key, worker);
        self.exceptions.insert(key.clone(), exception);
        self.tracebacks.insert(key.clone(), traceback);
        let failing = key.clone();
        self.mark_failed(key, &failing, &mut out);
        out.merge(self.ensure_occupied(worker));
        out
    }

    /// Record a scheduler-side failure (placement, undispatchable task)
    /// and propagate blame as if the task itself had erred.
    fn record_failure(&mut self, key: &TaskKey, message: &str, out: &mut Outcome) {
        self.exceptions.insert(key.clone(), text_blob(message));
        self.tracebacks.insert(key.clone(), text_blob(message));
        let failing = key.clone();
        self.mark_failed(key, &failing, out);
    }

    /// Mark a key and its whole dependent frontier as failed, blaming
    /// the original failing ancestor.
    fn mark_failed(&mut self, key: &TaskKey, failing_key: &TaskKey, out: &mut Outcome) {
        if self.exceptions_blame.contains_key(key) {
            return;
        }
        self.exceptions_blame
            .insert(key.clone(), failing_key.clone());
        let exception = self.exceptions
            .get(failing_key)
            .cloned()
            .unwrap_or_else(|| text_blob("unknown error"));
        let traceback = self.tracebacks
            .get(failing_key)
            .cloned()
            .unwrap_or_else(|| text_blob("unknown error"));
        if let Some(clients) = self.who_wants.get(key) {
            for client in sorted(clients.iter().cloned()) {
                out.reports.push((
                    client,
                    Response::TaskErred {
                        key: key.clone(),
                        exception: exception.clone(),
                        traceback: traceback.clone(),
                    },
                ));
            }
        }
        self.waiting.remove(key);
        self.waiting_data.remove(key);
        self.in_play.remove(key);
        for stack in self.stacks.values_mut() {
            stack.retain(|k| k != key);
        }
        let dependents: Vec<TaskKey> = self.dependents
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for dep in sorted(dependents) {
            self.mark_failed(&dep, failing_key, out);
        }
    }

    /// Drop the data of one key everywhere and move it to `released`.
    pub fn delete_data_one(&mut self, key: &TaskKey, out: &mut Outcome) {
        if let Some(workers) = self.who_has.remove(key) {
            for worker in sorted_workers(workers) {
                if let Some(held) = self.has_what.get_mut(&worker) {
                    held.remove(key);
                }
                out.deletions.push((worker, key.clone()));
            }
        }
        self.waiting_data.remove(key);
        self.nbytes.remove(key);
        self.finished_results.remove(key);
        self.in_play.remove(key);
        self.released.insert(key.clone());
    }

    /// A client dropped interest in some keys; unneeded results are
    /// garbage collected and fully unneeded tasks are forgotten.
    pub fn release_keys(&mut self, client: &ClientId, keys: &[TaskKey]) -> Outcome {
        debug!("Client {} releases {:?}", client, keys);
        let mut out = Outcome::default();
        for key in keys {
            let drop_client = match self.wants_what.get_mut(client) {
                Some(held) => {
                    held.remove(key);
                    held.is_empty()
                }
                None => false,
            };
            if drop_client {
                self.wants_what.remove(client);
            }
            let unwanted = match self.who_wants.get_mut(key) {
                Some(clients) => {
                    clients.remove(client);
                    clients.is_empty()
                }
                None => false,
            };
            if unwanted {
                self.who_wants.remove(key);
                self.finished_results.remove(key);
                self.release_held_data(key, &mut out);
            }
        }
        out
    }

    fn release_held_data(&mut self, key: &TaskKey, out: &mut Outcome) {
        if self.waiting_data.get(key).map_or(false, |s| !s.is_empty()) {
            return; // consumers still pending
        }
        if self.who_has.contains_key(key) {
            self.delete_data_one(key, out);
        }
        self.maybe_forget(key, out);
    }

    /// Forget a key once nothing refers to it, then retry its inputs.
    fn maybe_forget(&mut self, key: &TaskKey, out: &mut Outcome) {
        if self.wanted(key) {
            return;
        }
        if self.dependents.get(key).map_or(false, |s| !s.is_empty()) {
            return;
        }
        if !self.tasks.contains_key(key) && !self.who_has.contains_key(key)
            && !self.released.contains(key)
        {
            return;
        }
        if self.who_has.contains_key(key) {
            self.delete_data_one(key, out);
        }
        debug!("Forgetting key {}", key);
        self.tasks.remove(key);
        let deps = self.dependencies.remove(key).unwrap_or_default();
        self.dependents.remove(key);
        self.waiting.remove(key);
        self.waiting_data.remove(key);
        for stack in self.stacks.values_mut() {
            stack.retain(|k| k != key);
        }
        for processing in self.processing.values_mut() {
            processing.remove(key);
        }
        self.released.remove(key);
        self.finished_results.remove(key);
        self.restrictions.remove(key);
        self.loose_restrictions.remove(key);
        self.who_wants.remove(key);
        self.nbytes.remove(key);
        self.keyorder.remove(key);
        self.exceptions.remove(key);
        self.tracebacks.remove(key);
        self.exceptions_blame.remove(key);
        self.in_play.remove(key);
        for dep in sorted(deps) {
            if let Some(consumers) = self.dependents.get_mut(&dep) {
                consumers.remove(key);
            }
            if let Some(consumers) = self.waiting_data.get_mut(&dep) {
                consumers.remove(key);
            }
            self.maybe_forget(&dep, out);
        }
    }

    /// Drop a worker and reconstruct the plan from the surviving truth.
    pub fn remove_worker(&mut self, address: &WorkerId) -> Outcome {
        info!("Removing worker {}", address);
        let mut out = Outcome::default();
        self.ncores.remove(address);
        self.stacks.remove(address);
        self.processing.remove(address);
        let mut lost = Vec::new();
        for key in self.has_what.remove(address).unwrap_or_default() {
            let gone = match self.who_has.get_mut(&key) {
                Some(replicas) => {
                    replicas.remove(address);
                    replicas.is_empty()
                }
                None => false,
            };
            if gone {
                self.who_has.remove(&key);
                lost.push(key);
            }
        }
        let lost = sorted(lost);
        if !lost.is_empty() {
            debug!("Worker {} held the only replica of {:?}", address, lost);
            let mut per_client: HashMap<ClientId, Vec<TaskKey>> = HashMap::new();
            for key in &lost {
                if let Some(clients) = self.who_wants.get(key) {
                    for client in clients {
                        per_client
                            .entry(client.clone())
                            .or_insert_with(Vec::new)
                            .push(key.clone());
                    }
                }
                self.finished_results.remove(key);
            }
            for client in sorted(per_client.keys().cloned()) {
                let keys = per_client.remove(&client).unwrap();
                out.reports.push((client, Response::LostData { keys: keys }));
            }
        }
        out.merge(self.run_heal());
        match self.queue_ready() {
            Ok(more) => out.merge(more),
            Err(e) => error!("Re-queue after worker removal failed: {}", e),
        }
        out
    }

    /// Cancel everything in flight and wipe every key-indexed state,
    /// keeping client registrations. Workers are told to relaunch.
    pub fn restart(&mut self) -> Outcome {
        info!("Restarting: cancelling all tasks and clearing state");
        let mut out = Outcome::default();
        for worker in sorted_workers(self.ncores.keys().cloned()) {
            out.worker_msgs.push((worker, Response::Terminate {}));
        }
        self.tasks.clear();
        self.dependencies.clear();
        self.dependents.clear();
        self.waiting.clear();
        self.waiting_data.clear();
        self.who_has.clear();
        self.has_what.clear();
        self.stacks.clear();
        self.processing.clear();
        self.ncores.clear();
        self.in_play.clear();
        self.released.clear();
        self.finished_results.clear();
        self.restrictions.clear();
        self.loose_restrictions.clear();
        self.who_wants.clear();
        self.nbytes.clear();
        self.keyorder.clear();
        self.exceptions.clear();
        self.tracebacks.clear();
        self.exceptions_blame.clear();
        // interest is wiped; the controller broadcasts the restart
        // report to every connected client
        self.wants_what.clear();
        out
    }

    /// Check every invariant. With `allow_overlap`, a key may appear in
    /// more than one pipeline stage (used right after bulk admission of
    /// worker-held data).
    pub fn validate(&self, allow_overlap: bool) -> Result<()> {
        let in_stacks: HashSet<&TaskKey> = self.stacks.values().flat_map(|v| v.iter()).collect();
        let in_processing: HashSet<&TaskKey> =
            self.processing.values().flat_map(|s| s.iter()).collect();

        // who_has and has_what are exact inverses
        for (key, workers) in &self.who_has {
            for worker in workers {
                if !self.has_what.get(worker).map_or(false, |s| s.contains(key)) {
                    bail!(ErrorKind::InconsistentState(format!(
                        "who_has knows {} at {} but has_what does not",
                        key, worker
                    )));
                }
            }
        }
        for (worker, keys) in &self.has_what {
            for key in keys {
                if !self.who_has.get(key).map_or(false, |s| s.contains(worker)) {
                    bail!(ErrorKind::InconsistentState(format!(
                        "has_what knows {} at {} but who_has does not",
                        key, worker
                    )));
                }
            }
        }
        // who_wants and wants_what are exact inverses
        for (key, clients) in &self.who_wants {
            for client in clients {
                if !self.wants_what
                    .get(client)
                    .map_or(false, |s| s.contains(key))
                {
                    bail!(ErrorKind::InconsistentState(format!(
                        "who_wants knows {} for {} but wants_what does not",
                        key, client
                    )));
                }
            }
        }
        for (client, keys) in &self.wants_what {
            for key in keys {
                if !self.who_wants
                    .get(key)
                    .map_or(false, |s| s.contains(client))
                {
                    bail!(ErrorKind::InconsistentState(format!(
                        "wants_what knows {} for {} but who_wants does not",
                        key, client
                    )));
                }
            }
        }
        // tasks, dependencies and dependents agree
        for key in self.tasks.keys() {
            if !self.dependencies.contains_key(key) || !self.dependents.contains_key(key) {
                bail!(ErrorKind::InconsistentState(format!(
                    "task {} lacks dependency bookkeeping",
                    key
                )));
            }
        }
        for key in in_stacks.iter().chain(in_processing.iter()) {
            if !self.tasks.contains_key(*key) {
                bail!(ErrorKind::InconsistentState(format!(
                    "key {} queued or running without a task spec",
                    key
                )));
            }
        }

        // walk the graph downward from its sinks
        let mut stack: Vec<TaskKey> = self.dependents
            .iter()
            .filter(|&(_, consumers)| consumers.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        let mut checked: HashSet<TaskKey> = HashSet::new();
        while let Some(key) = stack.pop() {
            if !checked.insert(key.clone()) {
                continue;
            }
            if self.exceptions_blame.contains_key(&key) {
                // erred keys leave the pipeline until resubmitted
                continue;
            }
            let sink = self.dependents.get(&key).map_or(false, |s| s.is_empty());
            let places = [
                self.waiting.contains_key(&key),
                in_stacks.contains(&key),
                in_processing.contains(&key),
                self.who_has.contains_key(&key),
                self.released.contains(&key),
            ].iter()
                .filter(|&&p| p)
                .count();
            if places == 0 {
                bail!(ErrorKind::InconsistentState(format!(
                    "key {} is nowhere in the pipeline",
                    key
                )));
            }
            if places != 1 && !allow_overlap {
                bail!(ErrorKind::InconsistentState(format!(
                    "key {} is in {} pipeline stages at once",
                    key, places
                )));
            }
            if self.released.contains(&key) == self.in_play.contains(&key) {
                bail!(ErrorKind::InconsistentState(format!(
                    "key {} must be exactly one of released or in play",
                    key
                )));
            }
            if self.who_has.contains_key(&key) {
                if let Some(consumers) = self.dependents.get(&key) {
                    for consumer in consumers {
                        if self.waiting
                            .get(consumer)
                            .map_or(false, |pending| pending.contains(&key))
                        {
                            bail!(ErrorKind::InconsistentState(format!(
                                "{} waits for {} which is already in memory",
                                consumer, key
                            )));
                        }
                    }
                }
                if self.waiting.get(&key).map_or(false, |p| !p.is_empty()) {
                    bail!(ErrorKind::InconsistentState(format!(
                        "in-memory key {} still waits for inputs",
                        key
                    )));
                }
            }
            if in_stacks.contains(&key) || in_processing.contains(&key) {
                let satisfied = self.dependencies
                    .get(&key)
                    .map_or(true, |deps| deps.iter().all(|d| self.who_has.contains_key(d)));
                if !satisfied {
                    bail!(ErrorKind::InconsistentState(format!(
                        "key {} dispatched with inputs not in memory",
                        key
                    )));
                }
            }
            if self.finished_results.contains(&key) && !self.who_has.contains_key(&key) {
                bail!(ErrorKind::InconsistentState(format!(
                    "finished key {} is not in memory",
                    key
                )));
            }
            if sink && self.who_has.contains_key(&key) && self.wanted(&key)
                && !self.finished_results.contains(&key)
            {
                bail!(ErrorKind::InconsistentState(format!(
                    "completed desired key {} missing from finished results",
                    key
                )));
            }
            if let Some(deps) = self.dependencies.get(&key) {
                stack.extend(deps.iter().cloned());
            }
        }
        Ok(())
    }
}
