use std::collections::{HashMap, HashSet};

use common::id::{ClientId, TaskKey};
use common::protocol::{Response, TaskSpec};
use errors::{ErrorKind, Result};
use server::graph::{sorted, Graph, Outcome};

impl Graph {
    /// Merge a submitted sub-graph into the live state.
    ///
    /// New tasks are indexed, their effective waiting sets computed
    /// against data already in memory, released inputs are restored as
    /// waiting tasks all the way up, client interest is recorded and
    /// everything that became runnable is queued. The update is refused
    /// before any index changes when it references unknown keys or
    /// introduces a cycle.
    pub fn update_graph(
        &mut self,
        tasks: HashMap<TaskKey, TaskSpec>,
        dependencies: HashMap<TaskKey, HashSet<TaskKey>>,
        keys: Vec<TaskKey>,
        restrictions: HashMap<TaskKey, HashSet<String>>,
        loose_restrictions: HashSet<TaskKey>,
        keyorder: HashMap<TaskKey, i64>,
        client: Option<ClientId>,
    ) -> Result<Outcome> {
        let mut dependencies = dependencies;

        // an alias depends on its target, except a self-alias
        for (key, spec) in &tasks {
            if let TaskSpec::Alias(ref target) = *spec {
                if target != key {
                    dependencies
                        .entry(key.clone())
                        .or_insert_with(HashSet::new)
                        .insert(target.clone());
                }
            }
        }

        {
            let known = |key: &TaskKey| {
                tasks.contains_key(key) || self.tasks.contains_key(key)
                    || self.who_has.contains_key(key)
            };
            for (key, deps) in &dependencies {
                if !tasks.contains_key(key) && !self.tasks.contains_key(key) {
                    bail!(ErrorKind::Protocol(format!(
                        "dependencies submitted for unknown task '{}'",
                        key
                    )));
                }
                for dep in deps {
                    if !known(dep) {
                        bail!(ErrorKind::Protocol(format!(
                            "task '{}' depends on unknown key '{}'",
                            key, dep
                        )));
                    }
                }
            }
            for key in &keys {
                if !known(key) {
                    bail!(ErrorKind::Protocol(format!(
                        "requested key '{}' was never submitted",
                        key
                    )));
                }
            }
        }
        check_cycles(&tasks, &dependencies, &self.dependencies)?;

        let mut out = Outcome::default();
        debug!(
            "Updating graph: {} tasks, {} requested keys",
            tasks.len(),
            keys.len()
        );

        let submitted: Vec<TaskKey> = sorted(tasks.keys().cloned());
        for (key, spec) in tasks {
            if let Some(previous) = self.tasks.get(&key) {
                if previous.token() != spec.token() {
                    debug!("Task {} resubmitted with a different body", key);
                }
            }
            // resubmission clears a recorded failure
            if self.exceptions_blame.remove(&key).is_some() {
                self.exceptions.remove(&key);
                self.tracebacks.remove(&key);
            }
            self.tasks.insert(key.clone(), spec);
            let deps = dependencies.get(&key).cloned().unwrap_or_default();
            self.dependencies
                .entry(key.clone())
                .or_insert_with(HashSet::new)
                .extend(deps.iter().cloned());
            self.dependents.entry(key.clone()).or_insert_with(HashSet::new);
            for dep in deps {
                self.dependents
                    .entry(dep)
                    .or_insert_with(HashSet::new)
                    .insert(key.clone());
            }
        }
        for key in &submitted {
            if !self.keyorder.contains_key(key) {
                let order = keyorder
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| self.next_order());
                self.keyorder.insert(key.clone(), order);
            }
        }
        for (key, hosts) in restrictions {
            self.restrictions.insert(key, hosts);
        }
        self.loose_restrictions.extend(loose_restrictions);

        // walk from the requested keys (and fresh sinks) down to data or
        // leaves, activating everything that has to run
        let mut stack: Vec<TaskKey> = keys.clone();
        for key in &submitted {
            if self.dependents.get(key).map_or(false, |d| d.is_empty()) {
                stack.push(key.clone());
            }
        }
        let mut touched: HashSet<TaskKey> = HashSet::new();
        while let Some(key) = stack.pop() {
            if touched.contains(&key) || self.who_has.contains_key(&key)
                || self.in_play.contains(&key)
            {
                continue;
            }
            touched.insert(key.clone());
            let deps: Vec<TaskKey> = self.dependencies
                .get(&key)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default();
            let mut pending: HashSet<TaskKey> = HashSet::new();
            for dep in &deps {
                self.waiting_data
                    .entry(dep.clone())
                    .or_insert_with(HashSet::new)
                    .insert(key.clone());
                if !self.who_has.contains_key(dep) {
                    pending.insert(dep.clone());
                    if !self.in_play.contains(dep) {
                        stack.push(dep.clone());
                    }
                }
            }
            self.waiting_data.entry(key.clone()).or_insert_with(HashSet::new);
            self.waiting.insert(key.clone(), pending);
            self.released.remove(&key);
            self.in_play.insert(key.clone());
        }

        if let Some(ref client) = client {
            for key in &keys {
                self.client_wants(client, key);
                if self.who_has.contains_key(key) {
                    out.reports.push((
                        client.clone(),
                        Response::KeyInMemory {
                            key: key.clone(),
                            nbytes: self.nbytes.get(key).cloned(),
                        },
                    ));
                } else if let Some(failing) = self.exceptions_blame.get(key).cloned() {
                    // still blamed from an earlier run and not resubmitted
                    let exception = self.exceptions.get(&failing).cloned();
                    let traceback = self.tracebacks.get(&failing).cloned();
                    if let (Some(exception), Some(traceback)) = (exception, traceback) {
                        out.reports.push((
                            client.clone(),
                            Response::TaskErred {
                                key: key.clone(),
                                exception: exception,
                                traceback: traceback,
                            },
                        ));
                    }
                }
            }
        }

        out.merge(self.queue_ready()?);
        Ok(out)
    }
}

/// Refuse graphs whose combined dependency relation has a cycle.
fn check_cycles(
    new_tasks: &HashMap<TaskKey, TaskSpec>,
    new_dependencies: &HashMap<TaskKey, HashSet<TaskKey>>,
    existing: &HashMap<TaskKey, HashSet<TaskKey>>,
) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Active,
        Done,
    }

    fn visit(
        key: &TaskKey,
        marks: &mut HashMap<TaskKey, Mark>,
        new_dependencies: &HashMap<TaskKey, HashSet<TaskKey>>,
        existing: &HashMap<TaskKey, HashSet<TaskKey>>,
    ) -> Result<()> {
        match marks.get(key) {
            Some(&Mark::Done) => return Ok(()),
            Some(&Mark::Active) => bail!(ErrorKind::CyclicGraph(key.clone())),
            None => {}
        }
        marks.insert(key.clone(), Mark::Active);
        let deps = new_dependencies.get(key).or_else(|| existing.get(key));
        if let Some(deps) = deps {
            for dep in sorted(deps.iter()) {
                visit(dep, marks, new_dependencies, existing)?;
            }
        }
        marks.insert(key.clone(), Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for key in sorted(new_tasks.keys()) {
        visit(key, &mut marks, new_dependencies, existing)?;
    }
    Ok(())
}
