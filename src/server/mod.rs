pub mod client;
pub mod feed;
pub mod graph;
pub mod heal;
pub mod schedule;
pub mod state;
pub mod update;

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use serde_json::Value;

    use common::id::{ClientId, TaskKey, WorkerId};
    use common::protocol::{ArgList, Blob, Response, RunSpec, TaskSpec};
    use server::graph::{Graph, Outcome};

    fn alice() -> WorkerId {
        "10.0.0.1:8000".parse().unwrap()
    }

    fn bob() -> WorkerId {
        "10.0.0.2:8000".parse().unwrap()
    }

    fn blob(value: &Value) -> Blob {
        Blob::from(::serde_json::to_vec(value).unwrap())
    }

    /// A task calling a named builtin with literal or key arguments.
    fn run(function: &str, args: &[Value]) -> TaskSpec {
        TaskSpec::Run(RunSpec {
            function: Blob::from(function.as_bytes().to_vec()),
            args: ArgList::Each(args.iter().map(blob).collect()),
            kwargs: None,
        })
    }

    fn key(name: &str) -> Value {
        Value::String(name.to_string())
    }

    fn submit(
        graph: &mut Graph,
        tasks: Vec<(&str, TaskSpec)>,
        dependencies: &[(&str, &[&str])],
        keys: &[&str],
        client: &str,
    ) -> Outcome {
        let tasks: HashMap<TaskKey, TaskSpec> = tasks
            .into_iter()
            .map(|(k, spec)| (k.to_string(), spec))
            .collect();
        let dependencies: HashMap<TaskKey, HashSet<TaskKey>> = dependencies
            .iter()
            .map(|&(k, deps)| {
                (
                    k.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect();
        graph
            .update_graph(
                tasks,
                dependencies,
                keys.iter().map(|k| k.to_string()).collect(),
                HashMap::new(),
                HashSet::new(),
                HashMap::new(),
                Some(client.to_string()),
            )
            .unwrap()
    }

    fn computes(out: &Outcome) -> Vec<(WorkerId, TaskKey)> {
        out.worker_msgs
            .iter()
            .filter_map(|&(worker, ref msg)| match *msg {
                Response::ComputeTask { ref key, .. } => Some((worker, key.clone())),
                _ => None,
            })
            .collect()
    }

    fn in_memory_reports(reports: &[(ClientId, Response)], client: &str, key: &str) -> usize {
        reports
            .iter()
            .filter(|&&(ref c, ref r)| {
                c == client
                    && match *r {
                        Response::KeyInMemory { key: ref k, .. } => k == key,
                        _ => false,
                    }
            })
            .count()
    }

    fn erred_report(reports: &[(ClientId, Response)], client: &str, key: &str) -> Option<Blob> {
        reports.iter().find_map(|&(ref c, ref r)| {
            if c != client {
                return None;
            }
            match *r {
                Response::TaskErred {
                    key: ref k,
                    ref exception,
                    ..
                } if k == key =>
                {
                    Some(exception.clone())
                }
                _ => None,
            }
        })
    }

    /// Simulate every dispatched task completing, transitively.
    fn pump(graph: &mut Graph, out: Outcome, reports: &mut Vec<(ClientId, Response)>) {
        let mut queue = computes(&out);
        reports.extend(out.reports);
        while let Some((worker, key)) = queue.pop() {
            let next = graph.mark_task_finished(&worker, &key, 8);
            queue.extend(computes(&next));
            reports.extend(next.reports);
            graph.validate(false).unwrap();
        }
    }

    #[test]
    fn single_task_runs_and_reports() {
        let mut g = Graph::new();
        g.add_worker(alice(), 1, Vec::new()).unwrap();
        let out = submit(
            &mut g,
            vec![("x", run("inc", &[Value::from(1)]))],
            &[("x", &[])],
            &["x"],
            "ident",
        );
        let dispatched = computes(&out);
        assert_eq!(dispatched, vec![(alice(), "x".to_string())]);
        g.validate(false).unwrap();

        let done = g.mark_task_finished(&alice(), &"x".to_string(), 8);
        assert_eq!(in_memory_reports(&done.reports, "ident", "x"), 1);
        assert!(g.finished_results.contains("x"));
        g.validate(false).unwrap();
    }

    #[test]
    fn chain_recomputes_after_missing_data() {
        let mut g = Graph::new();
        g.add_worker(alice(), 1, Vec::new()).unwrap();
        g.add_worker(bob(), 1, Vec::new()).unwrap();
        let out = submit(
            &mut g,
            vec![
                ("x", run("inc", &[Value::from(1)])),
                ("y", run("inc", &[key("x")])),
                ("z", run("inc", &[key("y")])),
            ],
            &[("x", &[]), ("y", &["x"]), ("z", &["y"])],
            &["x", "z"],
            "ident",
        );
        let mut reports = Vec::new();
        pump(&mut g, out, &mut reports);
        assert_eq!(in_memory_reports(&reports, "ident", "z"), 1);
        assert_eq!(in_memory_reports(&reports, "ident", "x"), 1);
        assert!(g.who_has.contains_key("z"));
        // the intermediate result was not kept alive
        assert!(!g.who_has.contains_key("y"));

        // the client cannot fetch z: recompute it
        let out = g.heal_missing_data(&["z".to_string()]);
        g.validate(false).unwrap();
        let mut reports = Vec::new();
        pump(&mut g, out, &mut reports);
        assert_eq!(in_memory_reports(&reports, "ident", "z"), 1);
        assert!(g.who_has.contains_key("z"));
        g.validate(false).unwrap();
    }

    #[test]
    fn errors_propagate_blame_to_dependents() {
        let mut g = Graph::new();
        g.add_worker(alice(), 2, Vec::new()).unwrap();
        let out = submit(
            &mut g,
            vec![
                ("a", run("div", &[Value::from(1), Value::from(0)])),
                ("b", run("inc", &[key("a")])),
            ],
            &[("a", &[]), ("b", &["a"])],
            &["a", "b"],
            "ident",
        );
        assert_eq!(computes(&out), vec![(alice(), "a".to_string())]);

        let exception = blob(&Value::String("division by zero".to_string()));
        let traceback = blob(&Value::String("builtin div".to_string()));
        let erred = g.mark_task_erred(&alice(), &"a".to_string(), exception.clone(), traceback);
        let blamed_a = erred_report(&erred.reports, "ident", "a").unwrap();
        let blamed_b = erred_report(&erred.reports, "ident", "b").unwrap();
        assert_eq!(blamed_a, exception);
        assert_eq!(blamed_b, exception);
        assert_eq!(g.exceptions_blame["b"], "a".to_string());
        // nothing of the failed chain is queued anywhere
        assert!(g.stacks.values().all(|s| s.is_empty()));
        assert!(g.processing.values().all(|p| p.is_empty()));

        // the scheduler stays responsive
        let out = submit(
            &mut g,
            vec![("c", run("inc", &[Value::from(10)]))],
            &[("c", &[])],
            &["c"],
            "ident",
        );
        let mut reports = Vec::new();
        pump(&mut g, out, &mut reports);
        assert_eq!(in_memory_reports(&reports, "ident", "c"), 1);

        // resubmitting the failed keys clears the blame
        let out = submit(
            &mut g,
            vec![
                ("a", run("div", &[Value::from(1), Value::from(1)])),
                ("b", run("inc", &[key("a")])),
            ],
            &[("a", &[]), ("b", &["a"])],
            &["a", "b"],
            "ident",
        );
        assert!(g.exceptions_blame.is_empty());
        let mut reports = Vec::new();
        pump(&mut g, out, &mut reports);
        assert_eq!(in_memory_reports(&reports, "ident", "b"), 1);
    }

    #[test]
    fn loose_restrictions_balance_against_locality() {
        let mut g = Graph::new();
        g.add_worker(alice(), 1, Vec::new()).unwrap();
        g.add_worker(bob(), 1, Vec::new()).unwrap();
        let mut who_has = HashMap::new();
        who_has.insert(
            "x".to_string(),
            Some(alice()).into_iter().collect::<HashSet<_>>(),
        );
        let mut nbytes = HashMap::new();
        nbytes.insert("x".to_string(), 100_000u64);
        g.update_data(who_has, nbytes, Some("ident".to_string()));

        // a live restricted worker wins even though the data is elsewhere
        let mut restrictions = HashMap::new();
        restrictions.insert(
            "y".to_string(),
            vec!["10.0.0.2".to_string()].into_iter().collect::<HashSet<_>>(),
        );
        let out = g.update_graph(
            vec![("y".to_string(), run("inc", &[key("x")]))]
                .into_iter()
                .collect(),
            vec![("y".to_string(), vec!["x".to_string()].into_iter().collect())]
                .into_iter()
                .collect(),
            vec!["y".to_string()],
            restrictions,
            vec!["y".to_string()].into_iter().collect(),
            HashMap::new(),
            Some("ident".to_string()),
        ).unwrap();
        assert_eq!(computes(&out), vec![(bob(), "y".to_string())]);
        let _ = g.mark_task_finished(&bob(), &"y".to_string(), 8);

        // an offline restricted host falls back by locality
        let mut restrictions = HashMap::new();
        restrictions.insert(
            "w".to_string(),
            vec!["10.0.0.9".to_string()].into_iter().collect::<HashSet<_>>(),
        );
        let out = g.update_graph(
            vec![("w".to_string(), run("inc", &[key("x")]))]
                .into_iter()
                .collect(),
            vec![("w".to_string(), vec!["x".to_string()].into_iter().collect())]
                .into_iter()
                .collect(),
            vec!["w".to_string()],
            restrictions,
            vec!["w".to_string()].into_iter().collect(),
            HashMap::new(),
            Some("ident".to_string()),
        ).unwrap();
        assert_eq!(computes(&out), vec![(alice(), "w".to_string())]);
    }

    #[test]
    fn strict_restriction_without_worker_errs_the_task() {
        let mut g = Graph::new();
        g.add_worker(alice(), 1, Vec::new()).unwrap();
        let mut restrictions = HashMap::new();
        restrictions.insert(
            "x".to_string(),
            vec!["10.0.0.9".to_string()].into_iter().collect::<HashSet<_>>(),
        );
        let out = g.update_graph(
            vec![("x".to_string(), run("inc", &[Value::from(1)]))]
                .into_iter()
                .collect(),
            HashMap::new(),
            vec!["x".to_string()],
            restrictions,
            HashSet::new(),
            HashMap::new(),
            Some("ident".to_string()),
        ).unwrap();
        assert!(computes(&out).is_empty());
        assert!(erred_report(&out.reports, "ident", "x").is_some());
        assert!(g.exceptions_blame.contains_key("x"));
    }

    #[test]
    fn map_survives_losing_a_worker() {
        let mut g = Graph::new();
        g.add_worker(alice(), 2, Vec::new()).unwrap();
        g.add_worker(bob(), 2, Vec::new()).unwrap();
        let names: Vec<String> = (0..10).map(|i| format!("t-{}", i)).collect();
        let tasks: Vec<(&str, TaskSpec)> = names
            .iter()
            .map(|n| (n.as_str(), run("inc", &[Value::from(1)])))
            .collect();
        let dependencies: Vec<(&str, &[&str])> =
            names.iter().map(|n| (n.as_str(), &[][..])).collect();
        let keys: Vec<&str> = names.iter().map(|n| n.as_str()).collect();
        let out = submit(&mut g, tasks, &dependencies, &keys, "ident");

        let mut reports = Vec::new();
        pump(&mut g, out, &mut reports);
        for name in &names {
            assert!(g.who_has.contains_key(name.as_str()));
        }

        // one worker dies with its share of the results
        let out = g.remove_worker(&alice());
        assert!(!g.ncores.contains_key(&alice()));
        assert!(!g.stacks.contains_key(&alice()));
        g.validate(false).unwrap();
        pump(&mut g, out, &mut reports);

        for name in &names {
            assert!(g.who_has.contains_key(name.as_str()));
            assert_eq!(
                g.who_has[name.as_str()],
                Some(bob()).into_iter().collect::<HashSet<_>>()
            );
            assert!(g.finished_results.contains(name.as_str()));
        }
        g.validate(false).unwrap();
    }

    #[test]
    fn restart_wipes_every_key_index() {
        let mut g = Graph::new();
        g.add_worker(alice(), 1, Vec::new()).unwrap();
        let out = submit(
            &mut g,
            vec![
                ("x", run("inc", &[Value::from(1)])),
                ("y", run("inc", &[key("x")])),
            ],
            &[("x", &[]), ("y", &["x"])],
            &["y"],
            "ident",
        );
        assert!(!computes(&out).is_empty());

        let out = g.restart();
        let terminated = out.worker_msgs
            .iter()
            .any(|&(worker, ref msg)| worker == alice() && match *msg {
                Response::Terminate {} => true,
                _ => false,
            });
        assert!(terminated);
        assert!(g.tasks.is_empty());
        assert!(g.who_has.is_empty());
        assert!(g.waiting.is_empty());
        assert!(g.processing.is_empty());
        assert!(g.ncores.is_empty());
        assert!(g.who_wants.is_empty());

        // the scheduler accepts fresh graphs after workers re-register
        g.add_worker(alice(), 1, Vec::new()).unwrap();
        let out = submit(
            &mut g,
            vec![("x", run("inc", &[Value::from(1)]))],
            &[("x", &[])],
            &["x"],
            "ident",
        );
        let mut reports = Vec::new();
        pump(&mut g, out, &mut reports);
        assert_eq!(in_memory_reports(&reports, "ident", "x"), 1);
    }

    #[test]
    fn self_alias_of_in_memory_data_schedules_only_the_consumer() {
        let mut g = Graph::new();
        g.add_worker(alice(), 1, Vec::new()).unwrap();
        let mut who_has = HashMap::new();
        who_has.insert(
            "a".to_string(),
            Some(alice()).into_iter().collect::<HashSet<_>>(),
        );
        let mut nbytes = HashMap::new();
        nbytes.insert("a".to_string(), 10u64);
        g.update_data(who_has, nbytes, Some("ident".to_string()));

        let out = submit(
            &mut g,
            vec![
                ("a", TaskSpec::Alias("a".to_string())),
                ("b", run("inc", &[key("a")])),
            ],
            &[("b", &["a"])],
            &["b"],
            "ident",
        );
        // only b runs, and it runs where a lives
        assert_eq!(computes(&out), vec![(alice(), "b".to_string())]);
        let mut reports = Vec::new();
        pump(&mut g, out, &mut reports);
        assert_eq!(in_memory_reports(&reports, "ident", "b"), 1);
    }

    #[test]
    fn alias_of_a_pending_key_becomes_a_waiting_proxy() {
        let mut g = Graph::new();
        g.add_worker(alice(), 1, Vec::new()).unwrap();
        let out = submit(
            &mut g,
            vec![
                ("x", run("inc", &[Value::from(1)])),
                ("y", TaskSpec::Alias("x".to_string())),
            ],
            &[("x", &[])],
            &["y"],
            "ident",
        );
        // x runs first; y waits on it
        assert_eq!(computes(&out), vec![(alice(), "x".to_string())]);
        assert_eq!(
            g.waiting["y"],
            vec!["x".to_string()].into_iter().collect::<HashSet<_>>()
        );
        let mut reports = Vec::new();
        pump(&mut g, out, &mut reports);
        assert_eq!(in_memory_reports(&reports, "ident", "y"), 1);
        g.validate(false).unwrap();
    }

    #[test]
    fn released_interest_garbage_collects_data() {
        let mut g = Graph::new();
        g.add_worker(alice(), 1, Vec::new()).unwrap();
        let out = submit(
            &mut g,
            vec![("x", run("inc", &[Value::from(1)]))],
            &[("x", &[])],
            &["x"],
            "ident",
        );
        let mut reports = Vec::new();
        pump(&mut g, out, &mut reports);
        assert!(g.who_has.contains_key("x"));

        let out = g.release_keys(&"ident".to_string(), &["x".to_string()]);
        assert!(out.deletions.iter().any(|&(w, ref k)| w == alice() && k == "x"));
        assert!(!g.who_has.contains_key("x"));
        assert!(!g.tasks.contains_key("x"));
    }
}
