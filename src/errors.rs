use common::id::TaskKey;

error_chain! {
    foreign_links {
        Io(::std::io::Error);
        Json(::serde_json::Error);
    }

    errors {
        Protocol(message: String) {
            description("protocol error")
            display("protocol error: {}", message)
        }
        CyclicGraph(key: TaskKey) {
            description("cyclic dependency graph")
            display("cyclic dependency through key '{}'", key)
        }
        Placement(key: TaskKey) {
            description("no worker satisfies the placement restriction")
            display("no valid workers for key '{}'", key)
        }
        NoWorkers {
            description("no workers available")
            display("no workers available")
        }
        InconsistentState(message: String) {
            description("scheduler state is inconsistent")
            display("inconsistent state: {}", message)
        }
    }
}
