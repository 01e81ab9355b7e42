use std::collections::{HashMap, HashSet};

use serde_bytes::ByteBuf;
use serde_json;
use sha1::Sha1;

use common::id::{ClientId, TaskKey, WorkerId};
use errors::{ErrorKind, Result};

/// Opaque binary payload produced by a client or worker. The scheduler
/// never deserializes these, it only compares and forwards them.
pub type Blob = ByteBuf;

/// Distinguished function payload marking the monolithic
/// `(apply, f, args, kwargs)` task form.
pub const APPLY_MARKER: &[u8] = b"apply";

/// Stable content identity of an opaque payload.
pub fn tokenize(payload: &[u8]) -> String {
    Sha1::from(payload).digest().to_string()
}

/// A task as submitted on the wire.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum WireTask {
    /// A bare key reference: the key mirrors the value of another key.
    Alias(TaskKey),
    /// A monolithic task tuple: the function payload followed by one
    /// payload per positional argument.
    Tuple(Vec<Blob>),
    /// The pre-split form with a packed argument sequence.
    Run {
        function: Blob,
        args: Blob,
        #[serde(default)]
        kwargs: Option<Blob>,
    },
}

/// Positional arguments of a runnable task.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ArgList {
    /// One payload per positional argument.
    Each(Vec<Blob>),
    /// A single payload decoding to the whole argument sequence.
    Packed(Blob),
}

/// A runnable task body held by the scheduler.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSpec {
    pub function: Blob,
    pub args: ArgList,
    pub kwargs: Option<Blob>,
}

/// A task as held by the scheduler after admission.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskSpec {
    Alias(TaskKey),
    Run(RunSpec),
}

impl TaskSpec {
    /// Admit a wire task. The `(apply, f, args, kwargs)` tuple form is
    /// split into its function, argument and keyword payloads here.
    pub fn from_wire(task: WireTask) -> Result<TaskSpec> {
        match task {
            WireTask::Alias(key) => Ok(TaskSpec::Alias(key)),
            WireTask::Run {
                function,
                args,
                kwargs,
            } => Ok(TaskSpec::Run(RunSpec {
                function: function,
                args: ArgList::Packed(args),
                kwargs: kwargs,
            })),
            WireTask::Tuple(mut parts) => {
                if parts.is_empty() {
                    bail!(ErrorKind::Protocol("empty task tuple".to_string()));
                }
                let args = parts.split_off(1);
                let function = parts.pop().unwrap();
                if &function[..] == APPLY_MARKER {
                    let mut args = args;
                    if args.len() != 3 {
                        bail!(ErrorKind::Protocol(format!(
                            "apply form takes 3 payloads, got {}",
                            args.len()
                        )));
                    }
                    let kwargs = args.pop().unwrap();
                    let packed = args.pop().unwrap();
                    let function = args.pop().unwrap();
                    Ok(TaskSpec::Run(RunSpec {
                        function: function,
                        args: ArgList::Packed(packed),
                        kwargs: Some(kwargs),
                    }))
                } else {
                    Ok(TaskSpec::Run(RunSpec {
                        function: function,
                        args: ArgList::Each(args),
                        kwargs: None,
                    }))
                }
            }
        }
    }

    /// Stable identity of the task body, used to detect conflicting
    /// resubmissions of the same key.
    pub fn token(&self) -> String {
        let mut hash = Sha1::new();
        match *self {
            TaskSpec::Alias(ref key) => {
                hash.update(b"alias:");
                hash.update(key.as_bytes());
            }
            TaskSpec::Run(ref run) => {
                hash.update(b"run:");
                hash.update(&run.function[..]);
                match run.args {
                    ArgList::Each(ref parts) => for part in parts {
                        hash.update(b"#");
                        hash.update(&part[..]);
                    },
                    ArgList::Packed(ref packed) => {
                        hash.update(b"*");
                        hash.update(&packed[..]);
                    }
                }
                if let Some(ref kwargs) = run.kwargs {
                    hash.update(b"!");
                    hash.update(&kwargs[..]);
                }
            }
        }
        hash.digest().to_string()
    }
}

fn protocol_version() -> u32 {
    ::PROTOCOL_VERSION
}

/// Inbound messages. One enum covers both client and worker senders;
/// the registered role of a connection gates which ops are accepted.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Request {
    Identity {},
    RegisterClient {
        client: ClientId,
        #[serde(default = "protocol_version")]
        version: u32,
    },
    UpdateGraph {
        tasks: HashMap<TaskKey, WireTask>,
        #[serde(default)]
        dependencies: HashMap<TaskKey, HashSet<TaskKey>>,
        keys: Vec<TaskKey>,
        #[serde(default)]
        client: Option<ClientId>,
        #[serde(default)]
        restrictions: HashMap<TaskKey, HashSet<String>>,
        #[serde(default)]
        loose_restrictions: HashSet<TaskKey>,
        #[serde(default)]
        keyorder: HashMap<TaskKey, i64>,
    },
    ClientReleasesKeys {
        keys: Vec<TaskKey>,
        client: ClientId,
    },
    MissingData {
        keys: Vec<TaskKey>,
    },
    UpdateData {
        who_has: HashMap<TaskKey, HashSet<WorkerId>>,
        #[serde(default)]
        nbytes: HashMap<TaskKey, u64>,
        #[serde(default)]
        client: Option<ClientId>,
    },
    Restart {},
    CloseStream {},
    Feed {
        function: Blob,
        #[serde(default)]
        setup: Option<Blob>,
        #[serde(default)]
        teardown: Option<Blob>,
        interval_ms: u64,
    },

    RegisterWorker {
        address: WorkerId,
        ncores: u32,
        #[serde(default)]
        keys: Vec<TaskKey>,
        #[serde(default = "protocol_version")]
        version: u32,
    },
    TaskFinished {
        key: TaskKey,
        nbytes: u64,
    },
    TaskErred {
        key: TaskKey,
        exception: Blob,
        traceback: Blob,
    },
    AddKeys {
        keys: Vec<TaskKey>,
    },
    RemoveKeys {
        keys: Vec<TaskKey>,
    },
    Heartbeat {},
}

/// Outbound messages, to clients (reports) and to workers (operations).
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Response {
    IdentityResponse {
        #[serde(rename = "type")]
        kind: String,
        id: String,
    },
    StreamStart {},
    KeyInMemory {
        key: TaskKey,
        #[serde(default)]
        nbytes: Option<u64>,
    },
    TaskErred {
        key: TaskKey,
        exception: Blob,
        traceback: Blob,
    },
    LostData {
        keys: Vec<TaskKey>,
    },
    Restart {},
    StreamClosed {},
    FeedUpdate {
        name: String,
        payload: serde_json::Value,
    },

    ComputeTask {
        key: TaskKey,
        function: Blob,
        args: ArgList,
        #[serde(default)]
        kwargs: Option<Blob>,
        who_has: HashMap<TaskKey, Vec<WorkerId>>,
    },
    DeleteData {
        keys: Vec<TaskKey>,
        #[serde(default)]
        report: bool,
    },
    Terminate {},
}

/// Requests served on a worker's data port.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum DataRequest {
    Gather { keys: Vec<TaskKey> },
}

/// Responses on a worker's data port.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum DataResponse {
    GatherData {
        data: HashMap<TaskKey, Blob>,
        #[serde(default)]
        missing: Vec<TaskKey>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{self, Value};

    fn blob(value: &Value) -> Blob {
        ByteBuf::from(serde_json::to_vec(value).unwrap())
    }

    #[test]
    fn ops_are_kebab_tagged() {
        let msg = Request::RegisterClient {
            client: "ident".to_string(),
            version: ::PROTOCOL_VERSION,
        };
        let value: Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["op"], "register-client");
        assert_eq!(value["client"], "ident");

        // a registration without a version gets the current one
        let decoded: Request =
            serde_json::from_value(json!({"op": "register-client", "client": "c"})).unwrap();
        match decoded {
            Request::RegisterClient { version, .. } => assert_eq!(version, ::PROTOCOL_VERSION),
            other => panic!("unexpected message: {:?}", other),
        }

        let msg = Response::KeyInMemory {
            key: "x".to_string(),
            nbytes: Some(8),
        };
        let value: Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["op"], "key-in-memory");
    }

    #[test]
    fn tuple_form_splits_function_and_args() {
        let task = WireTask::Tuple(vec![
            Blob::from(b"inc".to_vec()),
            blob(&Value::from(1)),
        ]);
        match TaskSpec::from_wire(task).unwrap() {
            TaskSpec::Run(run) => {
                assert_eq!(run.function.as_ref() as &[u8], b"inc");
                assert_eq!(run.args, ArgList::Each(vec![blob(&Value::from(1))]));
                assert!(run.kwargs.is_none());
            }
            other => panic!("unexpected spec: {:?}", other),
        }
    }

    #[test]
    fn apply_form_splits_into_kwargs() {
        let task = WireTask::Tuple(vec![
            Blob::from(APPLY_MARKER.to_vec()),
            Blob::from(b"add".to_vec()),
            blob(&json!([1])),
            blob(&json!({"y": 10})),
        ]);
        match TaskSpec::from_wire(task).unwrap() {
            TaskSpec::Run(run) => {
                assert_eq!(run.function.as_ref() as &[u8], b"add");
                assert_eq!(run.args, ArgList::Packed(blob(&json!([1]))));
                assert_eq!(run.kwargs, Some(blob(&json!({"y": 10}))));
            }
            other => panic!("unexpected spec: {:?}", other),
        }
    }

    #[test]
    fn token_is_stable_and_content_sensitive() {
        let inc = TaskSpec::from_wire(WireTask::Tuple(vec![
            Blob::from(b"inc".to_vec()),
            blob(&Value::from(1)),
        ])).unwrap();
        let inc2 = TaskSpec::from_wire(WireTask::Tuple(vec![
            Blob::from(b"inc".to_vec()),
            blob(&Value::from(1)),
        ])).unwrap();
        let dec = TaskSpec::from_wire(WireTask::Tuple(vec![
            Blob::from(b"dec".to_vec()),
            blob(&Value::from(1)),
        ])).unwrap();
        assert_eq!(inc.token(), inc2.token());
        assert_ne!(inc.token(), dec.token());
    }
}
