pub mod api;
pub mod dag;
pub mod dsl;
pub mod error;
pub mod executor;
pub mod graph;
pub mod history;
pub mod scheduler;

pub use crate::api::{dry_run, exit_code, retry, run, DryRunReport, RunOptions};
pub use crate::dag::{build, load_file, BuildContext, Capsule, Dag, Step};
pub use crate::dsl::{parse_definition, Definition};
pub use crate::error::{BuildError, ErrorList, WorkflowError};
pub use crate::executor::{ExecContext, Executor, ExecutorRegistry, OutputSink, Signal};
pub use crate::graph::{ExecutionGraph, Node, NodeState, NodeStatus};
pub use crate::history::{HistoryStore, InMemoryHistoryStore, RunRecord};
pub use crate::scheduler::{
    create_event_channel, CapsuleSync, EventReceiver, EventSender, RunStatus, Scheduler,
    SchedulerEvent,
};
