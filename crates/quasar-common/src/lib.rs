pub mod caller;
pub mod controller;
pub mod error;
pub mod messages;
pub mod model;
pub mod node;
pub mod rate_limiter;
pub mod task;
pub mod telemetry;
pub mod util;
pub mod worker_api;

pub use caller::Caller;
pub use controller::{AccessController, LimiterSlot};
pub use error::QuasarError;
pub use messages::*;
pub use model::{FunctionType, ModelFormat, ModelRecord, ModelState};
pub use node::{GpuStatus, NodeInfo, NodeRole};
pub use rate_limiter::{RateLimiterConfig, TimeUnit, TokenBucketSpec};
pub use task::{
    CoordinatorPhase, DeploymentTask, FailureKind, NodeResult, ResultStatus, TaskKind, TaskState,
};
pub use util::now_ms;
pub use worker_api::WorkerApi;
