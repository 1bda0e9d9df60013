pub mod args;
pub mod controller_service;
pub mod coordinator;
pub mod handlers;
pub mod metrics;
pub mod node_selector;
pub mod reconcile;
pub mod settings;
pub mod task_manager;
pub mod topology;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use controller_service::ControllerService;
pub use coordinator::DeploymentCoordinator;
pub use handlers::{router, AppState};
pub use node_selector::NodeSelector;
pub use reconcile::{reconcile_loop, SyncReport};
pub use settings::{CoordinatorSettings, SelectorSettings};
pub use task_manager::TaskManager;
pub use topology::{ClusterTopology, MetaTopology, StaticTopology};
pub use transport::{HttpTransport, LocalTransport, NodeTransport};
