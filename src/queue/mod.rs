pub mod dispatcher;
pub mod instance;
pub mod queue;

pub use dispatcher::{ControlEvent, DispatchSettings, Dispatcher};
pub use instance::{FailureCause, InstanceState, JobInstance};
pub use queue::{EnvironmentBinding, JobQueue, JobRequest, QueueRegistry, QueueState};
