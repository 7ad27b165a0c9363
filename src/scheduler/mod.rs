pub mod dispatcher;
pub mod job;
pub mod queue;
pub mod store;

pub use dispatcher::{Scheduler, WebhookNotice};
pub use job::{Job, JobPriority, JobSpec, JobStatus, Step, StepType};
pub use queue::PriorityQueue;
pub use store::{JobStore, TransitionOpts};
