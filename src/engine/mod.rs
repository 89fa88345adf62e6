pub mod dispatch;
pub mod notify;
pub mod queue;
pub mod scheduler;
