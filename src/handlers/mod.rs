pub mod event_handlers;
pub mod health_handlers;
pub mod workflow_handlers;
