pub mod health_handlers;
pub mod loop_handlers;
