pub mod event;
pub mod relay;
pub mod topology;
