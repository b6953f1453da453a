pub mod assignment;
pub mod lifecycle;
pub mod outbox;
pub mod selection;
