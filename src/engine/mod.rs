pub mod chat;
pub mod location;
pub mod orders;
pub mod settlement;
