pub mod responder;
pub mod tracker;
