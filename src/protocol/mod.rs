pub mod envelope;
pub mod message_id;
pub mod message_type;
pub mod policy;
