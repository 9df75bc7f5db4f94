pub mod json;
pub mod message_pack;
pub mod serializer;
