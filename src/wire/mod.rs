pub mod codec;
pub mod message;
pub mod protocol;
pub mod records;
