pub mod codec;
pub mod connection;
pub mod packet;
pub mod session;
