// LivelyBot CAN motor runtime: protocol, streaming and control
pub mod config;
pub mod messages;
pub mod motor;
pub mod runtime;
