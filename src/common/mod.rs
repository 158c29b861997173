//! Types shared by the identity, transport and agent layers.

pub mod constants;
pub mod credential;
pub mod errors;
