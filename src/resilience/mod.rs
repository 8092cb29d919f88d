//! Failure isolation primitives shared by the engine, the communication
//! layer and the recovery system.

pub mod circuit_breaker;
pub mod retry;
