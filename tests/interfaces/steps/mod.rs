//! Cucumber step definitions for interface tests.

pub mod broker;
pub mod rpc;
