//! Agent module for llamachat
//!
//! This module contains the agent state machine: the running prompt, the
//! live partial output and the single in-flight completion stream.

pub mod core;

pub use core::{Agent, AgentStatus, TurnSlot};
