//! The supervised agent pipeline: Planner, Critic and Executor task agents,
//! the fail-closed policy engine, the lockdown controller, the human approval
//! gate, and the orchestrator that sequences them.

pub mod approval;
pub mod lockdown;
pub mod narrator;
pub mod orchestrator;
pub mod response;
pub mod roles;
pub mod sentinel;
pub mod task_agent;
