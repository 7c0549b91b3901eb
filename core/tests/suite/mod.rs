mod common;
mod exec_flow;
mod lifecycle;
mod memory_flow;
mod plan_flow;
