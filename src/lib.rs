// MYCOFLOW -- REFLEXIVE QOS CONTROLLER FOR A SINGLE EGRESS LINK
// SENSE -> INFER -> DECIDE -> ACT, ONCE PER TICK
//
// PURE CONTROL LOGIC (ewma, flow, persona, control) HAS ZERO KERNEL
// DEPENDENCIES AND IS EXERCISED OFFLINE BY tests/control.rs.

pub mod act;
pub mod config;
pub mod control;
pub mod daemon;
pub mod ebpf;
pub mod ewma;
pub mod flow;
pub mod ipc;
pub mod netlink;
pub mod persona;
pub mod sense;
pub mod state;
