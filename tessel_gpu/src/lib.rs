//! Tensor layout propagation core for the Tessel GPU compiler.
//!
//! Tensor values carry an encoding that describes how their elements are
//! distributed across lanes. This crate provides:
//! - **Tensor IR**: arena-backed SSA module with regions, loops and use lists
//! - **Type inference**: per-operation result type and encoding rules
//! - **Conversion elimination**: backward rematerialization of producer
//!   chains, loop conversion hoisting and loop signature repair
#![deny(unsafe_code)]

pub mod ir;
pub mod opt;
