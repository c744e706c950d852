//! Tensor IR.
//!
//! # Core Components
//!
//! - **Arena** (`arena.rs`): Typed index storage
//! - **Encoding** (`encoding.rs`): Physical layout attributes
//! - **Types** (`types.rs`): Scalar and tensor types
//! - **Ops** (`ops.rs`): Operation kinds and type/encoding inference
//! - **Operation** (`operation.rs`): Operation, value and block records
//! - **Module** (`module.rs`): Owning graph with use-def navigation
//! - **Builder** (`builder.rs`): Construction context
//! - **Verify** (`verify.rs`): Whole-module consistency checks
//!
//! # Design Principles
//!
//! - **Index handles**: `OpId`/`ValueId`/`BlockId` instead of pointers
//! - **Derived use lists**: maintained incrementally, rebuildable from operands
//! - **Explicit loops**: `For` carries init args, iteration args, yield and results

pub mod arena;
pub mod builder;
pub mod encoding;
pub mod module;
pub mod operation;
pub mod ops;
pub mod types;
pub mod verify;

pub use arena::{Arena, Id, SecondaryMap};
pub use builder::OpBuilder;
pub use encoding::{
    BlockedEncoding, DotOperandEncoding, Encoding, MmaEncoding, SharedEncoding, SliceEncoding,
};
pub use module::{ForView, InsertPoint, Module, TargetInfo};
pub use operation::{Block, BlockId, OpFlags, OpId, Operation, Use, Value, ValueDef, ValueId};
pub use ops::{ConstValue, ElementwiseOp, InferError, OpKind, ReduceKind};
pub use types::{Dims, ElemType, ScalarType, TensorType, Type};
pub use verify::{verify, VerifyError};
