//! # strand-core
//!
//! Device matrices, execution contexts and the gradient connector protocol
//! for strand.
//!
//! This crate provides:
//! - [`Matrix`]: 2-d column-major handle onto device memory, owning or view
//! - [`Layout`] / [`SliceSpec`]: view geometry and slice arguments
//! - [`DType`]: element types (`"float"`, `"int"`)
//! - [`Context`]: device + stream + BLAS handle that orders device work
//! - [`Backend`] trait: the fixed kernel/BLAS set a device has to provide
//! - [`Connector`] / [`GradSink`]: forward values and their gradient fan-in
//! - [`HostArray`]: host-side data for upload and download
// - DType: element types
// - Layout: offset + leading dimension of a view
// - Backend trait: device, stream, storage and kernels (CPU, CUDA)
// - Matrix: the device matrix
// - Connector: producer/consumer edges for fprop/bprop

pub mod backend;
pub mod connector;
pub mod context;
pub mod dtype;
pub mod error;
pub mod host;
pub mod layout;
pub mod matrix;

pub use backend::{
    Activation, Axis, Backend, BackendDevice, BackendStorage, BackendStream, MatOp, MatRef,
};
pub use connector::{Connector, GradSink};
pub use context::Context;
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use host::{HostArray, HostData, HostElement};
pub use layout::{Layout, SliceSpec};
pub use matrix::Matrix;
