//! Direct3D 9 interception: the replacement factory entry points and the
//! device-creation override installed on every factory they hand out.

pub mod device;
pub mod exports;
pub mod factory;
pub mod ffi;

pub use factory::{CreationPath, FactoryPolicy};
