//! Raw bindings to `libpowmosm75`, the CGBN based modular exponentiation library.
//!
//! Nothing here is safe to call directly: the `gpumaths` crate wraps these symbols behind its
//! `NativeBackend` trait.
pub mod cuda_bind;
