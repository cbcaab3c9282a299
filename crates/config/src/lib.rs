//! Config Assembler: option validation, cross-worker derived state, and the
//! runtime config wire encoder (spec §4.7, §6).

pub mod assemble;
pub mod validate;
pub mod wire;

pub use assemble::{assemble, from_workers, AssembledConfig};
pub use validate::{validate_compatibility_date, validate_worker};
pub use wire::ConfigWriter;
