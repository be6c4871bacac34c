//! Embedded JavaScript (Boa) used by `register_remote_function`.

pub mod conversions;
pub mod limits;
pub mod script;

pub use limits::ResourceLimits;
pub use script::{ScriptEnv, ScriptFunction};
