use boa_engine::Context;
use dccrpc_common::protocol::error::{Result, RpcError};

/// Execution limits applied to every script context.
///
/// Boa has no wall-clock or memory limit; a runaway loop is stopped by the
/// iteration limit instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Iterations allowed per loop before it throws.
    pub loop_iteration_limit: u64,
    /// Maximum call depth.
    pub recursion_limit: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            loop_iteration_limit: 100_000_000,
            recursion_limit: 400,
        }
    }
}

impl ResourceLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loop_iteration_limit(mut self, limit: u64) -> Self {
        self.loop_iteration_limit = limit;
        self
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.loop_iteration_limit == 0 {
            return Err(RpcError::Config("loop iteration limit must be greater than zero".into()));
        }
        if self.recursion_limit == 0 {
            return Err(RpcError::Config("recursion limit must be greater than zero".into()));
        }
        Ok(())
    }

    pub(crate) fn apply(&self, ctx: &mut Context) {
        let limits = ctx.runtime_limits_mut();
        limits.set_loop_iteration_limit(self.loop_iteration_limit);
        limits.set_recursion_limit(self.recursion_limit);
    }
}
