//! Built-in tool implementations for Anjia.
//!
//! Tools give the advisor agent access to home-purchase data: the
//! applicable Beijing policy for a district and buyer, and a cost
//! breakdown for a given price and loan.

pub mod cost_calculator;
pub mod policy_lookup;
pub mod rates;

use std::sync::Arc;
use std::time::Duration;

use anjia_core::tool::ToolRegistry;

pub use cost_calculator::CostCalculatorTool;
pub use policy_lookup::PolicyLookupTool;

/// Create a tool registry with all built-in tools and the given per-call
/// timeout.
pub fn default_registry(timeout: Duration) -> ToolRegistry {
    let mut registry = ToolRegistry::new().with_timeout(timeout);
    registry.register(Arc::new(PolicyLookupTool));
    registry.register(Arc::new(CostCalculatorTool));
    registry
}
