//! Cross-module scenario tests for the facade and the consistency layer.

#[cfg(test)]
pub mod fault;

#[cfg(test)]
mod consistency_tests;
#[cfg(test)]
mod scenario_tests;
