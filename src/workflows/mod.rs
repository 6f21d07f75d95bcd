pub mod claims;
pub mod delivery;
pub mod engine;
pub mod identify;
pub mod matcher;
pub mod planner;
pub mod prompt;
pub mod renamer;
pub mod retry;
pub mod selector;

#[cfg(test)]
pub(crate) mod testing;
