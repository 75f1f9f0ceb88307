pub mod executor;
pub mod state_store;
