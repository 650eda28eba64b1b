pub mod alert;
pub mod block;
pub mod channel;
pub mod collector;
pub mod node;
pub mod stats;
pub mod supervisor;
pub mod tasks;
pub mod types;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;
