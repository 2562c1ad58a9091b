pub mod bridge;
pub mod config;
pub mod device;
pub mod error;
pub mod mqtt;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;
