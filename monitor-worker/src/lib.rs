pub mod config;
pub mod error;
pub mod handlers;
pub mod signals;
pub mod supervisor;
pub mod worker;

#[cfg(test)]
mod test_utils;
