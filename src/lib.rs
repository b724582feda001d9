pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod live;
pub mod net;
pub mod pipeline;
pub mod resources;
pub mod scheduler;
pub mod session;

#[cfg(test)]
mod test_support;
