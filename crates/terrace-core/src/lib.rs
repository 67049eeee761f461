pub mod app;
pub mod bootstrap;
pub mod env;
pub mod error;
pub mod graph;
pub mod io;
pub mod manager;
pub mod namespace;
pub mod paths;
pub mod ports;
pub mod store;
pub mod tasks;

pub use error::{Result, TerraceError};
