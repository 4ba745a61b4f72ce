//! monolayer CLI - flatten a `docker save` export into one layer.

pub mod commands;
pub mod output;
