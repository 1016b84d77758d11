pub mod cache;
pub mod cli;
pub mod controllers;
pub mod events;
pub mod hook;
pub mod httputils;
pub mod kubeapi;
pub mod registry;

pub use anyhow::Result;
