#![allow(async_fn_in_trait)]
pub mod cli;
pub mod download;
pub mod error;
pub mod extract;
pub mod geometry;
pub mod query;
pub mod search;

pub use error::{Error, Result};
