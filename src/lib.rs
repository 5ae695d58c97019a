#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::unnecessary_literal_bound,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod app;
pub mod audit;
pub mod authority;
pub mod buses;
pub mod cli;
pub mod config;
pub mod conscience;
pub mod dma;
pub mod error;
pub mod handlers;
pub mod observability;
pub mod persistence;
pub mod processors;
pub mod runtime;
pub mod scheduler;
pub mod schemas;
pub mod secrets;

pub use config::Config;
pub use error::{CirisError, Result};
pub use runtime::CirisRuntime;
