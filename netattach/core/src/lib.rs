#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod error;
pub mod netns;
pub mod scheduler;

pub use self::error::{Error, ErrorSink};
