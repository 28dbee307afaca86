//! Stream combinators for per-session delivery

mod decimate;

pub use decimate::{Decimate, DecimateExt, Pacer, Timestamped};
