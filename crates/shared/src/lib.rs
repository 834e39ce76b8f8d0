//! Wire and domain types shared by the dashboard store and its front ends.

pub mod domain;
pub mod error;
pub mod protocol;
