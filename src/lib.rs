#![deny(unused_variables)]
#![deny(clippy::no_effect_underscore_binding)]

#[path = "../shared/lib.rs"]
pub mod shared;

#[path = "../estimate/mod.rs"]
pub mod estimate;

#[path = "../strategies/mod.rs"]
pub mod strategies;
