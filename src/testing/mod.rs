//! Testing utilities and mock implementations
//!
//! This module provides a scripted session and a manual clock for exercising
//! the connection engine without a broker or real time passing.

pub mod mocks;

pub use mocks::*;
