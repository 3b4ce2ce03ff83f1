//! Wire-facing data transfer objects and boundary validation.

pub mod game;
pub mod health;
pub mod validation;
pub mod ws;
