//! Route modules for Ferry Server

pub mod download;
pub mod health;
pub mod upload;
