//! aawgd - Wireless Android Auto gateway
//!
//! This crate provides the core functionality for aawgd, a daemon that
//! presents itself to a car head unit as a wired Android Auto accessory over
//! USB and relays that link to a phone connected over Wi-Fi.

pub mod auth;
pub mod bluetooth;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod otg;
pub mod proxy;
pub mod state;
pub mod utils;
pub mod web;

pub use error::{AppError, Result};
