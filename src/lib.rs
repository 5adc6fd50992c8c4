//! Storefront coupon engine
//!
//! Prices orders under promotional coupons, keeps coupon usage counters
//! consistent under concurrent redemption, and recommends the coupons that
//! apply to a cart.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod repositories;
pub mod services;

pub use errors::ServiceError;
pub use services::discount::compute_final_total;
