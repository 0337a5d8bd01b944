//! Core types, matching algorithms and trait definitions for wavelink.
//!
//! This crate is deliberately free of database dependencies. The persistence
//! and review-queue seams are traits ([`store::MergeStore`],
//! [`review::ReviewQueue`]) implemented by backends such as
//! `wavelink-store-sqlite`.

// Native `async fn` in traits; the `Send` advisory lint does not apply to the
// single-threaded merge loop.
#![allow(async_fn_in_trait)]

pub mod config;
pub mod country;
pub mod engine;
pub mod error;
pub mod event;
pub mod identity;
pub mod matcher;
pub mod model;
pub mod normalize;
pub mod review;
pub mod score;
pub mod store;

pub use error::{Error, Result};
