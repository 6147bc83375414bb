//! DipBot Library
//!
//! Decision engine for a buy-the-capitulation dip-buying equity strategy

pub mod config;
pub mod engine;
pub mod ledger;
pub mod matrix;
pub mod persistence;
pub mod risk;
pub mod support;
pub mod tracker;
pub mod types;
