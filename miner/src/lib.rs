//! Ember: a ProgPoW/Ethash GPU pool miner.
//!
//! Crate layout follows the data path: [`stratum`] talks to the pool,
//! [`farm`] fans work out and collects results, [`miner`] drives the
//! devices, [`work`] is the currency they trade in.

pub mod api;
pub mod config;
pub mod farm;
pub mod miner;
pub mod stratum;
pub mod work;
