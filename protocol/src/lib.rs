// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # XMRX Protocol: Settlement Core
//!
//! Non-custodial peer-to-peer Monero trading between a maker, a taker and
//! an arbitrator. Nobody holds anyone's coins: both traders lock a
//! security deposit (the seller also locks the trade amount) in a 2-of-3
//! multisig wallet, and the payout needs two signatures to move.
//!
//! ## Architecture
//!
//! - **pipeline**: ordered, rollback-on-failure task execution.
//! - **trade**: the per-trade state machine and the actor that drives it.
//! - **escrow**: reserve, deposit and payout transaction checks.
//! - **dispute**: opening, mediating and paying out disputes.
//! - **offer**: offer placement and arbitrator signing.
//! - **wallet**: the multisig wallet seam, plus a simulated chain.
//! - **network**: envelopes, acks, mailbox ordering, an in-memory transport.
//! - **storage**: coalesced checkpoints over sled.
//! - **runtime**: wires all of the above for one node.
//! - **config**: protocol constants and tunables.
//!
//! ## Ground Rules
//!
//! 1. Amounts are atomic units in `u64`. Every sum is checked.
//! 2. A trade's state only moves forward.
//! 3. Nothing is signed that was not verified first. A payout that does
//!    not match the contract is never co-signed.
//! 4. No step ever waits on the network without a time limit.

pub mod config;
pub mod crypto;
pub mod dispute;
pub mod escrow;
pub mod network;
pub mod offer;
pub mod pipeline;
pub mod runtime;
pub mod services;
pub mod storage;
pub mod trade;
pub mod wallet;

pub use runtime::Runtime;
