//! # Protocol Configuration & Constants
//!
//! Every magic number in the settlement core lives here. Wire identifiers,
//! money units, fee schedules and the timing budgets that decide when a
//! stubborn peer stops being waited on.
//!
//! Constants are compile-time facts. [`ProtocolConfig`] holds the knobs an
//! operator may legitimately tune per deployment; its `Default` is what
//! devnet and the test-suite run with.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Wire Format
// ---------------------------------------------------------------------------

/// Magic bytes at the start of every encoded envelope. Anything that does
/// not start with these is not ours and is dropped before deserialization.
pub const PROTOCOL_MAGIC: u32 = 0x584D_5258; // "XMRX"

/// Current envelope version. Bumped on any incompatible change to the
/// message enum.
pub const MESSAGE_VERSION: u32 = 1;

/// Oldest envelope version this build still decodes.
pub const MIN_SUPPORTED_MESSAGE_VERSION: u32 = 1;

/// Hard cap on an encoded envelope. Payout hex for a 2-of-3 multisig
/// transaction is a few tens of KiB; 1 MiB leaves headroom for chat
/// attachments without letting a peer make us allocate gigabytes.
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// The crate version, surfaced by the node's `/status` endpoint.
pub const PROTOCOL_VERSION: &str = "0.1.0";

// ---------------------------------------------------------------------------
// Money
// ---------------------------------------------------------------------------

/// Piconero per XMR. Every amount in the protocol is a `u64` of these.
pub const ATOMIC_UNITS_PER_XMR: u64 = 1_000_000_000_000;

/// Basis-point denominator for fee and deposit percentages.
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Default maker fee: 0.15% of the trade amount.
pub const DEFAULT_MAKER_FEE_BPS: u32 = 15;

/// Default taker fee: 0.75% of the trade amount.
pub const DEFAULT_TAKER_FEE_BPS: u32 = 75;

/// Default security deposit for each trader: 15% of the trade amount.
pub const DEFAULT_SECURITY_DEPOSIT_BPS: u32 = 1_500;

/// Floor for a security deposit, so tiny trades still put something at
/// stake: 0.1 XMR.
pub const MIN_SECURITY_DEPOSIT: u64 = ATOMIC_UNITS_PER_XMR / 10;

/// Headroom on top of deposit and trade fee when selecting outputs for a
/// reservation, so the later deposit transaction can pay its network fee.
pub const NETWORK_FEE_ALLOWANCE: u64 = ATOMIC_UNITS_PER_XMR / 1_000;

/// Number of participants in the escrow wallet and the signatures needed to
/// spend from it.
pub const MULTISIG_PARTICIPANTS: usize = 3;
pub const MULTISIG_THRESHOLD: usize = 2;

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Time budget for one outbound protocol step (send + delivery outcome).
pub const DEFAULT_STEP_TIME_LIMIT: Duration = Duration::from_secs(120);

/// How often actors re-examine deferred messages, failed sends and
/// confirmations.
pub const DEFAULT_REDELIVERY_INTERVAL: Duration = Duration::from_secs(2);

/// Deferred messages older than this are discarded.
pub const DEFAULT_MAX_DEFERRED_AGE: Duration = Duration::from_secs(600);

/// Fixed delay between attempts to deliver an `OpenNewDispute` message.
pub const DEFAULT_DISPUTE_OPEN_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Coalescing window of the checkpoint writer.
pub const DEFAULT_CHECKPOINT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Confirmations after which deposit outputs are spendable. Monero locks
/// received outputs for 10 blocks.
pub const DEPOSIT_UNLOCK_CONFIRMATIONS: u64 = 10;

// ---------------------------------------------------------------------------
// Runtime configuration
// ---------------------------------------------------------------------------

/// Tunable protocol parameters.
///
/// Durations are stored as milliseconds so the struct round-trips through
/// JSON config files without a custom serde adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Budget for a single outbound step before it resolves to a send failure.
    pub step_time_limit_ms: u64,
    /// Actor tick: deferred retries, resends, confirmation polling.
    pub redelivery_interval_ms: u64,
    /// Maximum redelivery attempts for one deferred message.
    pub max_deferred_attempts: u32,
    /// Maximum age of a deferred message.
    pub max_deferred_age_ms: u64,
    /// Capacity of each deferred queue.
    pub max_deferred_messages: usize,
    /// Fixed delay between dispute-open attempts.
    pub dispute_open_retry_delay_ms: u64,
    /// Attempts before giving up on opening a dispute.
    pub dispute_open_max_attempts: u32,
    /// Checkpoint coalescing window.
    pub checkpoint_flush_interval_ms: u64,
    /// Confirmations that unlock the deposit outputs.
    pub unlock_confirmations: u64,
    /// How many times a failed payment message is re-sent on the tick.
    pub max_message_resends: u32,
    /// Destination of maker and taker fees.
    pub trade_fee_address: String,
    pub maker_fee_bps: u32,
    pub taker_fee_bps: u32,
    pub security_deposit_bps: u32,
    pub min_security_deposit: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            step_time_limit_ms: DEFAULT_STEP_TIME_LIMIT.as_millis() as u64,
            redelivery_interval_ms: DEFAULT_REDELIVERY_INTERVAL.as_millis() as u64,
            max_deferred_attempts: 30,
            max_deferred_age_ms: DEFAULT_MAX_DEFERRED_AGE.as_millis() as u64,
            max_deferred_messages: 64,
            dispute_open_retry_delay_ms: DEFAULT_DISPUTE_OPEN_RETRY_DELAY.as_millis() as u64,
            dispute_open_max_attempts: 5,
            checkpoint_flush_interval_ms: DEFAULT_CHECKPOINT_FLUSH_INTERVAL.as_millis() as u64,
            unlock_confirmations: DEPOSIT_UNLOCK_CONFIRMATIONS,
            max_message_resends: 3,
            trade_fee_address: "xmrx-fee-vault".to_string(),
            maker_fee_bps: DEFAULT_MAKER_FEE_BPS,
            taker_fee_bps: DEFAULT_TAKER_FEE_BPS,
            security_deposit_bps: DEFAULT_SECURITY_DEPOSIT_BPS,
            min_security_deposit: MIN_SECURITY_DEPOSIT,
        }
    }
}

impl ProtocolConfig {
    pub fn step_time_limit(&self) -> Duration {
        Duration::from_millis(self.step_time_limit_ms)
    }

    pub fn redelivery_interval(&self) -> Duration {
        Duration::from_millis(self.redelivery_interval_ms)
    }

    pub fn max_deferred_age(&self) -> Duration {
        Duration::from_millis(self.max_deferred_age_ms)
    }

    pub fn dispute_open_retry_delay(&self) -> Duration {
        Duration::from_millis(self.dispute_open_retry_delay_ms)
    }

    pub fn checkpoint_flush_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_flush_interval_ms)
    }

    /// Config tuned for tests: short ticks and budgets so timing paths run
    /// in milliseconds instead of minutes.
    pub fn fast() -> Self {
        Self {
            step_time_limit_ms: 2_000,
            redelivery_interval_ms: 20,
            max_deferred_age_ms: 5_000,
            dispute_open_retry_delay_ms: 20,
            checkpoint_flush_interval_ms: 10,
            unlock_confirmations: 2,
            ..Self::default()
        }
    }
}

/// Formats an atomic amount as XMR with 12 decimals, for logs and the API.
pub fn format_xmr(atomic: u64) -> String {
    format!(
        "{}.{:012}",
        atomic / ATOMIC_UNITS_PER_XMR,
        atomic % ATOMIC_UNITS_PER_XMR
    )
}

/// Converts whole XMR to atomic units. Returns `None` on overflow.
pub fn xmr(whole: u64) -> Option<u64> {
    whole.checked_mul(ATOMIC_UNITS_PER_XMR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_magic_is_valid_ascii() {
        let bytes = PROTOCOL_MAGIC.to_be_bytes();
        assert!(bytes.iter().all(|b| b.is_ascii_alphanumeric()));
        assert_eq!(&bytes, b"XMRX");
    }

    #[test]
    fn test_message_version_window() {
        assert!(MIN_SUPPORTED_MESSAGE_VERSION <= MESSAGE_VERSION);
    }

    #[test]
    fn test_multisig_threshold_sanity() {
        // 2-of-3: no single party can move the escrow, any two can.
        assert!(MULTISIG_THRESHOLD > MULTISIG_PARTICIPANTS / 2);
        assert!(MULTISIG_THRESHOLD < MULTISIG_PARTICIPANTS);
    }

    #[test]
    fn test_default_config_durations() {
        let cfg = ProtocolConfig::default();
        assert_eq!(cfg.step_time_limit(), DEFAULT_STEP_TIME_LIMIT);
        assert!(cfg.redelivery_interval() < cfg.step_time_limit());
        assert!(cfg.max_deferred_attempts > 0);
        assert!(cfg.dispute_open_max_attempts > 0);
    }

    #[test]
    fn test_config_json_roundtrip_with_partial_input() {
        // Missing fields fall back to defaults.
        let cfg: ProtocolConfig =
            serde_json::from_str(r#"{"max_message_resends": 7}"#).unwrap();
        assert_eq!(cfg.max_message_resends, 7);
        assert_eq!(cfg.taker_fee_bps, DEFAULT_TAKER_FEE_BPS);
    }

    #[test]
    fn test_format_xmr() {
        assert_eq!(format_xmr(0), "0.000000000000");
        assert_eq!(format_xmr(13_999_900_000_000), "13.999900000000");
        assert_eq!(format_xmr(1), "0.000000000001");
    }

    #[test]
    fn test_xmr_conversion_overflow() {
        assert_eq!(xmr(10), Some(10 * ATOMIC_UNITS_PER_XMR));
        assert_eq!(xmr(u64::MAX), None);
    }
}
