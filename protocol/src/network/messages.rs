//! Wire messages.
//!
//! Every message travels inside an [`Envelope`]: uid, trade id, sender,
//! the sender's public key and a per-trade sequence number used to order
//! mailbox batches. Acks answer a message by uid and kind.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::NodeAddress;
use crate::config::MESSAGE_VERSION;
use crate::crypto::{PublicKey, Signature};
use crate::dispute::{ChatMessage, Dispute, DisputeResult};
use crate::escrow::ReserveTx;
use crate::offer::{OfferPayload, SignedOffer};
use crate::trade::Contract;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageKind {
    SignOfferRequest,
    SignOfferResponse,
    InitTradeRequest,
    SignContractRequest,
    SignContractResponse,
    DepositRequest,
    DepositResponse,
    DepositsConfirmed,
    PaymentSent,
    PaymentReceived,
    ArbitratorPayoutTxRequest,
    ArbitratorPayoutTxResponse,
    OpenNewDispute,
    PeerOpenedDispute,
    DisputeResult,
    Chat,
    Ack,
}

/// Which subsystem handles a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDomain {
    Offer,
    Trade,
    Dispute,
    Ack,
}

impl MessageKind {
    pub fn domain(self) -> MessageDomain {
        use MessageKind::*;
        match self {
            SignOfferRequest | SignOfferResponse => MessageDomain::Offer,
            InitTradeRequest | SignContractRequest | SignContractResponse | DepositRequest
            | DepositResponse | DepositsConfirmed | PaymentSent | PaymentReceived => {
                MessageDomain::Trade
            }
            ArbitratorPayoutTxRequest | ArbitratorPayoutTxResponse | OpenNewDispute
            | PeerOpenedDispute | DisputeResult | Chat => MessageDomain::Dispute,
            Ack => MessageDomain::Ack,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignOfferRequest {
    pub offer: OfferPayload,
    pub reserve_tx: ReserveTx,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignOfferResponse {
    pub signed_offer: SignedOffer,
}

/// Taker to arbitrator, then arbitrator to maker with its own multisig
/// hex filled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitTradeRequest {
    pub offer: SignedOffer,
    pub trade_amount: u64,
    pub taker_node: NodeAddress,
    pub taker_pub_key: PublicKey,
    pub taker_payout_address: String,
    pub taker_prepared_multisig_hex: String,
    pub taker_reserve_tx: ReserveTx,
    pub arbitrator_prepared_multisig_hex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignContractRequest {
    pub contract: Contract,
    pub maker_signature: Signature,
    pub maker_prepared_multisig_hex: String,
    pub arbitrator_prepared_multisig_hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignContractResponse {
    pub contract_hash: String,
    pub taker_signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRequest {
    pub contract: Contract,
    pub maker_signature: Signature,
    pub taker_signature: Signature,
    pub prepared_multisig_hex: String,
    pub deposit_tx_hash: String,
    pub deposit_tx_hex: String,
    pub deposit_tx_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositResponse {
    pub buyer_deposit: u64,
    pub seller_deposit: u64,
    pub maker_deposit_tx_hash: String,
    pub taker_deposit_tx_hash: String,
}

/// Multisig state exported once deposits confirm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositsConfirmed {
    pub updated_multisig_hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSent {
    pub counter_currency_tx_id: Option<String>,
    /// Payout signed by the buyer.
    pub payout_tx_hex: Option<String>,
    pub updated_multisig_hex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceived {
    /// Payout with both trader signatures, as published.
    pub signed_payout_tx_hex: Option<String>,
    pub payout_published: bool,
    pub updated_multisig_hex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbitratorPayoutTxRequest {
    pub dispute_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbitratorPayoutTxResponse {
    pub dispute_id: String,
    pub updated_multisig_hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenNewDispute {
    pub dispute: Dispute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerOpenedDispute {
    pub dispute: Dispute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeResultMessage {
    pub dispute_id: String,
    pub result: DisputeResult,
    /// Payout signed by the arbitrator. Absent for mediation.
    pub payout_tx_hex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    pub source_uid: String,
    pub source_kind: MessageKind,
    /// Trade or dispute id of the acked message.
    pub source_id: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    SignOfferRequest(SignOfferRequest),
    SignOfferResponse(SignOfferResponse),
    InitTradeRequest(InitTradeRequest),
    SignContractRequest(SignContractRequest),
    SignContractResponse(SignContractResponse),
    DepositRequest(DepositRequest),
    DepositResponse(DepositResponse),
    DepositsConfirmed(DepositsConfirmed),
    PaymentSent(PaymentSent),
    PaymentReceived(PaymentReceived),
    ArbitratorPayoutTxRequest(ArbitratorPayoutTxRequest),
    ArbitratorPayoutTxResponse(ArbitratorPayoutTxResponse),
    OpenNewDispute(OpenNewDispute),
    PeerOpenedDispute(PeerOpenedDispute),
    DisputeResult(DisputeResultMessage),
    Chat(ChatMessage),
    Ack(AckMessage),
}

impl ProtocolMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ProtocolMessage::SignOfferRequest(_) => MessageKind::SignOfferRequest,
            ProtocolMessage::SignOfferResponse(_) => MessageKind::SignOfferResponse,
            ProtocolMessage::InitTradeRequest(_) => MessageKind::InitTradeRequest,
            ProtocolMessage::SignContractRequest(_) => MessageKind::SignContractRequest,
            ProtocolMessage::SignContractResponse(_) => MessageKind::SignContractResponse,
            ProtocolMessage::DepositRequest(_) => MessageKind::DepositRequest,
            ProtocolMessage::DepositResponse(_) => MessageKind::DepositResponse,
            ProtocolMessage::DepositsConfirmed(_) => MessageKind::DepositsConfirmed,
            ProtocolMessage::PaymentSent(_) => MessageKind::PaymentSent,
            ProtocolMessage::PaymentReceived(_) => MessageKind::PaymentReceived,
            ProtocolMessage::ArbitratorPayoutTxRequest(_) => MessageKind::ArbitratorPayoutTxRequest,
            ProtocolMessage::ArbitratorPayoutTxResponse(_) => {
                MessageKind::ArbitratorPayoutTxResponse
            }
            ProtocolMessage::OpenNewDispute(_) => MessageKind::OpenNewDispute,
            ProtocolMessage::PeerOpenedDispute(_) => MessageKind::PeerOpenedDispute,
            ProtocolMessage::DisputeResult(_) => MessageKind::DisputeResult,
            ProtocolMessage::Chat(_) => MessageKind::Chat,
            ProtocolMessage::Ack(_) => MessageKind::Ack,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub uid: String,
    pub trade_id: String,
    pub sender: NodeAddress,
    pub sender_pub_key: PublicKey,
    /// Per trade and sender, starting at 1. Acks carry 0.
    pub sequence: u64,
    pub sent_at_ms: i64,
    pub message: ProtocolMessage,
}

impl Envelope {
    pub fn new(
        trade_id: impl Into<String>,
        sender: NodeAddress,
        sender_pub_key: PublicKey,
        sequence: u64,
        message: ProtocolMessage,
    ) -> Self {
        Self {
            version: MESSAGE_VERSION,
            uid: uuid::Uuid::new_v4().to_string(),
            trade_id: trade_id.into(),
            sender,
            sender_pub_key,
            sequence,
            sent_at_ms: chrono::Utc::now().timestamp_millis(),
            message,
        }
    }

    /// Same envelope with a caller-chosen uid (chat messages reuse theirs).
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Builds the ack answering this envelope.
    pub fn ack(
        &self,
        sender: NodeAddress,
        sender_pub_key: PublicKey,
        success: bool,
        error: Option<String>,
    ) -> Envelope {
        Envelope::new(
            self.trade_id.clone(),
            sender,
            sender_pub_key,
            0,
            ProtocolMessage::Ack(AckMessage {
                source_uid: self.uid.clone(),
                source_kind: self.kind(),
                source_id: self.trade_id.clone(),
                success,
                error,
            }),
        )
    }
}
