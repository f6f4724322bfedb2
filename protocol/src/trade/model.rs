//! The per-trade record.
//!
//! A [`Trade`] is owned by exactly one trade actor. Everyone else sees
//! cloned snapshots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::contract::Contract;
use super::state::{
    can_transition, DisputeState, MediationResultState, PayoutState, TradeState, TransitionError,
};
use super::TradeError;
use crate::crypto::{PublicKey, Signature};
use crate::escrow::{DepositAmounts, EscrowError, PayoutTerms, ReserveTx};
use crate::network::{DeliveryOutcome, Envelope, MessageKind, NodeAddress};
use crate::offer::{SignedOffer, TradeAmounts};
use crate::pipeline::TaskError;

/// Which seat a node occupies in a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Maker,
    Taker,
    Arbitrator,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Maker => "maker",
            Role::Taker => "taker",
            Role::Arbitrator => "arbitrator",
        })
    }
}

/// Buyer or seller of XMR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buyer,
    Seller,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buyer => Side::Seller,
            Side::Seller => Side::Buyer,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Buyer => "buyer",
            Side::Seller => "seller",
        })
    }
}

/// What we know about one party of the trade (ourselves included).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradePeer {
    pub node: Option<NodeAddress>,
    pub pub_key: Option<PublicKey>,
    pub payout_address: Option<String>,
    /// Unsigned, partially signed or fully signed, depending on progress.
    pub payout_tx_hex: Option<String>,
    pub prepared_multisig_hex: Option<String>,
    pub updated_multisig_hex: Option<String>,
    pub reserve_tx: Option<ReserveTx>,
    pub deposit_tx_hash: Option<String>,
    pub deposit_tx_hex: Option<String>,
    pub deposit_tx_key: Option<String>,
    pub contract_signature: Option<Signature>,
}

impl TradePeer {
    pub fn identified(node: NodeAddress, pub_key: PublicKey) -> Self {
        Self {
            node: Some(node),
            pub_key: Some(pub_key),
            ..Self::default()
        }
    }
}

/// Result of the peer's ack, if one arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckStatus {
    pub success: bool,
    pub error: Option<String>,
}

/// One message we sent, with what became of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRecord {
    pub uid: String,
    pub kind: MessageKind,
    pub to: Role,
    pub outcome: DeliveryOutcome,
    pub ack: Option<AckStatus>,
    pub sent_at_ms: i64,
}

impl OutboundRecord {
    pub fn new(envelope: &Envelope, to: Role, outcome: DeliveryOutcome) -> Self {
        Self {
            uid: envelope.uid.clone(),
            kind: envelope.message.kind(),
            to,
            outcome,
            ack: None,
            sent_at_ms: envelope.sent_at_ms,
        }
    }
}

const MAX_OUTBOUND_RECORDS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub role: Role,
    pub offer: SignedOffer,
    pub amounts: TradeAmounts,
    pub state: TradeState,
    /// Last good state, set while `state` is a failure state.
    pub failed_from: Option<TradeState>,
    pub dispute_state: DisputeState,
    pub mediation_result_state: MediationResultState,
    pub payout_state: PayoutState,
    pub maker: TradePeer,
    pub taker: TradePeer,
    pub arbitrator: TradePeer,
    pub contract: Option<Contract>,
    pub contract_locked: bool,
    pub multisig_address: Option<String>,
    pub deposits: DepositAmounts,
    pub payout_tx_hash: Option<String>,
    pub processed_uids: BTreeSet<String>,
    pub outbound: Vec<OutboundRecord>,
    pub next_sequence: u64,
    pub resend_count: u32,
    pub error_message: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Trade {
    pub fn new(role: Role, offer: SignedOffer, amounts: TradeAmounts) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let maker = TradePeer::identified(offer.payload.maker_node.clone(), offer.payload.maker_pub_key);
        let arbitrator = TradePeer::identified(
            offer.payload.arbitrator_node.clone(),
            offer.payload.arbitrator_pub_key,
        );
        Self {
            id: offer.payload.id.clone(),
            role,
            offer,
            amounts,
            state: TradeState::Preparation,
            failed_from: None,
            dispute_state: DisputeState::NoDispute,
            mediation_result_state: MediationResultState::NoResult,
            payout_state: PayoutState::Unpublished,
            maker,
            taker: TradePeer::default(),
            arbitrator,
            contract: None,
            contract_locked: false,
            multisig_address: None,
            deposits: DepositAmounts::default(),
            payout_tx_hash: None,
            processed_uids: BTreeSet::new(),
            outbound: Vec::new(),
            next_sequence: 1,
            resend_count: 0,
            error_message: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    /// Our side, `None` for the arbitrator.
    pub fn side(&self) -> Option<Side> {
        let maker_side = self.offer.payload.maker_side();
        match self.role {
            Role::Maker => Some(maker_side),
            Role::Taker => Some(maker_side.opposite()),
            Role::Arbitrator => None,
        }
    }

    pub fn role_of(&self, side: Side) -> Role {
        if self.offer.payload.maker_side() == side {
            Role::Maker
        } else {
            Role::Taker
        }
    }

    pub fn side_of(&self, role: Role) -> Option<Side> {
        let maker_side = self.offer.payload.maker_side();
        match role {
            Role::Maker => Some(maker_side),
            Role::Taker => Some(maker_side.opposite()),
            Role::Arbitrator => None,
        }
    }

    pub fn peer(&self, role: Role) -> &TradePeer {
        match role {
            Role::Maker => &self.maker,
            Role::Taker => &self.taker,
            Role::Arbitrator => &self.arbitrator,
        }
    }

    pub fn peer_mut(&mut self, role: Role) -> &mut TradePeer {
        match role {
            Role::Maker => &mut self.maker,
            Role::Taker => &mut self.taker,
            Role::Arbitrator => &mut self.arbitrator,
        }
    }

    pub fn me(&self) -> &TradePeer {
        self.peer(self.role)
    }

    pub fn me_mut(&mut self) -> &mut TradePeer {
        self.peer_mut(self.role)
    }

    pub fn buyer(&self) -> &TradePeer {
        self.peer(self.role_of(Side::Buyer))
    }

    pub fn seller(&self) -> &TradePeer {
        self.peer(self.role_of(Side::Seller))
    }

    /// The trading counterparty, `None` for the arbitrator.
    pub fn counterparty_role(&self) -> Option<Role> {
        match self.role {
            Role::Maker => Some(Role::Taker),
            Role::Taker => Some(Role::Maker),
            Role::Arbitrator => None,
        }
    }

    /// The two roles that are not us.
    pub fn other_roles(&self) -> [Role; 2] {
        match self.role {
            Role::Maker => [Role::Taker, Role::Arbitrator],
            Role::Taker => [Role::Maker, Role::Arbitrator],
            Role::Arbitrator => [Role::Maker, Role::Taker],
        }
    }

    /// Which peer sits at `node`.
    pub fn role_at(&self, node: &NodeAddress) -> Option<Role> {
        [Role::Maker, Role::Taker, Role::Arbitrator]
            .into_iter()
            .find(|role| self.peer(*role).node.as_ref() == Some(node))
    }

    /// The state messages and actions are judged against.
    pub fn effective_state(&self) -> TradeState {
        if self.state.is_failure() {
            self.failed_from.unwrap_or(TradeState::Preparation)
        } else {
            self.state
        }
    }

    /// Moves to `to` if the transition table allows it. Returns whether the
    /// state actually changed.
    pub fn advance(&mut self, to: TradeState) -> Result<bool, TransitionError> {
        can_transition(self.state, to)?;
        if self.state == to {
            return Ok(false);
        }
        if !to.is_failure() {
            self.failed_from = None;
        }
        self.state = to;
        self.touch();
        Ok(true)
    }

    /// Moves forward to `to` unless the trade is already past it.
    pub fn advance_at_least(&mut self, to: TradeState) -> Result<bool, TransitionError> {
        if !self.state.is_failure() && self.state >= to {
            return Ok(false);
        }
        self.advance(to)
    }

    /// Stores `"<task>: <error>"` and drops into the phase's failure state.
    pub fn record_failure(&mut self, task: &str, error: &TaskError) {
        self.error_message = Some(format!("{task}: {error}"));
        if self.state.is_failure() || self.state.is_closed() {
            return;
        }
        let last_good = self.state;
        if self.advance(last_good.failure_state()).is_ok() {
            self.failed_from = Some(last_good);
        }
    }

    pub fn is_open(&self) -> bool {
        !self.state.is_closed()
    }

    pub fn touch(&mut self) {
        self.updated_at_ms = chrono::Utc::now().timestamp_millis();
    }

    pub fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    pub fn is_processed(&self, uid: &str) -> bool {
        self.processed_uids.contains(uid)
    }

    pub fn mark_processed(&mut self, uid: &str) {
        self.processed_uids.insert(uid.to_string());
    }

    pub fn record_outbound(&mut self, record: OutboundRecord) {
        if self.outbound.len() == MAX_OUTBOUND_RECORDS {
            self.outbound.remove(0);
        }
        self.outbound.push(record);
    }

    /// Attaches an ack to the outbound record it answers.
    pub fn record_ack(&mut self, source_uid: &str, success: bool, error: Option<String>) -> Option<&OutboundRecord> {
        let record = self.outbound.iter_mut().find(|r| r.uid == source_uid)?;
        record.ack = Some(AckStatus { success, error });
        Some(record)
    }

    pub fn contract(&self) -> Result<&Contract, TradeError> {
        self.contract
            .as_ref()
            .ok_or_else(|| TradeError::NoContract(self.id.clone()))
    }

    /// Installs the contract. Refuses to replace a locked one.
    pub fn set_contract(&mut self, contract: Contract) -> Result<(), TradeError> {
        if self.contract_locked && self.contract.as_ref() != Some(&contract) {
            return Err(TradeError::ContractLocked(self.id.clone()));
        }
        self.contract = Some(contract);
        Ok(())
    }

    /// Locks the contract once both trader signatures verify against it.
    pub fn lock_contract(&mut self) -> Result<(), TaskError> {
        let contract = self
            .contract
            .as_ref()
            .ok_or_else(|| TaskError::Precondition("no contract to lock".into()))?;
        for role in [Role::Maker, Role::Taker] {
            let peer = self.peer(role);
            let (Some(pub_key), Some(signature)) = (&peer.pub_key, &peer.contract_signature) else {
                return Err(TaskError::Precondition(format!("{role} has not signed the contract")));
            };
            if !contract.verify_signature(pub_key, signature) {
                return Err(TaskError::Verification(format!("{role} contract signature")));
            }
        }
        self.contract_locked = true;
        Ok(())
    }

    pub fn payout_terms(&self) -> Result<PayoutTerms, TaskError> {
        let contract = self
            .contract
            .as_ref()
            .ok_or_else(|| TaskError::Precondition("no contract".into()))?;
        contract
            .payout_terms(&self.deposits)
            .map_err(TaskError::from)
    }

    /// Multisig address, or the error a task should fail with.
    pub fn multisig(&self) -> Result<&str, EscrowError> {
        self.multisig_address
            .as_deref()
            .ok_or(EscrowError::Arithmetic("multisig address unknown"))
    }

    /// Whether we have imported multisig state from at least one peer.
    pub fn has_peer_multisig_state(&self) -> bool {
        self.other_roles()
            .iter()
            .any(|role| self.peer(*role).updated_multisig_hex.is_some())
    }
}
