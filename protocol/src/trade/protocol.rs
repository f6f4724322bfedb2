//! Which steps run for which trigger.
//!
//! Everything that moves a trade is a [`Trigger`]: the start of a take, an
//! accepted inbound message, a user confirmation, the redelivery tick, or
//! a chain event seen by the lifecycle poller. [`tasks_for`] maps a
//! trigger, given the trade's role and side, to the ordered step list the
//! pipeline runs. An empty list means the trigger does nothing here.

use std::fmt;

use super::model::{Role, Side, Trade};
use super::state::TradeState;
use super::tasks::TradeTask;
use crate::network::MessageKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The taker starts a trade.
    Start,
    Inbound(MessageKind),
    /// The buyer says the counter-currency payment went out.
    PaymentSentConfirmed,
    /// The seller says the counter-currency payment arrived.
    PaymentReceiptConfirmed,
    /// The redelivery tick found the trade in a send-failed state.
    Resend(TradeState),
    DepositsConfirmed,
    DepositsUnlocked,
    PayoutConfirmed,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Start => f.write_str("start"),
            Trigger::Inbound(kind) => write!(f, "inbound {kind}"),
            Trigger::PaymentSentConfirmed => f.write_str("payment sent confirmed"),
            Trigger::PaymentReceiptConfirmed => f.write_str("payment receipt confirmed"),
            Trigger::Resend(state) => write!(f, "resend from {state}"),
            Trigger::DepositsConfirmed => f.write_str("deposits confirmed"),
            Trigger::DepositsUnlocked => f.write_str("deposits unlocked"),
            Trigger::PayoutConfirmed => f.write_str("payout confirmed"),
        }
    }
}

pub fn tasks_for(trade: &Trade, trigger: &Trigger) -> Vec<TradeTask> {
    use TradeTask::*;

    let role = trade.role;
    let side = trade.side();
    let counterparty = trade.counterparty_role();

    match (*trigger, role) {
        (Trigger::Start, Role::Taker) => vec![TakerReserveTradeFunds, TakerSendInitTradeRequest],

        (Trigger::Inbound(kind), _) => inbound_tasks(kind, role, side),

        (Trigger::PaymentSentConfirmed, _) => match (side, counterparty) {
            (Some(Side::Buyer), Some(to)) => vec![
                BuyerPreparePaymentSent,
                BuyerSendPaymentSentMessage { to },
                BuyerSendPaymentSentMessage { to: Role::Arbitrator },
            ],
            _ => Vec::new(),
        },

        (Trigger::PaymentReceiptConfirmed, _) => match (side, counterparty) {
            (Some(Side::Seller), Some(to)) => vec![
                SellerSignAndPublishPayoutTx,
                SellerSendPaymentReceivedMessage { to },
                SellerSendPaymentReceivedMessage { to: Role::Arbitrator },
            ],
            _ => Vec::new(),
        },

        (Trigger::Resend(state), _) => match (state, counterparty) {
            (TradeState::DepositRequestSendFailed, Some(_)) => vec![TraderSendDepositRequest],
            (TradeState::BuyerSendFailedPaymentSentMsg, Some(to)) => {
                vec![BuyerSendPaymentSentMessage { to }]
            }
            (TradeState::SellerSendFailedPaymentReceivedMsg, Some(to)) => {
                vec![SellerSendPaymentReceivedMessage { to }]
            }
            _ => Vec::new(),
        },

        (Trigger::DepositsConfirmed, _) => {
            let mut tasks = vec![MarkDepositsConfirmed];
            tasks.extend(
                trade
                    .other_roles()
                    .into_iter()
                    .map(|to| SendDepositsConfirmed { to }),
            );
            tasks
        }

        (Trigger::DepositsUnlocked, _) => vec![MarkDepositsUnlocked],
        (Trigger::PayoutConfirmed, _) => vec![MarkPayoutConfirmed],

        _ => Vec::new(),
    }
}

fn inbound_tasks(kind: MessageKind, role: Role, side: Option<Side>) -> Vec<TradeTask> {
    use TradeTask::*;

    match (kind, role) {
        (MessageKind::InitTradeRequest, Role::Arbitrator) => vec![
            ArbitratorProcessInitTradeRequest,
            ArbitratorSendInitTradeRequestToMaker,
        ],
        (MessageKind::InitTradeRequest, Role::Maker) => vec![
            MakerProcessInitTradeRequest,
            MakerCreateAndSignContract,
            MakerSendSignContractRequest,
        ],
        (MessageKind::SignContractRequest, Role::Taker) => vec![
            TakerProcessSignContractRequest,
            TakerSendSignContractResponse,
            TraderCreateDepositTx,
            TraderSendDepositRequest,
        ],
        (MessageKind::SignContractResponse, Role::Maker) => vec![
            MakerProcessSignContractResponse,
            TraderCreateDepositTx,
            TraderSendDepositRequest,
        ],
        (MessageKind::DepositRequest, Role::Arbitrator) => vec![
            ArbitratorProcessDepositRequest,
            ArbitratorPublishDepositTxs,
            ArbitratorSendDepositResponse { to: Role::Maker },
            ArbitratorSendDepositResponse { to: Role::Taker },
        ],
        (MessageKind::DepositResponse, Role::Maker | Role::Taker) => {
            vec![TraderProcessDepositResponse]
        }
        (MessageKind::DepositsConfirmed, _) => vec![ProcessDepositsConfirmed],
        (MessageKind::PaymentSent, Role::Arbitrator) => vec![ArbitratorProcessPaymentSent],
        (MessageKind::PaymentSent, _) if side == Some(Side::Seller) => {
            vec![SellerProcessPaymentSent]
        }
        (MessageKind::PaymentReceived, Role::Arbitrator) => {
            vec![ArbitratorProcessPaymentReceived]
        }
        (MessageKind::PaymentReceived, _) if side == Some(Side::Buyer) => {
            vec![BuyerProcessPaymentReceived]
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::model::tests::sample_trade;

    // The sample offer sells XMR: the maker is the seller.

    #[test]
    fn test_taker_start() {
        let trade = sample_trade(Role::Taker);
        assert_eq!(
            tasks_for(&trade, &Trigger::Start),
            vec![TradeTask::TakerReserveTradeFunds, TradeTask::TakerSendInitTradeRequest]
        );
        assert!(tasks_for(&sample_trade(Role::Maker), &Trigger::Start).is_empty());
    }

    #[test]
    fn test_init_trade_request_by_role() {
        let arb = sample_trade(Role::Arbitrator);
        let maker = sample_trade(Role::Maker);
        let taker = sample_trade(Role::Taker);
        let trigger = Trigger::Inbound(MessageKind::InitTradeRequest);
        assert_eq!(tasks_for(&arb, &trigger)[0], TradeTask::ArbitratorProcessInitTradeRequest);
        assert_eq!(tasks_for(&maker, &trigger).len(), 3);
        assert!(tasks_for(&taker, &trigger).is_empty());
    }

    #[test]
    fn test_payment_confirmations_only_for_the_right_side() {
        let buyer = sample_trade(Role::Taker);
        let seller = sample_trade(Role::Maker);

        let sent = tasks_for(&buyer, &Trigger::PaymentSentConfirmed);
        assert_eq!(
            sent,
            vec![
                TradeTask::BuyerPreparePaymentSent,
                TradeTask::BuyerSendPaymentSentMessage { to: Role::Maker },
                TradeTask::BuyerSendPaymentSentMessage { to: Role::Arbitrator },
            ]
        );
        assert!(tasks_for(&seller, &Trigger::PaymentSentConfirmed).is_empty());
        assert!(tasks_for(&buyer, &Trigger::PaymentReceiptConfirmed).is_empty());
        assert_eq!(
            tasks_for(&seller, &Trigger::PaymentReceiptConfirmed)[1],
            TradeTask::SellerSendPaymentReceivedMessage { to: Role::Taker }
        );
    }

    #[test]
    fn test_payment_messages_by_side() {
        let buyer = sample_trade(Role::Taker);
        let seller = sample_trade(Role::Maker);
        let sent = Trigger::Inbound(MessageKind::PaymentSent);
        let received = Trigger::Inbound(MessageKind::PaymentReceived);

        assert_eq!(tasks_for(&seller, &sent), vec![TradeTask::SellerProcessPaymentSent]);
        assert!(tasks_for(&buyer, &sent).is_empty());
        assert_eq!(tasks_for(&buyer, &received), vec![TradeTask::BuyerProcessPaymentReceived]);
        assert!(tasks_for(&seller, &received).is_empty());
    }

    #[test]
    fn test_resend_targets_counterparty() {
        let buyer = sample_trade(Role::Taker);
        assert_eq!(
            tasks_for(&buyer, &Trigger::Resend(TradeState::BuyerSendFailedPaymentSentMsg)),
            vec![TradeTask::BuyerSendPaymentSentMessage { to: Role::Maker }]
        );
        assert_eq!(
            tasks_for(&buyer, &Trigger::Resend(TradeState::DepositRequestSendFailed)),
            vec![TradeTask::TraderSendDepositRequest]
        );
        let arb = sample_trade(Role::Arbitrator);
        assert!(tasks_for(&arb, &Trigger::Resend(TradeState::DepositRequestSendFailed)).is_empty());
    }

    #[test]
    fn test_deposits_confirmed_informs_both_other_parties() {
        let arb = sample_trade(Role::Arbitrator);
        assert_eq!(
            tasks_for(&arb, &Trigger::DepositsConfirmed),
            vec![
                TradeTask::MarkDepositsConfirmed,
                TradeTask::SendDepositsConfirmed { to: Role::Maker },
                TradeTask::SendDepositsConfirmed { to: Role::Taker },
            ]
        );
    }
}
