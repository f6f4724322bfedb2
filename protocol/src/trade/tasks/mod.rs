//! Every step of the trade protocol.
//!
//! A [`TradeTask`] is a plain enum value; [`protocol::tasks_for`] decides
//! which ones run for a trigger and the pipeline runs them in order. The
//! bodies live in one file per party:
//!
//! | file            | steps                                             |
//! |-----------------|---------------------------------------------------|
//! | `taker.rs`      | reserve, InitTradeRequest, contract signature     |
//! | `maker.rs`      | InitTradeRequest, contract draft and signature    |
//! | `arbitrator.rs` | reserve check, deposit check and publication      |
//! | `trader.rs`     | deposit tx, DepositRequest, DepositResponse       |
//! | `lifecycle.rs`  | confirmations, multisig sync, payout confirmation |
//! | `buyer.rs`      | payout proposal, PaymentSent                      |
//! | `seller.rs`     | payout co-signing, PaymentReceived                |
//!
//! [`protocol::tasks_for`]: super::protocol::tasks_for

mod arbitrator;
mod buyer;
mod lifecycle;
mod maker;
mod seller;
mod taker;
mod trader;

use async_trait::async_trait;

use super::context::TradeContext;
use super::model::Role;
use crate::pipeline::{Task, TaskError};

/// Key-image holder name for a trader's reservation behind a trade.
pub fn key_image_holder(trade_id: &str, role: Role) -> String {
    format!("{trade_id}/{role}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeTask {
    // Taker
    TakerReserveTradeFunds,
    TakerSendInitTradeRequest,
    TakerProcessSignContractRequest,
    TakerSendSignContractResponse,

    // Maker
    MakerProcessInitTradeRequest,
    MakerCreateAndSignContract,
    MakerSendSignContractRequest,
    MakerProcessSignContractResponse,

    // Arbitrator
    ArbitratorProcessInitTradeRequest,
    ArbitratorSendInitTradeRequestToMaker,
    ArbitratorProcessDepositRequest,
    ArbitratorPublishDepositTxs,
    ArbitratorSendDepositResponse { to: Role },
    ArbitratorProcessPaymentSent,
    ArbitratorProcessPaymentReceived,

    // Both traders
    TraderCreateDepositTx,
    TraderSendDepositRequest,
    TraderProcessDepositResponse,

    // Everyone
    MarkDepositsConfirmed,
    SendDepositsConfirmed { to: Role },
    ProcessDepositsConfirmed,
    MarkDepositsUnlocked,
    MarkPayoutConfirmed,

    // Buyer
    BuyerPreparePaymentSent,
    BuyerSendPaymentSentMessage { to: Role },
    BuyerProcessPaymentReceived,

    // Seller
    SellerProcessPaymentSent,
    SellerSignAndPublishPayoutTx,
    SellerSendPaymentReceivedMessage { to: Role },
}

#[async_trait]
impl Task for TradeTask {
    type Context = TradeContext;

    fn name(&self) -> &'static str {
        use TradeTask::*;
        match self {
            TakerReserveTradeFunds => "TakerReserveTradeFunds",
            TakerSendInitTradeRequest => "TakerSendInitTradeRequest",
            TakerProcessSignContractRequest => "TakerProcessSignContractRequest",
            TakerSendSignContractResponse => "TakerSendSignContractResponse",
            MakerProcessInitTradeRequest => "MakerProcessInitTradeRequest",
            MakerCreateAndSignContract => "MakerCreateAndSignContract",
            MakerSendSignContractRequest => "MakerSendSignContractRequest",
            MakerProcessSignContractResponse => "MakerProcessSignContractResponse",
            ArbitratorProcessInitTradeRequest => "ArbitratorProcessInitTradeRequest",
            ArbitratorSendInitTradeRequestToMaker => "ArbitratorSendInitTradeRequestToMaker",
            ArbitratorProcessDepositRequest => "ArbitratorProcessDepositRequest",
            ArbitratorPublishDepositTxs => "ArbitratorPublishDepositTxs",
            ArbitratorSendDepositResponse { .. } => "ArbitratorSendDepositResponse",
            ArbitratorProcessPaymentSent => "ArbitratorProcessPaymentSent",
            ArbitratorProcessPaymentReceived => "ArbitratorProcessPaymentReceived",
            TraderCreateDepositTx => "TraderCreateDepositTx",
            TraderSendDepositRequest => "TraderSendDepositRequest",
            TraderProcessDepositResponse => "TraderProcessDepositResponse",
            MarkDepositsConfirmed => "MarkDepositsConfirmed",
            SendDepositsConfirmed { .. } => "SendDepositsConfirmed",
            ProcessDepositsConfirmed => "ProcessDepositsConfirmed",
            MarkDepositsUnlocked => "MarkDepositsUnlocked",
            MarkPayoutConfirmed => "MarkPayoutConfirmed",
            BuyerPreparePaymentSent => "BuyerPreparePaymentSent",
            BuyerSendPaymentSentMessage { .. } => "BuyerSendPaymentSentMessage",
            BuyerProcessPaymentReceived => "BuyerProcessPaymentReceived",
            SellerProcessPaymentSent => "SellerProcessPaymentSent",
            SellerSignAndPublishPayoutTx => "SellerSignAndPublishPayoutTx",
            SellerSendPaymentReceivedMessage { .. } => "SellerSendPaymentReceivedMessage",
        }
    }

    async fn execute(&self, ctx: &mut TradeContext) -> Result<(), TaskError> {
        use TradeTask::*;
        match *self {
            TakerReserveTradeFunds => taker::reserve_trade_funds(ctx).await,
            TakerSendInitTradeRequest => taker::send_init_trade_request(ctx).await,
            TakerProcessSignContractRequest => taker::process_sign_contract_request(ctx).await,
            TakerSendSignContractResponse => taker::send_sign_contract_response(ctx).await,

            MakerProcessInitTradeRequest => maker::process_init_trade_request(ctx).await,
            MakerCreateAndSignContract => maker::create_and_sign_contract(ctx),
            MakerSendSignContractRequest => maker::send_sign_contract_request(ctx).await,
            MakerProcessSignContractResponse => maker::process_sign_contract_response(ctx),

            ArbitratorProcessInitTradeRequest => {
                arbitrator::process_init_trade_request(ctx).await
            }
            ArbitratorSendInitTradeRequestToMaker => {
                arbitrator::send_init_trade_request_to_maker(ctx).await
            }
            ArbitratorProcessDepositRequest => arbitrator::process_deposit_request(ctx).await,
            ArbitratorPublishDepositTxs => arbitrator::publish_deposit_txs(ctx).await,
            ArbitratorSendDepositResponse { to } => {
                arbitrator::send_deposit_response(ctx, to).await
            }
            ArbitratorProcessPaymentSent => arbitrator::process_payment_sent(ctx).await,
            ArbitratorProcessPaymentReceived => arbitrator::process_payment_received(ctx).await,

            TraderCreateDepositTx => trader::create_deposit_tx(ctx).await,
            TraderSendDepositRequest => trader::send_deposit_request(ctx).await,
            TraderProcessDepositResponse => trader::process_deposit_response(ctx),

            MarkDepositsConfirmed => lifecycle::mark_deposits_confirmed(ctx).await,
            SendDepositsConfirmed { to } => lifecycle::send_deposits_confirmed(ctx, to).await,
            ProcessDepositsConfirmed => lifecycle::process_deposits_confirmed(ctx).await,
            MarkDepositsUnlocked => lifecycle::mark_deposits_unlocked(ctx),
            MarkPayoutConfirmed => lifecycle::mark_payout_confirmed(ctx),

            BuyerPreparePaymentSent => buyer::prepare_payment_sent(ctx).await,
            BuyerSendPaymentSentMessage { to } => buyer::send_payment_sent(ctx, to).await,
            BuyerProcessPaymentReceived => buyer::process_payment_received(ctx).await,

            SellerProcessPaymentSent => seller::process_payment_sent(ctx).await,
            SellerSignAndPublishPayoutTx => seller::sign_and_publish_payout_tx(ctx).await,
            SellerSendPaymentReceivedMessage { to } => seller::send_payment_received(ctx, to).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_holder_names_are_per_role() {
        assert_eq!(key_image_holder("t1", Role::Taker), "t1/taker");
        assert_eq!(key_image_holder("t1", Role::Maker), "t1/maker");
        assert_eq!(
            key_image_holder("t1", Role::Maker),
            crate::offer::tasks::maker_holder("t1")
        );
    }

    #[test]
    fn test_parameterized_tasks_share_a_name() {
        assert_eq!(
            TradeTask::ArbitratorSendDepositResponse { to: Role::Maker }.name(),
            TradeTask::ArbitratorSendDepositResponse { to: Role::Taker }.name()
        );
    }
}
