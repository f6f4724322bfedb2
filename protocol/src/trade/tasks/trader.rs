use tracing::info;

use crate::network::messages::DepositRequest;
use crate::network::{DeliveryOutcome, ProtocolMessage};
use crate::pipeline::{inbound_payload, TaskError};
use crate::trade::context::{require, TradeContext};
use crate::trade::{Role, Side, Trade, TradeState};

/// Trade fee the trader in seat `role` pays with its deposit.
pub(super) fn trade_fee(trade: &Trade, role: Role) -> u64 {
    match role {
        Role::Maker => trade.amounts.maker_fee,
        Role::Taker => trade.amounts.taker_fee,
        Role::Arbitrator => 0,
    }
}

/// Builds (without relaying) our deposit from the reserved outputs. Kept
/// across retries so a resent request carries the same transaction.
pub(super) async fn create_deposit_tx(ctx: &mut TradeContext) -> Result<(), TaskError> {
    if ctx.trade.me().deposit_tx_hash.is_some() {
        return Ok(());
    }
    let side = ctx
        .trade
        .side()
        .ok_or_else(|| TaskError::Precondition("arbitrator does not deposit".into()))?;
    let reserve = require(&ctx.trade.me().reserve_tx, "reserve tx")?;
    let deposit = ctx.trade.amounts.deposit(side)?;
    let built = ctx
        .services
        .wallet
        .create_deposit_tx(
            &reserve.key_images,
            ctx.trade.multisig()?,
            deposit,
            trade_fee(&ctx.trade, ctx.trade.role),
            ctx.services.fee_address(),
        )
        .await?;

    info!(trade_id = %ctx.trade.id, hash = %built.hash, deposit, "deposit tx created");
    let me = ctx.trade.me_mut();
    me.deposit_tx_hash = Some(built.hash);
    me.deposit_tx_hex = Some(built.hex);
    me.deposit_tx_key = Some(built.key);
    Ok(())
}

/// A failed delivery parks the trade in `DepositRequestSendFailed`; the
/// redelivery tick runs this step again.
pub(super) async fn send_deposit_request(ctx: &mut TradeContext) -> Result<(), TaskError> {
    let me = ctx.trade.me().clone();
    let request = DepositRequest {
        contract: ctx
            .trade
            .contract()
            .map_err(|e| TaskError::Precondition(e.to_string()))?
            .clone(),
        maker_signature: require(&ctx.trade.maker.contract_signature, "maker signature")?,
        taker_signature: require(&ctx.trade.taker.contract_signature, "taker signature")?,
        prepared_multisig_hex: require(&me.prepared_multisig_hex, "prepared multisig")?,
        deposit_tx_hash: require(&me.deposit_tx_hash, "deposit tx hash")?,
        deposit_tx_hex: require(&me.deposit_tx_hex, "deposit tx")?,
        deposit_tx_key: require(&me.deposit_tx_key, "deposit tx key")?,
    };
    let outcome = ctx
        .send_to(Role::Arbitrator, ProtocolMessage::DepositRequest(request))
        .await?;
    match outcome {
        DeliveryOutcome::Failed(_) => ctx.set_state(TradeState::DepositRequestSendFailed),
        _ => ctx.set_state(TradeState::DepositRequested),
    }
}

/// The arbitrator published both deposits. Checks it reports the amounts
/// the contract requires and our own transaction.
pub(super) fn process_deposit_response(ctx: &mut TradeContext) -> Result<(), TaskError> {
    let response = inbound_payload!(ctx, DepositResponse);
    ctx.expect_sender(Role::Arbitrator)?;

    let mine = match ctx.trade.role {
        Role::Maker => &response.maker_deposit_tx_hash,
        _ => &response.taker_deposit_tx_hash,
    };
    if Some(mine) != ctx.trade.me().deposit_tx_hash.as_ref() {
        return Err(TaskError::Verification(format!(
            "arbitrator published deposit {mine}, not ours"
        )));
    }
    for (side, reported) in [
        (Side::Buyer, response.buyer_deposit),
        (Side::Seller, response.seller_deposit),
    ] {
        let expected = ctx.trade.amounts.deposit(side)?;
        if reported != expected {
            return Err(TaskError::Verification(format!(
                "{side} deposit is {reported}, contract requires {expected}"
            )));
        }
        ctx.trade.deposits.record(side, reported);
    }
    ctx.trade.maker.deposit_tx_hash = Some(response.maker_deposit_tx_hash);
    ctx.trade.taker.deposit_tx_hash = Some(response.taker_deposit_tx_hash);
    ctx.set_state(TradeState::DepositTxsPublished)?;
    // The reserved outputs are spent now; nothing left to thaw.
    ctx.services.reservations.forget(&ctx.trade.id);
    Ok(())
}
