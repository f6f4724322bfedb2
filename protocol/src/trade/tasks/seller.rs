use tracing::{info, warn};

use super::lifecycle::{export_own_hex, import_peer_hex};
use crate::escrow::verify_payout_tx;
use crate::network::messages::PaymentReceived;
use crate::network::{DeliveryOutcome, ProtocolMessage};
use crate::pipeline::{inbound_payload, TaskError};
use crate::trade::context::{require, TradeContext};
use crate::trade::{PayoutState, Role, TradeState};

fn counterparty(ctx: &TradeContext) -> Result<Role, TaskError> {
    ctx.trade
        .counterparty_role()
        .ok_or_else(|| TaskError::Precondition("arbitrator has no counterparty".into()))
}

/// Checks the buyer's signed payout before anything is stored. A payout
/// that does not match the contract is fatal.
pub(super) async fn process_payment_sent(ctx: &mut TradeContext) -> Result<(), TaskError> {
    let message = inbound_payload!(ctx, PaymentSent);
    let buyer = counterparty(ctx)?;
    ctx.expect_sender(buyer)?;

    if let Some(hex) = message.updated_multisig_hex {
        import_peer_hex(ctx, buyer, hex).await?;
    }
    let payout_hex = message
        .payout_tx_hex
        .ok_or_else(|| TaskError::InvalidMessage("no payout tx".into()))?;
    let described = ctx.services.wallet.describe_tx(&payout_hex).await?;
    let terms = ctx.trade.payout_terms()?;
    let split = verify_payout_tx(&described, &terms, ctx.trade.multisig()?)?;

    ctx.trade.peer_mut(buyer).payout_tx_hex = Some(payout_hex);
    info!(
        trade_id = %ctx.trade.id,
        buyer_amount = split.buyer_amount,
        seller_amount = split.seller_amount,
        "buyer reports payment sent"
    );
    ctx.advance_at_least(TradeState::PaymentSentMsgReceived)
}

/// Re-checks the buyer's payout, co-signs and publishes it.
///
/// Relaying is the last thing that can fail: once the payout is on chain
/// the step must commit, or a rollback would forget it.
pub(super) async fn sign_and_publish_payout_tx(ctx: &mut TradeContext) -> Result<(), TaskError> {
    ctx.advance_at_least(TradeState::SellerConfirmedPaymentReceipt)?;
    let buyer = counterparty(ctx)?;
    let payout_hex = require(&ctx.trade.peer(buyer).payout_tx_hex, "buyer payout tx")?;

    let wallet = ctx.services.wallet.clone();
    let described = wallet.describe_tx(&payout_hex).await?;
    let terms = ctx.trade.payout_terms()?;
    verify_payout_tx(&described, &terms, ctx.trade.multisig()?)?;
    let signed = wallet.sign_multisig_tx(&ctx.trade.id, &payout_hex).await?;
    export_own_hex(ctx).await?;

    let hash = wallet.submit_multisig_tx(&ctx.trade.id, &signed).await?;
    record_published_payout(ctx, &described.hash, hash);
    ctx.trade.me_mut().payout_tx_hex = Some(signed);
    Ok(())
}

/// Stores the hash the wallet relayed under. A hash other than the one we
/// verified is kept as well, since that is what the chain will confirm.
pub(super) fn record_published_payout(ctx: &mut TradeContext, verified: &str, relayed: String) {
    if relayed == verified {
        info!(trade_id = %ctx.trade.id, payout = %relayed, "payout published");
    } else {
        warn!(trade_id = %ctx.trade.id, payout = %relayed, expected = %verified, "payout relayed under another hash");
    }
    ctx.trade.payout_tx_hash = Some(relayed);
    ctx.trade.payout_state = ctx.trade.payout_state.max(PayoutState::Published);
}

/// Sends PaymentReceived to `to`. Only the copy for the buyer moves the
/// trade.
pub(super) async fn send_payment_received(ctx: &mut TradeContext, to: Role) -> Result<(), TaskError> {
    let me = ctx.trade.me().clone();
    let payout_published = ctx.trade.payout_tx_hash.is_some();
    let outcome = ctx
        .send_to(
            to,
            ProtocolMessage::PaymentReceived(PaymentReceived {
                signed_payout_tx_hex: me.payout_tx_hex,
                payout_published,
                updated_multisig_hex: me.updated_multisig_hex,
            }),
        )
        .await?;
    if to != counterparty(ctx)? {
        return Ok(());
    }
    if !matches!(
        ctx.trade.state,
        TradeState::SellerConfirmedPaymentReceipt | TradeState::SellerSendFailedPaymentReceivedMsg
    ) {
        return Ok(());
    }
    ctx.set_state(match outcome {
        DeliveryOutcome::Delivered => TradeState::SellerSentPaymentReceivedMsg,
        DeliveryOutcome::Queued => TradeState::SellerStoredInMailboxPaymentReceivedMsg,
        DeliveryOutcome::Failed(_) => TradeState::SellerSendFailedPaymentReceivedMsg,
    })
}
