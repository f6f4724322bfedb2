use tracing::info;

use super::lifecycle::{export_own_hex, import_peer_hex};
use super::seller::record_published_payout;
use crate::escrow::verify_payout_tx;
use crate::network::messages::PaymentSent;
use crate::network::{DeliveryOutcome, ProtocolMessage};
use crate::pipeline::{inbound_payload, TaskError};
use crate::trade::context::TradeContext;
use crate::trade::{Role, TradeState};

fn counterparty(ctx: &TradeContext) -> Result<Role, TaskError> {
    ctx.trade
        .counterparty_role()
        .ok_or_else(|| TaskError::Precondition("arbitrator has no counterparty".into()))
}

/// Builds the cooperative payout, checks it against the contract like the
/// seller will, and adds our signature.
pub(super) async fn prepare_payment_sent(ctx: &mut TradeContext) -> Result<(), TaskError> {
    if !ctx.trade.has_peer_multisig_state() {
        return Err(TaskError::Precondition(
            "no multisig state imported from peers yet".into(),
        ));
    }
    ctx.advance_at_least(TradeState::BuyerConfirmedPaymentSent)?;

    let terms = ctx.trade.payout_terms()?;
    let (destinations, fee_from) = terms.proposal()?;
    let wallet = ctx.services.wallet.clone();
    let built = wallet
        .create_multisig_payout(&ctx.trade.id, &destinations, &fee_from)
        .await?;
    let described = wallet.describe_tx(&built.hex).await?;
    let split = verify_payout_tx(&described, &terms, ctx.trade.multisig()?)?;
    let signed = wallet.sign_multisig_tx(&ctx.trade.id, &built.hex).await?;

    ctx.trade.me_mut().payout_tx_hex = Some(signed);
    export_own_hex(ctx).await?;
    info!(
        trade_id = %ctx.trade.id,
        buyer_amount = split.buyer_amount,
        seller_amount = split.seller_amount,
        tx_cost = split.tx_cost,
        "payout proposed"
    );
    Ok(())
}

/// Sends PaymentSent to `to`. Only the copy for the seller moves the
/// trade; the arbitrator's copy is informational.
pub(super) async fn send_payment_sent(ctx: &mut TradeContext, to: Role) -> Result<(), TaskError> {
    let me = ctx.trade.me().clone();
    let outcome = ctx
        .send_to(
            to,
            ProtocolMessage::PaymentSent(PaymentSent {
                counter_currency_tx_id: None,
                payout_tx_hex: me.payout_tx_hex,
                updated_multisig_hex: me.updated_multisig_hex,
            }),
        )
        .await?;
    if to != counterparty(ctx)? {
        return Ok(());
    }
    if !matches!(
        ctx.trade.state,
        TradeState::BuyerConfirmedPaymentSent | TradeState::BuyerSendFailedPaymentSentMsg
    ) {
        return Ok(());
    }
    ctx.set_state(match outcome {
        DeliveryOutcome::Delivered => TradeState::BuyerSentPaymentSentMsg,
        DeliveryOutcome::Queued => TradeState::BuyerStoredInMailboxPaymentSentMsg,
        DeliveryOutcome::Failed(_) => TradeState::BuyerSendFailedPaymentSentMsg,
    })
}

/// The seller co-signed and published the payout.
pub(super) async fn process_payment_received(ctx: &mut TradeContext) -> Result<(), TaskError> {
    let message = inbound_payload!(ctx, PaymentReceived);
    let seller = counterparty(ctx)?;
    ctx.expect_sender(seller)?;

    if let Some(hex) = message.updated_multisig_hex {
        import_peer_hex(ctx, seller, hex).await?;
    }
    let payout_hex = message
        .signed_payout_tx_hex
        .ok_or_else(|| TaskError::InvalidMessage("no signed payout tx".into()))?;
    let described = ctx.services.wallet.describe_tx(&payout_hex).await?;
    let terms = ctx.trade.payout_terms()?;
    verify_payout_tx(&described, &terms, ctx.trade.multisig()?)?;

    // The state change goes first so relaying is the last call that can
    // fail. Relaying again is harmless and covers a seller that signed but
    // could not publish.
    ctx.advance_at_least(TradeState::PaymentReceivedMsgReceived)?;
    let hash = ctx
        .services
        .wallet
        .submit_multisig_tx(&ctx.trade.id, &payout_hex)
        .await?;
    record_published_payout(ctx, &described.hash, hash);
    ctx.trade.peer_mut(seller).payout_tx_hex = Some(payout_hex);
    Ok(())
}
