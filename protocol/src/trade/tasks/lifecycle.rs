//! Steps driven by the chain rather than by a peer, plus the multisig
//! state exchange that follows deposit confirmation.

use tracing::{debug, info, warn};

use crate::network::messages::DepositsConfirmed;
use crate::network::{DeliveryOutcome, ProtocolMessage};
use crate::pipeline::{inbound_payload, TaskError};
use crate::trade::context::{require, TradeContext};
use crate::trade::{PayoutState, Role, TradeState};

/// Imports a peer's exported multisig state and keeps it on the peer.
pub(super) async fn import_peer_hex(
    ctx: &mut TradeContext,
    role: Role,
    hex: String,
) -> Result<(), TaskError> {
    let outputs = ctx
        .services
        .wallet
        .import_multisig_hex(&ctx.trade.id, std::slice::from_ref(&hex))
        .await?;
    debug!(trade_id = %ctx.trade.id, from = %role, outputs, "multisig state imported");
    ctx.trade.peer_mut(role).updated_multisig_hex = Some(hex);
    Ok(())
}

pub(super) async fn export_own_hex(ctx: &mut TradeContext) -> Result<String, TaskError> {
    let hex = ctx.services.wallet.export_multisig_hex(&ctx.trade.id).await?;
    ctx.trade.me_mut().updated_multisig_hex = Some(hex.clone());
    Ok(hex)
}

pub(super) async fn mark_deposits_confirmed(ctx: &mut TradeContext) -> Result<(), TaskError> {
    ctx.advance_at_least(TradeState::DepositTxsConfirmed)?;
    export_own_hex(ctx).await?;
    info!(trade_id = %ctx.trade.id, "deposit txs confirmed");
    Ok(())
}

pub(super) async fn send_deposits_confirmed(ctx: &mut TradeContext, to: Role) -> Result<(), TaskError> {
    let updated_multisig_hex = require(&ctx.trade.me().updated_multisig_hex, "exported multisig")?;
    if let DeliveryOutcome::Failed(reason) = ctx
        .send_to(
            to,
            ProtocolMessage::DepositsConfirmed(DepositsConfirmed {
                updated_multisig_hex,
            }),
        )
        .await?
    {
        warn!(trade_id = %ctx.trade.id, to = %to, reason = %reason, "multisig state not delivered");
    }
    Ok(())
}

pub(super) async fn process_deposits_confirmed(ctx: &mut TradeContext) -> Result<(), TaskError> {
    let message = inbound_payload!(ctx, DepositsConfirmed);
    let from = ctx.inbound_peer()?;
    import_peer_hex(ctx, from, message.updated_multisig_hex).await
}

pub(super) fn mark_deposits_unlocked(ctx: &mut TradeContext) -> Result<(), TaskError> {
    ctx.advance_at_least(TradeState::DepositTxsUnlocked)
}

pub(super) fn mark_payout_confirmed(ctx: &mut TradeContext) -> Result<(), TaskError> {
    ctx.trade.payout_state = PayoutState::Confirmed;
    ctx.advance_at_least(TradeState::PayoutPublished)?;
    ctx.set_state(TradeState::Closed)
}
