//! Arbitrator steps.
//!
//! The arbitrator never holds trade funds. It vouches for the taker's
//! reserved funds, checks both deposits against the contract before
//! publishing them together, and keeps its multisig state in sync so it
//! can co-sign a dispute payout later.

use tracing::{info, warn};

use super::key_image_holder;
use super::trader::trade_fee;
use crate::escrow::{
    verify_deposit_inputs, verify_deposit_tx, verify_payout_tx, verify_reserve_tx,
};
use crate::network::messages::DepositResponse;
use crate::network::{DeliveryOutcome, ProtocolMessage};
use crate::pipeline::{inbound_payload, TaskError};
use crate::trade::context::{require, TradeContext};
use crate::trade::contract::{Contract, ContractParties};
use crate::trade::{PayoutState, Role, TradePeer, TradeState};

/// The taker asks to trade. Checks the offer is one we signed and that the
/// taker's reserve proof covers its deposit and fee, then claims the
/// reserve's key images for this trade.
pub(super) async fn process_init_trade_request(ctx: &mut TradeContext) -> Result<(), TaskError> {
    let request = inbound_payload!(ctx, InitTradeRequest);
    let (sender, sender_key) = ctx
        .inbound
        .as_ref()
        .map(|m| (m.sender().clone(), m.envelope.sender_pub_key))
        .ok_or_else(|| TaskError::InvalidMessage("no inbound message".into()))?;
    if sender != request.taker_node || sender_key != request.taker_pub_key {
        return Err(TaskError::Verification(
            "request was not sent by the taker it names".into(),
        ));
    }

    let signed = ctx
        .offers
        .signed_offer(&ctx.trade.id)
        .ok_or_else(|| TaskError::Verification("offer was not signed by this arbitrator".into()))?;
    if signed != request.offer {
        return Err(TaskError::Verification("offer terms were altered".into()));
    }
    request
        .offer
        .verify_arbitrator_signature()
        .map_err(|e| TaskError::Verification(e.to_string()))?;

    let taker_side = ctx.trade.offer.payload.maker_side().opposite();
    let deposit = ctx.trade.amounts.deposit(taker_side)?;
    let reserve = request.taker_reserve_tx.clone();
    let described = ctx.services.wallet.describe_tx(&reserve.hex).await?;
    verify_reserve_tx(
        &described,
        &reserve,
        deposit,
        ctx.trade.amounts.taker_fee,
        ctx.services.fee_address(),
    )?;
    ctx.services
        .key_images
        .claim(&key_image_holder(&ctx.trade.id, Role::Taker), &reserve.key_images)?;

    ctx.trade.taker = TradePeer {
        payout_address: Some(request.taker_payout_address.clone()),
        prepared_multisig_hex: Some(request.taker_prepared_multisig_hex.clone()),
        reserve_tx: Some(reserve),
        ..TradePeer::identified(request.taker_node.clone(), request.taker_pub_key)
    };
    ctx.trade.maker.reserve_tx = Some(signed.reserve_tx);
    let prepared = ctx.services.wallet.prepare_multisig(&ctx.trade.id).await?;
    ctx.trade.me_mut().prepared_multisig_hex = Some(prepared);
    Ok(())
}

pub(super) async fn send_init_trade_request_to_maker(ctx: &mut TradeContext) -> Result<(), TaskError> {
    let mut request = inbound_payload!(ctx, InitTradeRequest);
    request.arbitrator_prepared_multisig_hex = Some(require(
        &ctx.trade.me().prepared_multisig_hex,
        "arbitrator multisig hex",
    )?);
    ctx.send_required(Role::Maker, ProtocolMessage::InitTradeRequest(request))
        .await?;
    ctx.set_state(TradeState::InitTradeRequested)
}

/// One trader's deposit. The first request also installs the contract;
/// the second must carry the identical one.
pub(super) async fn process_deposit_request(ctx: &mut TradeContext) -> Result<(), TaskError> {
    let request = inbound_payload!(ctx, DepositRequest);
    let sender = ctx.inbound_peer()?;
    let side = ctx
        .trade
        .side_of(sender)
        .ok_or_else(|| TaskError::Verification("deposit request from the arbitrator seat".into()))?;

    match ctx.trade.contract.clone() {
        Some(existing) if existing != request.contract => {
            return Err(TaskError::Verification(
                "deposit request carries a different contract".into(),
            ));
        }
        Some(_) => {}
        None => {
            let taker = ctx.trade.taker.clone();
            let expected = Contract::draft(
                &ctx.trade.offer.payload,
                &ctx.trade.amounts,
                ContractParties {
                    taker_node: require(&taker.node, "taker address")?,
                    taker_pub_key: require(&taker.pub_key, "taker key")?,
                    maker_payout_address: request.contract.maker_payout_address.clone(),
                    taker_payout_address: require(&taker.payout_address, "taker payout address")?,
                    multisig_address: request.contract.multisig_address.clone(),
                },
            );
            if let Some(field) = request.contract.first_mismatch(&expected) {
                return Err(TaskError::Verification(format!(
                    "contract field {field} differs from the agreed terms"
                )));
            }
            ctx.trade.maker.contract_signature = Some(request.maker_signature);
            ctx.trade.taker.contract_signature = Some(request.taker_signature);
            ctx.trade.maker.payout_address = Some(request.contract.maker_payout_address.clone());
            ctx.trade
                .set_contract(request.contract.clone())
                .map_err(|e| TaskError::Precondition(e.to_string()))?;
            ctx.trade.lock_contract()?;
        }
    }

    let known_hex = ctx.trade.peer(sender).prepared_multisig_hex.clone();
    if known_hex.is_some_and(|known| known != request.prepared_multisig_hex) {
        return Err(TaskError::Verification(format!(
            "{sender} changed its multisig hex"
        )));
    }
    ctx.trade.peer_mut(sender).prepared_multisig_hex = Some(request.prepared_multisig_hex.clone());

    if ctx.trade.multisig_address.is_none() {
        if let (Some(maker_hex), Some(taker_hex)) = (
            ctx.trade.maker.prepared_multisig_hex.clone(),
            ctx.trade.taker.prepared_multisig_hex.clone(),
        ) {
            let address = ctx
                .services
                .wallet
                .make_multisig(&ctx.trade.id, &[maker_hex, taker_hex])
                .await?;
            if address != request.contract.multisig_address {
                return Err(TaskError::Verification(format!(
                    "contract multisig {} does not match {address}",
                    request.contract.multisig_address
                )));
            }
            ctx.trade.multisig_address = Some(address);
        }
    }

    let described = ctx
        .services
        .wallet
        .describe_tx(&request.deposit_tx_hex)
        .await?;
    let deposited = verify_deposit_tx(
        &described,
        &request.deposit_tx_hash,
        &request.contract.multisig_address,
        ctx.trade.amounts.deposit(side)?,
        trade_fee(&ctx.trade, sender),
        ctx.services.fee_address(),
    )?;
    let reserve = require(&ctx.trade.peer(sender).reserve_tx, "reserve tx")?;
    verify_deposit_inputs(&described, &reserve)?;

    ctx.trade.deposits.record(side, deposited);
    let peer = ctx.trade.peer_mut(sender);
    peer.deposit_tx_hash = Some(request.deposit_tx_hash);
    peer.deposit_tx_hex = Some(request.deposit_tx_hex);
    peer.deposit_tx_key = Some(request.deposit_tx_key);
    info!(trade_id = %ctx.trade.id, from = %sender, deposited, "deposit verified");
    ctx.advance_at_least(TradeState::DepositRequested)
}

/// Publishes both deposits once both are verified. Until then a no-op.
pub(super) async fn publish_deposit_txs(ctx: &mut TradeContext) -> Result<(), TaskError> {
    if !ctx.trade.deposits.is_complete()
        || ctx.trade.effective_state() >= TradeState::DepositTxsPublished
    {
        return Ok(());
    }
    ctx.trade.multisig()?;
    let maker_hex = require(&ctx.trade.maker.deposit_tx_hex, "maker deposit tx")?;
    let taker_hex = require(&ctx.trade.taker.deposit_tx_hex, "taker deposit tx")?;
    let maker_hash = ctx.services.wallet.submit_tx(&maker_hex).await?;
    let taker_hash = ctx.services.wallet.submit_tx(&taker_hex).await?;
    info!(
        trade_id = %ctx.trade.id,
        maker_deposit = %maker_hash,
        taker_deposit = %taker_hash,
        "deposit txs published"
    );
    ctx.set_state(TradeState::DepositTxsPublished)?;
    for role in [Role::Maker, Role::Taker] {
        ctx.services
            .key_images
            .release_holder(&key_image_holder(&ctx.trade.id, role));
    }
    Ok(())
}

/// Tells a trader both deposits are out. Skipped until they are.
pub(super) async fn send_deposit_response(ctx: &mut TradeContext, to: Role) -> Result<(), TaskError> {
    if ctx.trade.effective_state() < TradeState::DepositTxsPublished {
        return Ok(());
    }
    let (buyer_deposit, seller_deposit) = ctx.trade.deposits.both()?;
    let response = DepositResponse {
        buyer_deposit,
        seller_deposit,
        maker_deposit_tx_hash: require(&ctx.trade.maker.deposit_tx_hash, "maker deposit hash")?,
        taker_deposit_tx_hash: require(&ctx.trade.taker.deposit_tx_hash, "taker deposit hash")?,
    };
    if let DeliveryOutcome::Failed(reason) = ctx
        .send_to(to, ProtocolMessage::DepositResponse(response))
        .await?
    {
        warn!(trade_id = %ctx.trade.id, to = %to, reason = %reason, "deposit response not delivered");
    }
    Ok(())
}

pub(super) async fn process_payment_sent(ctx: &mut TradeContext) -> Result<(), TaskError> {
    let message = inbound_payload!(ctx, PaymentSent);
    let buyer = ctx.trade.role_of(crate::trade::Side::Buyer);
    ctx.expect_sender(buyer)?;

    if let Some(hex) = message.updated_multisig_hex {
        super::lifecycle::import_peer_hex(ctx, buyer, hex).await?;
    }
    if let Some(payout_hex) = message.payout_tx_hex {
        let described = ctx.services.wallet.describe_tx(&payout_hex).await?;
        let terms = ctx.trade.payout_terms()?;
        verify_payout_tx(&described, &terms, ctx.trade.multisig()?)?;
        ctx.trade.peer_mut(buyer).payout_tx_hex = Some(payout_hex);
    }
    ctx.advance_at_least(TradeState::PaymentSentMsgReceived)
}

pub(super) async fn process_payment_received(ctx: &mut TradeContext) -> Result<(), TaskError> {
    let message = inbound_payload!(ctx, PaymentReceived);
    let seller = ctx.trade.role_of(crate::trade::Side::Seller);
    ctx.expect_sender(seller)?;

    if let Some(hex) = message.updated_multisig_hex {
        super::lifecycle::import_peer_hex(ctx, seller, hex).await?;
    }
    if let Some(payout_hex) = message.signed_payout_tx_hex {
        let described = ctx.services.wallet.describe_tx(&payout_hex).await?;
        let terms = ctx.trade.payout_terms()?;
        verify_payout_tx(&described, &terms, ctx.trade.multisig()?)?;
        if message.payout_published {
            ctx.trade.payout_tx_hash = Some(described.hash);
            ctx.trade.payout_state = ctx.trade.payout_state.max(PayoutState::Published);
        }
        ctx.trade.peer_mut(seller).payout_tx_hex = Some(payout_hex);
    }
    ctx.advance_at_least(TradeState::PaymentReceivedMsgReceived)
}
