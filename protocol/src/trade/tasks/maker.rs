use tracing::info;

use crate::network::messages::SignContractRequest;
use crate::network::ProtocolMessage;
use crate::pipeline::{inbound_payload, TaskError};
use crate::trade::context::{require, TradeContext};
use crate::trade::contract::{Contract, ContractParties};
use crate::trade::{Role, TradePeer, TradeState};

/// The arbitrator forwarded a taker. Checks the request is for our offer
/// as we published it, sets up the multisig and takes the offer off the
/// book.
pub(super) async fn process_init_trade_request(ctx: &mut TradeContext) -> Result<(), TaskError> {
    let request = inbound_payload!(ctx, InitTradeRequest);
    ctx.expect_sender(Role::Arbitrator)?;

    let open = ctx
        .offers
        .open_offer(&ctx.trade.id)
        .ok_or_else(|| TaskError::Precondition(format!("no open offer {}", ctx.trade.id)))?;
    if open.signed.as_ref() != Some(&request.offer) {
        return Err(TaskError::Verification(
            "request names different offer terms".into(),
        ));
    }
    if request.trade_amount != ctx.trade.amounts.trade_amount {
        return Err(TaskError::Verification("trade amount changed in transit".into()));
    }
    let arbitrator_hex = request
        .arbitrator_prepared_multisig_hex
        .clone()
        .ok_or_else(|| TaskError::InvalidMessage("no arbitrator multisig hex".into()))?;
    if &request.taker_node == ctx.services.address() {
        return Err(TaskError::Verification("maker cannot take its own offer".into()));
    }

    ctx.trade.taker = TradePeer {
        payout_address: Some(request.taker_payout_address.clone()),
        prepared_multisig_hex: Some(request.taker_prepared_multisig_hex.clone()),
        reserve_tx: Some(request.taker_reserve_tx.clone()),
        ..TradePeer::identified(request.taker_node.clone(), request.taker_pub_key)
    };
    ctx.trade.arbitrator.prepared_multisig_hex = Some(arbitrator_hex.clone());

    let reserve = open
        .reserve_tx
        .clone()
        .ok_or_else(|| TaskError::Precondition("offer funds not reserved".into()))?;
    let prepared = ctx.services.wallet.prepare_multisig(&ctx.trade.id).await?;
    let multisig_address = ctx
        .services
        .wallet
        .make_multisig(
            &ctx.trade.id,
            &[request.taker_prepared_multisig_hex, arbitrator_hex],
        )
        .await?;

    let payout_address = ctx.services.wallet.primary_address();
    let me = ctx.trade.me_mut();
    me.reserve_tx = Some(reserve);
    me.prepared_multisig_hex = Some(prepared);
    me.payout_address = Some(payout_address);
    ctx.trade.multisig_address = Some(multisig_address);

    ctx.offers
        .mark_taken(&ctx.trade.id)
        .map_err(|e| TaskError::Precondition(e.to_string()))?;
    info!(trade_id = %ctx.trade.id, taker = %request.taker_node, "offer taken");
    Ok(())
}

pub(super) fn create_and_sign_contract(ctx: &mut TradeContext) -> Result<(), TaskError> {
    let taker = ctx.trade.taker.clone();
    let contract = Contract::draft(
        &ctx.trade.offer.payload,
        &ctx.trade.amounts,
        ContractParties {
            taker_node: require(&taker.node, "taker address")?,
            taker_pub_key: require(&taker.pub_key, "taker key")?,
            maker_payout_address: require(&ctx.trade.me().payout_address, "maker payout address")?,
            taker_payout_address: require(&taker.payout_address, "taker payout address")?,
            multisig_address: ctx.trade.multisig()?.to_string(),
        },
    );
    ctx.trade.me_mut().contract_signature = Some(contract.sign(&ctx.services.keys));
    ctx.trade
        .set_contract(contract)
        .map_err(|e| TaskError::Precondition(e.to_string()))
}

pub(super) async fn send_sign_contract_request(ctx: &mut TradeContext) -> Result<(), TaskError> {
    let request = SignContractRequest {
        contract: ctx
            .trade
            .contract()
            .map_err(|e| TaskError::Precondition(e.to_string()))?
            .clone(),
        maker_signature: require(&ctx.trade.me().contract_signature, "maker signature")?,
        maker_prepared_multisig_hex: require(
            &ctx.trade.me().prepared_multisig_hex,
            "maker multisig hex",
        )?,
        arbitrator_prepared_multisig_hex: require(
            &ctx.trade.arbitrator.prepared_multisig_hex,
            "arbitrator multisig hex",
        )?,
    };
    ctx.send_required(Role::Taker, ProtocolMessage::SignContractRequest(request))
        .await?;
    ctx.set_state(TradeState::ContractSignatureRequested)
}

pub(super) fn process_sign_contract_response(ctx: &mut TradeContext) -> Result<(), TaskError> {
    let response = inbound_payload!(ctx, SignContractResponse);
    ctx.expect_sender(Role::Taker)?;

    let hash = ctx
        .trade
        .contract()
        .map_err(|e| TaskError::Precondition(e.to_string()))?
        .hash();
    if response.contract_hash != hash {
        return Err(TaskError::Verification(format!(
            "taker signed contract {}, ours is {hash}",
            response.contract_hash
        )));
    }
    ctx.trade.taker.contract_signature = Some(response.taker_signature);
    ctx.trade.lock_contract()?;
    info!(trade_id = %ctx.trade.id, "contract signed by both traders");
    ctx.set_state(TradeState::ContractSigned)
}
