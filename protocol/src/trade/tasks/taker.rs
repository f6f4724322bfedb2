use tracing::info;

use crate::network::messages::{InitTradeRequest, SignContractResponse};
use crate::network::ProtocolMessage;
use crate::pipeline::{inbound_payload, TaskError};
use crate::trade::context::{require, TradeContext};
use crate::trade::contract::{Contract, ContractParties};
use crate::trade::{Role, TradeState};

pub(super) async fn reserve_trade_funds(ctx: &mut TradeContext) -> Result<(), TaskError> {
    let side = ctx
        .trade
        .side()
        .ok_or_else(|| TaskError::Precondition("taker has no side".into()))?;
    let deposit = ctx.trade.amounts.deposit(side)?;
    let fee = ctx.trade.amounts.taker_fee;
    let reserve = ctx
        .services
        .reservations
        .reserve(&ctx.trade.id, deposit, fee)
        .await?;
    let prepared = ctx.services.wallet.prepare_multisig(&ctx.trade.id).await?;

    let me = ctx.trade.me_mut();
    me.reserve_tx = Some(reserve);
    me.prepared_multisig_hex = Some(prepared);
    ctx.set_state(TradeState::FundsReserved)
}

pub(super) async fn send_init_trade_request(ctx: &mut TradeContext) -> Result<(), TaskError> {
    let me = ctx.trade.me().clone();
    let request = InitTradeRequest {
        offer: ctx.trade.offer.clone(),
        trade_amount: ctx.trade.amounts.trade_amount,
        taker_node: require(&me.node, "taker address")?,
        taker_pub_key: require(&me.pub_key, "taker key")?,
        taker_payout_address: require(&me.payout_address, "taker payout address")?,
        taker_prepared_multisig_hex: require(&me.prepared_multisig_hex, "prepared multisig")?,
        taker_reserve_tx: require(&me.reserve_tx, "reserve tx")?,
        arbitrator_prepared_multisig_hex: None,
    };
    ctx.send_required(Role::Arbitrator, ProtocolMessage::InitTradeRequest(request))
        .await?;
    ctx.set_state(TradeState::InitTradeRequested)
}

/// Checks the maker's contract against our own draft of it, then signs.
pub(super) async fn process_sign_contract_request(ctx: &mut TradeContext) -> Result<(), TaskError> {
    let request = inbound_payload!(ctx, SignContractRequest);
    ctx.expect_sender(Role::Maker)?;

    ctx.trade.maker.prepared_multisig_hex = Some(request.maker_prepared_multisig_hex.clone());
    ctx.trade.arbitrator.prepared_multisig_hex =
        Some(request.arbitrator_prepared_multisig_hex.clone());
    let multisig_address = ctx
        .services
        .wallet
        .make_multisig(
            &ctx.trade.id,
            &[
                request.maker_prepared_multisig_hex.clone(),
                request.arbitrator_prepared_multisig_hex.clone(),
            ],
        )
        .await?;

    let me = ctx.trade.me().clone();
    let expected = Contract::draft(
        &ctx.trade.offer.payload,
        &ctx.trade.amounts,
        ContractParties {
            taker_node: require(&me.node, "taker address")?,
            taker_pub_key: require(&me.pub_key, "taker key")?,
            maker_payout_address: request.contract.maker_payout_address.clone(),
            taker_payout_address: require(&me.payout_address, "taker payout address")?,
            multisig_address: multisig_address.clone(),
        },
    );
    if let Some(field) = request.contract.first_mismatch(&expected) {
        return Err(TaskError::Verification(format!(
            "contract field {field} differs from the agreed terms"
        )));
    }
    let maker_key = ctx.trade.offer.payload.maker_pub_key;
    if !request
        .contract
        .verify_signature(&maker_key, &request.maker_signature)
    {
        return Err(TaskError::Verification("maker contract signature".into()));
    }

    let contract = request.contract;
    ctx.trade.multisig_address = Some(multisig_address);
    ctx.trade.maker.payout_address = Some(contract.maker_payout_address.clone());
    ctx.trade.maker.contract_signature = Some(request.maker_signature);
    ctx.trade.me_mut().contract_signature = Some(contract.sign(&ctx.services.keys));
    ctx.trade
        .set_contract(contract)
        .map_err(|e| TaskError::Precondition(e.to_string()))?;
    ctx.trade.lock_contract()?;
    info!(trade_id = %ctx.trade.id, "contract signed");
    ctx.set_state(TradeState::ContractSigned)
}

pub(super) async fn send_sign_contract_response(ctx: &mut TradeContext) -> Result<(), TaskError> {
    let contract_hash = ctx
        .trade
        .contract()
        .map_err(|e| TaskError::Precondition(e.to_string()))?
        .hash();
    let taker_signature = require(&ctx.trade.me().contract_signature, "taker signature")?;
    ctx.send_required(
        Role::Maker,
        ProtocolMessage::SignContractResponse(SignContractResponse {
            contract_hash,
            taker_signature,
        }),
    )
    .await
}
