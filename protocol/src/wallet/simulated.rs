//! In-memory Monero stand-in.
//!
//! [`SimulatedChain`] is a tiny UTXO ledger shared by every
//! [`SimulatedWallet`] in a test or sandbox. Transactions are JSON encoded
//! as hex, multisig addresses are derived from the three prepared hexes,
//! and a multisig spend needs two distinct member signatures before the
//! chain accepts it. Confirmations only advance when someone calls
//! [`SimulatedChain::mine`].

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use super::{WalletError, XmrWallet};
use crate::config::{MULTISIG_PARTICIPANTS, MULTISIG_THRESHOLD};
use crate::crypto::blake3_parts;
use crate::escrow::tx::{BuiltTx, Destination, ReserveTx, TxDescription, WalletOutput};

/// Network fee charged on single-signer transactions.
pub const SIM_NETWORK_FEE: u64 = 50_000_000;

/// Network fee charged on multisig spends. Even, so an even split across
/// two destinations is exact.
pub const SIM_MULTISIG_FEE: u64 = 200_000_000;

// ---------------------------------------------------------------------------
// Encoded transaction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimTx {
    hash: String,
    key: String,
    inputs: Vec<String>,
    multisig_source: Option<String>,
    destinations: Vec<Destination>,
    change_address: Option<String>,
    change_amount: u64,
    fee: u64,
    signers: BTreeSet<String>,
}

impl SimTx {
    fn sealed(
        inputs: Vec<String>,
        multisig_source: Option<String>,
        destinations: Vec<Destination>,
        change_address: Option<String>,
        change_amount: u64,
        fee: u64,
        nonce: u64,
    ) -> Result<Self, WalletError> {
        let body = serde_json::to_vec(&(
            &inputs,
            &multisig_source,
            &destinations,
            &change_address,
            change_amount,
            fee,
        ))
        .map_err(|e| WalletError::MalformedTx(e.to_string()))?;
        let digest = blake3_parts(&[body.as_slice(), &nonce.to_le_bytes()[..]]);
        let key = blake3_parts(&[&b"tx-key"[..], &digest[..]]);
        Ok(Self {
            hash: hex::encode(digest),
            key: hex::encode(key),
            inputs,
            multisig_source,
            destinations,
            change_address,
            change_amount,
            fee,
            signers: BTreeSet::new(),
        })
    }

    fn to_hex(&self) -> Result<String, WalletError> {
        serde_json::to_vec(self)
            .map(hex::encode)
            .map_err(|e| WalletError::MalformedTx(e.to_string()))
    }

    fn from_hex(tx_hex: &str) -> Result<Self, WalletError> {
        let bytes = hex::decode(tx_hex).map_err(|e| WalletError::MalformedTx(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| WalletError::MalformedTx(e.to_string()))
    }

    fn describe(&self) -> TxDescription {
        let dest_sum: u64 = self.destinations.iter().map(|d| d.amount).sum();
        TxDescription {
            hash: self.hash.clone(),
            destinations: self.destinations.clone(),
            change_address: self.change_address.clone(),
            change_amount: self.change_amount,
            fee: self.fee,
            output_sum: dest_sum.saturating_add(self.change_amount),
            key_images: self.inputs.clone(),
            signature_count: self.signers.len(),
        }
    }

    fn built(&self) -> Result<BuiltTx, WalletError> {
        Ok(BuiltTx {
            hash: self.hash.clone(),
            hex: self.to_hex()?,
            key: self.key.clone(),
        })
    }
}

/// Opaque blob a participant hands to its peers during multisig setup and
/// state exchange.
#[derive(Debug, Serialize, Deserialize)]
struct MultisigBlob {
    owner: String,
    wallet_id: String,
    round: u64,
}

impl MultisigBlob {
    fn encode(&self) -> Result<String, WalletError> {
        serde_json::to_vec(self)
            .map(hex::encode)
            .map_err(|e| WalletError::Rpc(e.to_string()))
    }

    fn decode(blob: &str) -> Result<Self, WalletError> {
        let bytes = hex::decode(blob).map_err(|e| WalletError::Rpc(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| WalletError::Rpc(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ChainOutput {
    owner: String,
    amount: u64,
    spent: bool,
}

#[derive(Debug)]
struct ChainTx {
    height: Option<u64>,
}

#[derive(Debug, Default)]
struct ChainState {
    height: u64,
    nonce: u64,
    outputs: HashMap<String, ChainOutput>,
    txs: HashMap<String, ChainTx>,
    multisigs: HashMap<String, BTreeSet<String>>,
}

impl ChainState {
    fn next_nonce(&mut self) -> u64 {
        self.nonce += 1;
        self.nonce
    }

    fn unspent_of(&self, owner: &str) -> Vec<(String, u64)> {
        let mut outs: Vec<(String, u64)> = self
            .outputs
            .iter()
            .filter(|(_, o)| o.owner == owner && !o.spent)
            .map(|(k, o)| (k.clone(), o.amount))
            .collect();
        outs.sort();
        outs
    }

    /// Sums `inputs`, checking each is owned by `owner` and unspent.
    fn input_total(&self, owner: &str, inputs: &[String]) -> Result<u64, WalletError> {
        let mut total = 0u64;
        for key_image in inputs {
            let output = self
                .outputs
                .get(key_image)
                .filter(|o| o.owner == owner)
                .ok_or_else(|| WalletError::UnknownOutput(key_image.clone()))?;
            if output.spent {
                return Err(WalletError::OutputSpent(key_image.clone()));
            }
            total = total.checked_add(output.amount).ok_or(WalletError::Overflow)?;
        }
        Ok(total)
    }
}

/// Shared ledger for simulated wallets.
#[derive(Debug, Default)]
pub struct SimulatedChain {
    state: Mutex<ChainState>,
}

impl SimulatedChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a confirmed output owned by `address`; returns its key image.
    pub fn fund(&self, address: &str, amount: u64) -> String {
        let mut state = self.state.lock();
        let nonce = state.next_nonce();
        let key_image = hex::encode(blake3_parts(&[
            &b"coinbase"[..],
            address.as_bytes(),
            &nonce.to_le_bytes()[..],
        ]));
        state.outputs.insert(
            key_image.clone(),
            ChainOutput {
                owner: address.to_string(),
                amount,
                spent: false,
            },
        );
        key_image
    }

    /// Advances the chain; pool transactions land in the first new block.
    pub fn mine(&self, blocks: u64) {
        let mut state = self.state.lock();
        for _ in 0..blocks {
            state.height += 1;
            let height = state.height;
            for tx in state.txs.values_mut().filter(|t| t.height.is_none()) {
                tx.height = Some(height);
            }
        }
    }

    pub fn height(&self) -> u64 {
        self.state.lock().height
    }

    /// Unspent balance of any address, multisig included.
    pub fn balance(&self, address: &str) -> u64 {
        self.state
            .lock()
            .unspent_of(address)
            .iter()
            .map(|(_, amount)| amount)
            .sum()
    }

    pub fn is_known_tx(&self, hash: &str) -> bool {
        self.state.lock().txs.contains_key(hash)
    }

    fn confirmations(&self, hash: &str) -> Option<u64> {
        let state = self.state.lock();
        state.txs.get(hash).map(|tx| match tx.height {
            Some(h) => state.height.saturating_sub(h) + 1,
            None => 0,
        })
    }

    fn submit(&self, tx: &SimTx) -> Result<String, WalletError> {
        let mut state = self.state.lock();
        if state.txs.contains_key(&tx.hash) {
            return Ok(tx.hash.clone());
        }

        let owner = match &tx.multisig_source {
            Some(address) => {
                let members = state
                    .multisigs
                    .get(address)
                    .ok_or_else(|| WalletError::MultisigNotReady(address.clone()))?;
                let have = tx.signers.intersection(members).count();
                if have < MULTISIG_THRESHOLD {
                    return Err(WalletError::InsufficientSignatures {
                        have,
                        need: MULTISIG_THRESHOLD,
                    });
                }
                address.clone()
            }
            None => {
                let first = tx
                    .inputs
                    .first()
                    .and_then(|ki| state.outputs.get(ki))
                    .ok_or_else(|| WalletError::MalformedTx("no inputs".into()))?;
                first.owner.clone()
            }
        };

        let total_in = state.input_total(&owner, &tx.inputs)?;
        let total_out = tx
            .destinations
            .iter()
            .try_fold(tx.change_amount, |acc, d| acc.checked_add(d.amount))
            .and_then(|sum| sum.checked_add(tx.fee))
            .ok_or(WalletError::Overflow)?;
        if total_in != total_out {
            return Err(WalletError::MalformedTx(format!(
                "inputs {total_in} do not balance outputs plus fee {total_out}"
            )));
        }

        for key_image in &tx.inputs {
            if let Some(output) = state.outputs.get_mut(key_image) {
                output.spent = true;
            }
        }
        let mut created: Vec<(String, u64)> = tx
            .destinations
            .iter()
            .map(|d| (d.address.clone(), d.amount))
            .collect();
        if let (Some(change_address), amount) = (&tx.change_address, tx.change_amount) {
            if amount > 0 {
                created.push((change_address.clone(), amount));
            }
        }
        for (index, (address, amount)) in created.into_iter().enumerate() {
            let key_image = hex::encode(blake3_parts(&[
                tx.hash.as_bytes(),
                &(index as u64).to_le_bytes()[..],
            ]));
            state.outputs.insert(
                key_image,
                ChainOutput {
                    owner: address,
                    amount,
                    spent: false,
                },
            );
        }
        state.txs.insert(tx.hash.clone(), ChainTx { height: None });
        debug!(tx = %tx.hash, inputs = tx.inputs.len(), "simulated chain accepted tx");
        Ok(tx.hash.clone())
    }
}

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct MultisigSession {
    prepared_hex: String,
    address: Option<String>,
    synced: bool,
    export_round: u64,
}

/// One party's wallet on a [`SimulatedChain`].
pub struct SimulatedWallet {
    chain: Arc<SimulatedChain>,
    address: String,
    frozen: Mutex<HashSet<String>>,
    sessions: Mutex<HashMap<String, MultisigSession>>,
}

impl SimulatedWallet {
    pub fn new(chain: Arc<SimulatedChain>, address: impl Into<String>) -> Self {
        Self {
            chain,
            address: address.into(),
            frozen: Mutex::new(HashSet::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn chain(&self) -> &Arc<SimulatedChain> {
        &self.chain
    }

    pub fn balance(&self) -> u64 {
        self.chain.balance(&self.address)
    }

    fn session_address(&self, wallet_id: &str) -> Result<String, WalletError> {
        self.sessions
            .lock()
            .get(wallet_id)
            .and_then(|s| s.address.clone())
            .ok_or_else(|| WalletError::MultisigNotReady(wallet_id.to_string()))
    }

    fn single_signer_tx(
        &self,
        inputs: &[String],
        mut destinations: Vec<Destination>,
    ) -> Result<SimTx, WalletError> {
        let mut state = self.chain.state.lock();
        let total_in = state.input_total(&self.address, inputs)?;
        destinations.retain(|d| d.amount > 0);
        let required = destinations
            .iter()
            .try_fold(SIM_NETWORK_FEE, |acc, d| acc.checked_add(d.amount))
            .ok_or(WalletError::Overflow)?;
        if total_in < required {
            return Err(WalletError::InsufficientFunds {
                required,
                available: total_in,
            });
        }
        let change = total_in - required;
        let nonce = state.next_nonce();
        SimTx::sealed(
            inputs.to_vec(),
            None,
            destinations,
            (change > 0).then(|| self.address.clone()),
            change,
            SIM_NETWORK_FEE,
            nonce,
        )
    }
}

#[async_trait]
impl XmrWallet for SimulatedWallet {
    fn primary_address(&self) -> String {
        self.address.clone()
    }

    async fn unspent_outputs(&self) -> Result<Vec<WalletOutput>, WalletError> {
        let frozen = self.frozen.lock();
        Ok(self
            .chain
            .state
            .lock()
            .unspent_of(&self.address)
            .into_iter()
            .map(|(key_image, amount)| WalletOutput {
                frozen: frozen.contains(&key_image),
                key_image,
                amount,
            })
            .collect())
    }

    async fn freeze_outputs(&self, key_images: &[String]) -> Result<(), WalletError> {
        self.chain.state.lock().input_total(&self.address, key_images)?;
        self.frozen.lock().extend(key_images.iter().cloned());
        Ok(())
    }

    async fn thaw_outputs(&self, key_images: &[String]) -> Result<(), WalletError> {
        let mut frozen = self.frozen.lock();
        for key_image in key_images {
            frozen.remove(key_image);
        }
        Ok(())
    }

    async fn create_reserve_tx(
        &self,
        inputs: &[String],
        reserved_amount: u64,
        trade_fee: u64,
        fee_address: &str,
    ) -> Result<ReserveTx, WalletError> {
        let tx = self.single_signer_tx(
            inputs,
            vec![
                Destination::new(fee_address, trade_fee),
                Destination::new(self.address.clone(), reserved_amount),
            ],
        )?;
        Ok(ReserveTx {
            hash: tx.hash.clone(),
            hex: tx.to_hex()?,
            key: tx.key.clone(),
            key_images: inputs.to_vec(),
            trade_fee,
            reserved_amount,
            return_address: self.address.clone(),
        })
    }

    async fn create_deposit_tx(
        &self,
        inputs: &[String],
        multisig_address: &str,
        deposit: u64,
        trade_fee: u64,
        fee_address: &str,
    ) -> Result<BuiltTx, WalletError> {
        self.single_signer_tx(
            inputs,
            vec![
                Destination::new(multisig_address, deposit),
                Destination::new(fee_address, trade_fee),
            ],
        )?
        .built()
    }

    async fn describe_tx(&self, tx_hex: &str) -> Result<TxDescription, WalletError> {
        Ok(SimTx::from_hex(tx_hex)?.describe())
    }

    async fn submit_tx(&self, tx_hex: &str) -> Result<String, WalletError> {
        self.chain.submit(&SimTx::from_hex(tx_hex)?)
    }

    async fn tx_confirmations(&self, tx_hash: &str) -> Result<Option<u64>, WalletError> {
        Ok(self.chain.confirmations(tx_hash))
    }

    async fn prepare_multisig(&self, wallet_id: &str) -> Result<String, WalletError> {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(wallet_id) {
            return Ok(session.prepared_hex.clone());
        }
        let prepared_hex = MultisigBlob {
            owner: self.address.clone(),
            wallet_id: wallet_id.to_string(),
            round: 0,
        }
        .encode()?;
        sessions.insert(
            wallet_id.to_string(),
            MultisigSession {
                prepared_hex: prepared_hex.clone(),
                address: None,
                synced: false,
                export_round: 0,
            },
        );
        Ok(prepared_hex)
    }

    async fn make_multisig(
        &self,
        wallet_id: &str,
        peer_hexes: &[String],
    ) -> Result<String, WalletError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(wallet_id)
            .ok_or_else(|| WalletError::MultisigNotReady(wallet_id.to_string()))?;

        let mut all: BTreeSet<String> = peer_hexes.iter().cloned().collect();
        all.insert(session.prepared_hex.clone());
        if all.len() != MULTISIG_PARTICIPANTS {
            return Err(WalletError::MultisigNotReady(format!(
                "{wallet_id}: expected {MULTISIG_PARTICIPANTS} distinct participants, got {}",
                all.len()
            )));
        }
        let mut members = BTreeSet::new();
        for blob in &all {
            members.insert(MultisigBlob::decode(blob)?.owner);
        }
        let parts: Vec<&[u8]> = all.iter().map(|s| s.as_bytes()).collect();
        let address = format!("mx{}", hex::encode(&blake3_parts(&parts)[..20]));

        self.chain
            .state
            .lock()
            .multisigs
            .insert(address.clone(), members);
        session.address = Some(address.clone());
        Ok(address)
    }

    async fn export_multisig_hex(&self, wallet_id: &str) -> Result<String, WalletError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(wallet_id)
            .filter(|s| s.address.is_some())
            .ok_or_else(|| WalletError::MultisigNotReady(wallet_id.to_string()))?;
        session.export_round += 1;
        MultisigBlob {
            owner: self.address.clone(),
            wallet_id: wallet_id.to_string(),
            round: session.export_round,
        }
        .encode()
    }

    async fn import_multisig_hex(
        &self,
        wallet_id: &str,
        hexes: &[String],
    ) -> Result<usize, WalletError> {
        let address = self.session_address(wallet_id)?;
        let mut imported = 0;
        for blob in hexes {
            let decoded = MultisigBlob::decode(blob)?;
            if decoded.owner != self.address && decoded.wallet_id == wallet_id {
                imported += 1;
            }
        }
        if imported == 0 {
            return Err(WalletError::MultisigNotSynced(wallet_id.to_string()));
        }
        if let Some(session) = self.sessions.lock().get_mut(wallet_id) {
            session.synced = true;
        }
        Ok(self.chain.state.lock().unspent_of(&address).len())
    }

    async fn multisig_balance(&self, wallet_id: &str) -> Result<u64, WalletError> {
        Ok(self.chain.balance(&self.session_address(wallet_id)?))
    }

    async fn create_multisig_payout(
        &self,
        wallet_id: &str,
        destinations: &[Destination],
        fee_from: &[usize],
    ) -> Result<BuiltTx, WalletError> {
        let address = self.session_address(wallet_id)?;
        let mut state = self.chain.state.lock();
        let inputs = state.unspent_of(&address);
        let balance: u64 = inputs.iter().map(|(_, a)| a).sum();
        let requested = destinations
            .iter()
            .try_fold(0u64, |acc, d| acc.checked_add(d.amount))
            .ok_or(WalletError::Overflow)?;
        if requested > balance || fee_from.is_empty() {
            return Err(WalletError::InsufficientFunds {
                required: requested,
                available: balance,
            });
        }

        let mut outputs = destinations.to_vec();
        let share = SIM_MULTISIG_FEE / fee_from.len() as u64;
        let remainder = SIM_MULTISIG_FEE % fee_from.len() as u64;
        for (n, &index) in fee_from.iter().enumerate() {
            let cut = if n == 0 { share + remainder } else { share };
            let out = outputs
                .get_mut(index)
                .ok_or_else(|| WalletError::MalformedTx(format!("no destination {index}")))?;
            out.amount = out
                .amount
                .checked_sub(cut)
                .ok_or(WalletError::InsufficientFunds {
                    required: cut,
                    available: out.amount,
                })?;
        }

        let change = balance - requested;
        let nonce = state.next_nonce();
        SimTx::sealed(
            inputs.into_iter().map(|(ki, _)| ki).collect(),
            Some(address.clone()),
            outputs,
            (change > 0).then_some(address),
            change,
            SIM_MULTISIG_FEE,
            nonce,
        )?
        .built()
    }

    async fn sign_multisig_tx(
        &self,
        wallet_id: &str,
        tx_hex: &str,
    ) -> Result<String, WalletError> {
        let mut tx = SimTx::from_hex(tx_hex)?;
        let sessions = self.sessions.lock();
        let session = sessions
            .get(wallet_id)
            .ok_or_else(|| WalletError::MultisigNotReady(wallet_id.to_string()))?;
        if session.address.is_none() || session.address != tx.multisig_source {
            return Err(WalletError::MalformedTx(
                "transaction does not spend this multisig wallet".into(),
            ));
        }
        if !session.synced {
            return Err(WalletError::MultisigNotSynced(wallet_id.to_string()));
        }
        tx.signers.insert(self.address.clone());
        tx.to_hex()
    }

    async fn submit_multisig_tx(
        &self,
        wallet_id: &str,
        tx_hex: &str,
    ) -> Result<String, WalletError> {
        let tx = SimTx::from_hex(tx_hex)?;
        let address = self.session_address(wallet_id)?;
        if tx.multisig_source.as_deref() != Some(address.as_str()) {
            return Err(WalletError::MalformedTx(
                "transaction does not spend this multisig wallet".into(),
            ));
        }
        self.chain.submit(&tx)
    }
}
