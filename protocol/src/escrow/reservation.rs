//! Fund reservation.
//!
//! Before an offer is published (maker) or taken (taker), the trader picks
//! unspent outputs covering deposit plus fee, builds a reserve tx over them
//! and freezes them. Selection, creation and freezing run under a single
//! async mutex: two trades reserving at once always end up with disjoint
//! output sets.
//!
//! The arbitrator keeps a [`KeyImageRegistry`] so the same outputs cannot
//! back two live offers or trades.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::tx::{ReserveTx, TxDescription};
use super::EscrowError;
use crate::config::NETWORK_FEE_ALLOWANCE;
use crate::wallet::XmrWallet;

pub struct ReservationService {
    wallet: Arc<dyn XmrWallet>,
    fee_address: String,
    select_lock: tokio::sync::Mutex<()>,
    reservations: DashMap<String, ReserveTx>,
}

impl ReservationService {
    pub fn new(wallet: Arc<dyn XmrWallet>, fee_address: impl Into<String>) -> Self {
        Self {
            wallet,
            fee_address: fee_address.into(),
            select_lock: tokio::sync::Mutex::new(()),
            reservations: DashMap::new(),
        }
    }

    /// Reserves `amount + trade_fee` (plus network fee headroom) under
    /// `reservation_id`. Reserving an id twice returns the first proof.
    pub async fn reserve(
        &self,
        reservation_id: &str,
        amount: u64,
        trade_fee: u64,
    ) -> Result<ReserveTx, EscrowError> {
        let _guard = self.select_lock.lock().await;
        if let Some(existing) = self.reservations.get(reservation_id) {
            return Ok(existing.clone());
        }

        let required = amount
            .checked_add(trade_fee)
            .and_then(|v| v.checked_add(NETWORK_FEE_ALLOWANCE))
            .ok_or(EscrowError::Arithmetic("reservation amount"))?;

        let mut candidates: Vec<_> = self
            .wallet
            .unspent_outputs()
            .await?
            .into_iter()
            .filter(|o| !o.frozen)
            .collect();
        candidates.sort_by(|a, b| b.amount.cmp(&a.amount).then(a.key_image.cmp(&b.key_image)));

        let mut selected = Vec::new();
        let mut covered = 0u64;
        for output in candidates {
            if covered >= required {
                break;
            }
            covered = covered
                .checked_add(output.amount)
                .ok_or(EscrowError::Arithmetic("selected outputs"))?;
            selected.push(output.key_image);
        }
        if covered < required {
            return Err(EscrowError::InsufficientFunds {
                required,
                available: covered,
            });
        }

        let reserve = self
            .wallet
            .create_reserve_tx(&selected, amount, trade_fee, &self.fee_address)
            .await?;
        self.wallet.freeze_outputs(&selected).await?;
        self.reservations
            .insert(reservation_id.to_string(), reserve.clone());

        info!(
            reservation = reservation_id,
            amount,
            trade_fee,
            inputs = selected.len(),
            "funds reserved"
        );
        Ok(reserve)
    }

    /// Thaws the outputs of a reservation that will not be spent.
    pub async fn release(&self, reservation_id: &str) -> Result<(), EscrowError> {
        let (_, reserve) = self
            .reservations
            .remove(reservation_id)
            .ok_or_else(|| EscrowError::UnknownReservation(reservation_id.to_string()))?;
        self.wallet.thaw_outputs(&reserve.key_images).await?;
        info!(reservation = reservation_id, "reservation released");
        Ok(())
    }

    /// Drops bookkeeping for outputs that a deposit has consumed.
    pub fn forget(&self, reservation_id: &str) {
        if self.reservations.remove(reservation_id).is_some() {
            debug!(reservation = reservation_id, "reservation consumed");
        }
    }

    /// Re-registers a reservation loaded from storage after a restart.
    pub fn restore(&self, reservation_id: &str, reserve: ReserveTx) {
        self.reservations.insert(reservation_id.to_string(), reserve);
    }

    pub fn get(&self, reservation_id: &str) -> Option<ReserveTx> {
        self.reservations.get(reservation_id).map(|r| r.clone())
    }

    pub fn fee_address(&self) -> &str {
        &self.fee_address
    }
}

/// Checks a reserve proof sent by a trader.
pub fn verify_reserve_tx(
    tx: &TxDescription,
    reserve: &ReserveTx,
    expected_amount: u64,
    expected_fee: u64,
    fee_address: &str,
) -> Result<(), EscrowError> {
    if tx.hash != reserve.hash {
        return Err(EscrowError::HashMismatch {
            what: "reserve tx",
            expected: reserve.hash.clone(),
            actual: tx.hash.clone(),
        });
    }
    if tx.key_images.is_empty() {
        return Err(EscrowError::MissingKeyImages);
    }
    let mut described = tx.key_images.clone();
    let mut claimed = reserve.key_images.clone();
    described.sort();
    claimed.sort();
    if described != claimed {
        return Err(EscrowError::KeyImageMismatch);
    }

    let fee_paid = tx.amount_to(fee_address);
    if fee_paid < expected_fee {
        return Err(EscrowError::InsufficientOutput {
            what: "reserve trade fee",
            address: fee_address.to_string(),
            expected: expected_fee,
            actual: fee_paid,
        });
    }
    let returned = tx.amount_to(&reserve.return_address);
    if returned < expected_amount {
        return Err(EscrowError::InsufficientOutput {
            what: "reserved amount",
            address: reserve.return_address.clone(),
            expected: expected_amount,
            actual: returned,
        });
    }
    Ok(())
}

/// Arbitrator-side record of which offer or trade each key image backs.
#[derive(Debug, Default)]
pub struct KeyImageRegistry {
    claims: Mutex<HashMap<String, String>>,
}

impl KeyImageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims all `key_images` for `holder`, or none of them. Re-claiming
    /// by the same holder is fine.
    pub fn claim(&self, holder: &str, key_images: &[String]) -> Result<(), EscrowError> {
        let mut claims = self.claims.lock();
        for key_image in key_images {
            if let Some(existing) = claims.get(key_image) {
                if existing != holder {
                    return Err(EscrowError::KeyImageReused {
                        key_image: key_image.clone(),
                        holder: existing.clone(),
                    });
                }
            }
        }
        for key_image in key_images {
            claims.insert(key_image.clone(), holder.to_string());
        }
        Ok(())
    }

    pub fn release_holder(&self, holder: &str) {
        self.claims.lock().retain(|_, h| h != holder);
    }

    pub fn holder_of(&self, key_image: &str) -> Option<String> {
        self.claims.lock().get(key_image).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ATOMIC_UNITS_PER_XMR as XMR;
    use crate::wallet::{SimulatedChain, SimulatedWallet};
    use std::collections::HashSet;

    fn funded_service(amounts: &[u64]) -> (Arc<SimulatedWallet>, Arc<ReservationService>) {
        let chain = SimulatedChain::new();
        let wallet = Arc::new(SimulatedWallet::new(chain.clone(), "trader"));
        for amount in amounts {
            chain.fund("trader", *amount);
        }
        let service = Arc::new(ReservationService::new(wallet.clone(), "fees"));
        (wallet, service)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_are_disjoint() {
        let (wallet, service) = funded_service(&[2 * XMR, 2 * XMR, 2 * XMR, 2 * XMR]);

        let mut handles = Vec::new();
        for i in 0..4 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service.reserve(&format!("trade-{i}"), XMR, 1_000).await
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            let reserve = handle.await.unwrap().unwrap();
            for ki in reserve.key_images {
                assert!(seen.insert(ki), "key image reserved twice");
            }
        }
        // Everything the wallet owns is now frozen.
        let outputs = wallet.unspent_outputs().await.unwrap();
        assert!(outputs.iter().all(|o| o.frozen));
    }

    #[tokio::test]
    async fn test_reservation_fails_when_unfrozen_funds_run_out() {
        let (_wallet, service) = funded_service(&[2 * XMR]);
        service.reserve("a", XMR, 0).await.unwrap();
        let err = service.reserve("b", XMR, 0).await.unwrap_err();
        assert!(matches!(err, EscrowError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn test_release_thaws_and_reserve_is_idempotent() {
        let (wallet, service) = funded_service(&[2 * XMR]);
        let first = service.reserve("a", XMR, 0).await.unwrap();
        let again = service.reserve("a", XMR, 0).await.unwrap();
        assert_eq!(first, again);

        service.release("a").await.unwrap();
        assert!(wallet.unspent_outputs().await.unwrap().iter().all(|o| !o.frozen));
        assert!(matches!(
            service.release("a").await,
            Err(EscrowError::UnknownReservation(_))
        ));
    }

    #[tokio::test]
    async fn test_verify_reserve_tx() {
        let (wallet, service) = funded_service(&[3 * XMR]);
        let reserve = service.reserve("offer-1", 2 * XMR, 5_000).await.unwrap();
        let described = wallet.describe_tx(&reserve.hex).await.unwrap();

        verify_reserve_tx(&described, &reserve, 2 * XMR, 5_000, "fees").unwrap();

        assert!(matches!(
            verify_reserve_tx(&described, &reserve, 2 * XMR + 1, 5_000, "fees"),
            Err(EscrowError::InsufficientOutput { .. })
        ));
        assert!(matches!(
            verify_reserve_tx(&described, &reserve, 2 * XMR, 5_001, "fees"),
            Err(EscrowError::InsufficientOutput { .. })
        ));

        let mut forged = reserve.clone();
        forged.key_images = vec!["someone-else".into()];
        assert_eq!(
            verify_reserve_tx(&described, &forged, 2 * XMR, 5_000, "fees"),
            Err(EscrowError::KeyImageMismatch)
        );
    }

    #[test]
    fn test_key_image_registry_rejects_reuse() {
        let registry = KeyImageRegistry::new();
        registry
            .claim("offer-1/maker", &["k1".into(), "k2".into()])
            .unwrap();
        registry.claim("offer-1/maker", &["k1".into()]).unwrap();

        let err = registry
            .claim("offer-2/maker", &["k3".into(), "k2".into()])
            .unwrap_err();
        assert_eq!(
            err,
            EscrowError::KeyImageReused {
                key_image: "k2".into(),
                holder: "offer-1/maker".into()
            }
        );
        // All-or-nothing: k3 was not claimed.
        assert_eq!(registry.holder_of("k3"), None);

        registry.release_holder("offer-1/maker");
        registry.claim("offer-2/maker", &["k2".into()]).unwrap();
    }
}
