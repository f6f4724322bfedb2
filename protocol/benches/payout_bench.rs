// Payout verification benchmarks.
//
// Every payout is checked before it is signed, on each of up to three
// nodes, so these run once per trade per party. Covers the cooperative
// split, an early rejection, and the dispute allocation check.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use xmrx_protocol::config::ATOMIC_UNITS_PER_XMR as XMR;
use xmrx_protocol::escrow::{
    verify_dispute_payout_tx, verify_payout_tx, Destination, DisputeAllocation, PayoutTerms,
    TxDescription,
};

const MULTISIG: &str = "multisig-addr";

fn terms() -> PayoutTerms {
    PayoutTerms {
        buyer_payout_address: "buyer-addr".into(),
        seller_payout_address: "seller-addr".into(),
        buyer_deposit: 10 * XMR,
        seller_deposit: 5 * XMR,
        trade_amount: 4 * XMR,
    }
}

fn payout(buyer: u64, seller: u64, fee: u64, change: u64) -> TxDescription {
    TxDescription {
        hash: "payout".into(),
        destinations: vec![
            Destination::new("buyer-addr", buyer),
            Destination::new("seller-addr", seller),
        ],
        change_address: (change > 0).then(|| MULTISIG.to_string()),
        change_amount: change,
        fee,
        output_sum: buyer + seller + change,
        key_images: vec!["ki-1".into(), "ki-2".into()],
        signature_count: 1,
    }
}

fn bench_cooperative_payout(c: &mut Criterion) {
    let terms = terms();
    let tx = payout(13_999_900_000_000, 999_900_000_000, 150_000_000, 50_000_000);

    c.bench_function("payout/verify_cooperative", |b| {
        b.iter(|| verify_payout_tx(black_box(&tx), black_box(&terms), MULTISIG));
    });
}

fn bench_rejected_payout(c: &mut Criterion) {
    let terms = terms();
    // One piconero too many for the buyer.
    let tx = payout(13_999_900_000_001, 999_900_000_000, 150_000_000, 49_999_999);

    c.bench_function("payout/verify_rejected", |b| {
        b.iter(|| verify_payout_tx(black_box(&tx), black_box(&terms), MULTISIG));
    });
}

fn bench_dispute_payout(c: &mut Criterion) {
    let terms = terms();
    let allocation = DisputeAllocation {
        buyer_wins: true,
        buyer_gross: 14 * XMR,
        seller_gross: XMR,
    };
    let fee = 150_000_000;
    let tx = payout(14 * XMR, XMR - fee, fee, 0);

    c.bench_function("payout/verify_dispute", |b| {
        b.iter(|| {
            verify_dispute_payout_tx(
                black_box(&tx),
                black_box(&terms),
                black_box(&allocation),
                15 * XMR,
                MULTISIG,
            )
        });
    });
}

criterion_group!(
    benches,
    bench_cooperative_payout,
    bench_rejected_payout,
    bench_dispute_payout,
);
criterion_main!(benches);
