//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify critical invariants:
//! - Value conservation: tokens only enter through payments and adjustments
//! - Non-negativity: balances and stock quantities never drop below zero
//! - Per-account history: balance - opening balance == net of applied records
//! - Draw exclusivity: one prize per ticket, one ticket per prize

use chrono::Utc;
use jeton_ledger::{
    draw::select_winners,
    types::{AccountId, PrizeId, Ticket, TicketId, TombolaId},
    AccountKind, Config, ErrorKind, Ledger, ManualEntry, StandCategory, TransactionKind,
};
use proptest::prelude::*;
use rand::{rngs::StdRng, SeedableRng};
use rust_decimal::Decimal;
use std::collections::HashSet;
use tempfile::TempDir;

/// One step against the fixture
#[derive(Debug, Clone)]
enum Step {
    /// Child `0` or `1` buys at the food (false) or activity (true) stand
    Purchase { child: usize, activity: bool, quantity: i64 },
    /// Parent tops up child `0` or `1`; child `1` is never linked
    Transfer { child: usize, amount: i64 },
    /// Parent buys tokens
    Mint { tokens: i64 },
    /// Child buys a tombola ticket
    Ticket { child: usize },
    /// Desk correction on the parent
    Adjust { amount: i64 },
}

/// Strategy for generating steps
fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0usize..2, any::<bool>(), 1i64..6).prop_map(|(child, activity, quantity)| Step::Purchase {
            child,
            activity,
            quantity
        }),
        (0usize..2, 1i64..30).prop_map(|(child, amount)| Step::Transfer { child, amount }),
        (1i64..50).prop_map(|tokens| Step::Mint { tokens }),
        (0usize..2).prop_map(|child| Step::Ticket { child }),
        (-10i64..10)
            .prop_filter("non-zero", |amount| *amount != 0)
            .prop_map(|amount| Step::Adjust { amount }),
    ]
}

/// Create test ledger with temp directory
async fn create_test_ledger() -> (Ledger, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();

    (Ledger::open(config).await.unwrap(), temp_dir)
}

fn ticket(id: u64) -> Ticket {
    Ticket {
        id: TicketId::new(id),
        tombola_id: TombolaId::new(1),
        owner_account_id: AccountId::new(1),
        serial_number: format!("T-{}", id),
        price_tokens: 2,
        won: false,
        purchased_at: Utc::now(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: Any sequence of operations conserves value and keeps balances non-negative
    #[test]
    fn prop_operations_conserve_value(
        opening in 0i64..40,
        stock in 0i64..20,
        steps in prop::collection::vec(step_strategy(), 1..25)
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger().await;

            let parent = ledger.create_account("Parent", AccountKind::Parent, opening).await.unwrap();
            let linked = ledger.create_account("Linked", AccountKind::Child, 0).await.unwrap();
            let unlinked = ledger.create_account("Unlinked", AccountKind::Child, 5).await.unwrap();
            ledger.link_child(parent.id, linked.id).await.unwrap();
            let children = [linked.id, unlinked.id];

            let food = ledger.create_stand("Crepes", StandCategory::Food).await.unwrap();
            ledger.add_stock_line(food.id, "Crepe", stock, 2).await.unwrap();
            let game = ledger.create_stand("Chamboule-tout", StandCategory::Activity).await.unwrap();
            ledger.add_stock_line(game.id, "Partie", stock, 1).await.unwrap();
            let tombola = ledger.create_tombola(1, "Tombola").await.unwrap();

            for (n, step) in steps.iter().enumerate() {
                let result = match step.clone() {
                    Step::Purchase { child, activity: true, quantity } => ledger
                        .purchase_with_tokens(children[child], game.id, quantity, None)
                        .await
                        .map(|_| ()),
                    Step::Purchase { child, activity: false, quantity } => ledger
                        .purchase_with_tokens(children[child], food.id, quantity, None)
                        .await
                        .map(|_| ()),
                    Step::Transfer { child, amount } => ledger
                        .transfer_tokens(parent.id, children[child], amount)
                        .await
                        .map(|_| ()),
                    Step::Mint { tokens } => ledger
                        .buy_tokens(parent.id, Decimal::new(tokens * 50, 2), tokens, format!("pi_{}", n))
                        .await
                        .map(|_| ()),
                    Step::Ticket { child } => ledger
                        .buy_ticket(children[child], tombola.id)
                        .await
                        .map(|_| ()),
                    Step::Adjust { amount } => ledger
                        .post_manual_adjustment(ManualEntry {
                            account_id: parent.id,
                            amount,
                            kind: TransactionKind::Payment,
                            description: "Desk correction".to_string(),
                            stand_id: None,
                        })
                        .await
                        .map(|_| ()),
                };

                if let Err(err) = result {
                    prop_assert!(matches!(
                        err.kind(),
                        ErrorKind::InsufficientBalance
                            | ErrorKind::StockExhausted
                            | ErrorKind::RelationshipViolation
                    ), "unexpected error {:?}", err);
                }

                let totals = ledger.query().value_totals().unwrap();
                prop_assert!(totals.is_conserved(), "not conserved after {:?}: {:?}", step, totals);
            }

            for id in [parent.id, linked.id, unlinked.id] {
                let account = ledger.query().account(id).unwrap();
                prop_assert!(account.balance_tokens >= 0);
                prop_assert!(ledger.query().verify_conservation(id).unwrap().balanced);
            }
            for stand in [food.id, game.id] {
                for line in ledger.query().stock_lines(stand).unwrap() {
                    prop_assert!(line.quantity >= 0);
                    prop_assert!(line.quantity <= stock);
                }
            }

            // The unlinked child never receives a transfer
            let received = ledger
                .query()
                .account_history(unlinked.id)
                .unwrap()
                .iter()
                .filter(|r| r.kind == TransactionKind::Transfer)
                .count();
            prop_assert_eq!(received, 0);

            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }

    /// Property: A persisted draw awards min(tickets, prizes) distinct pairs
    #[test]
    fn prop_draw_is_exclusive(tickets in 0usize..8, prizes in 0usize..8, seed in any::<u64>()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger().await;
            let buyer = ledger.create_account("Lea", AccountKind::Child, 100).await.unwrap();
            let tombola = ledger.create_tombola(1, "Tombola").await.unwrap();
            for n in 0..prizes {
                ledger
                    .add_prize(tombola.id, format!("Lot {}", n), "", Decimal::ONE)
                    .await
                    .unwrap();
            }
            for _ in 0..tickets {
                ledger.buy_ticket(buyer.id, tombola.id).await.unwrap();
            }

            match ledger.draw_with_seed(tombola.id, seed).await {
                Ok(receipt) => {
                    prop_assert_eq!(receipt.winners.len(), tickets.min(prizes));
                    prop_assert_eq!(receipt.unassigned_prizes.len(), prizes - receipt.winners.len());
                }
                Err(err) => {
                    prop_assert!(tickets == 0 || prizes == 0);
                    prop_assert_eq!(err.kind(), ErrorKind::ValidationError);
                }
            }

            let winners = ledger.query().winners(tombola.id).unwrap();
            let won_tickets: HashSet<_> = winners.iter().map(|w| w.ticket_id).collect();
            let won_prizes: HashSet<_> = winners.iter().map(|w| w.prize_id).collect();
            prop_assert_eq!(won_tickets.len(), winners.len());
            prop_assert_eq!(won_prizes.len(), winners.len());

            let marked = ledger
                .query()
                .tickets(tombola.id)
                .unwrap()
                .iter()
                .filter(|t| t.won)
                .count();
            prop_assert_eq!(marked, winners.len());

            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Property: Pure selection never repeats a ticket and follows prize order
    #[test]
    fn prop_selection_is_bounded(tickets in 0u64..40, prizes in 0u64..40, seed in any::<u64>()) {
        let pool: Vec<Ticket> = (1..=tickets).map(ticket).collect();
        let lots: Vec<PrizeId> = (1..=prizes).map(PrizeId::new).collect();
        let mut rng = StdRng::seed_from_u64(seed);

        let assignments = select_winners(&pool, &lots, &mut rng).unwrap();

        prop_assert_eq!(assignments.len() as u64, tickets.min(prizes));
        let distinct: HashSet<_> = assignments.iter().map(|a| a.ticket_id).collect();
        prop_assert_eq!(distinct.len(), assignments.len());
        for (assignment, prize) in assignments.iter().zip(&lots) {
            prop_assert_eq!(assignment.prize_id, *prize);
        }
    }

    /// Property: Selection is a function of the seed
    #[test]
    fn prop_selection_is_reproducible(tickets in 1u64..30, seed in any::<u64>()) {
        let pool: Vec<Ticket> = (1..=tickets).map(ticket).collect();
        let lots: Vec<PrizeId> = (1..=3).map(PrizeId::new).collect();

        let first = select_winners(&pool, &lots, &mut StdRng::seed_from_u64(seed)).unwrap();
        let second = select_winners(&pool, &lots, &mut StdRng::seed_from_u64(seed)).unwrap();
        prop_assert_eq!(first, second);
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[tokio::test]
    async fn test_won_ticket_is_rejected_by_selection() {
        let mut pool = vec![ticket(1), ticket(2)];
        pool[1].won = true;
        let mut rng = StdRng::seed_from_u64(7);

        assert!(select_winners(&pool, &[PrizeId::new(1)], &mut rng).is_err());
    }

    #[tokio::test]
    async fn test_same_seed_same_winners() {
        let mut receipts = Vec::new();
        for _ in 0..2 {
            let (ledger, _temp) = create_test_ledger().await;
            let buyer = ledger.create_account("Lea", AccountKind::Child, 100).await.unwrap();
            let tombola = ledger.create_tombola(1, "Tombola").await.unwrap();
            for name in ["Velo", "Livre"] {
                ledger.add_prize(tombola.id, name, "", Decimal::ONE).await.unwrap();
            }
            for _ in 0..10 {
                ledger.buy_ticket(buyer.id, tombola.id).await.unwrap();
            }
            receipts.push(ledger.draw_with_seed(tombola.id, 42).await.unwrap());
        }

        assert_eq!(receipts[0].digest, receipts[1].digest);
    }
}
