//! End-to-end kermesse scenarios through the async ledger API

use jeton_ledger::{
    payment::{OfflinePaymentProvider, PaymentConfirmation, PaymentStatus},
    AccountKind, Config, Error, ErrorKind, Ledger, ManualEntry, StandCategory, TransactionKind,
};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Create test ledger with temp directory
async fn create_test_ledger() -> (Ledger, TempDir) {
    create_test_ledger_with(|_| {}).await
}

async fn create_test_ledger_with(tweak: impl FnOnce(&mut Config)) -> (Ledger, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    tweak(&mut config);

    (Ledger::open(config).await.unwrap(), temp_dir)
}

#[tokio::test]
async fn test_purchase_at_food_stand() {
    let (ledger, _temp) = create_test_ledger().await;
    let buyer = ledger.create_account("Lea", AccountKind::Child, 10).await.unwrap();
    let stand = ledger.create_stand("Crepes", StandCategory::Food).await.unwrap();
    let line = ledger.add_stock_line(stand.id, "Crepe", 5, 2).await.unwrap();

    let outcome = ledger
        .purchase_with_tokens(buyer.id, stand.id, 3, None)
        .await
        .unwrap();

    assert_eq!(outcome.total_cost, 6);
    assert_eq!(outcome.new_balance, 4);

    let query = ledger.query();
    assert_eq!(query.account(buyer.id).unwrap().balance_tokens, 4);
    assert_eq!(query.stock_lines(stand.id).unwrap()[0].quantity, 2);
    assert_eq!(query.stand(stand.id).unwrap().tokens_collected, 6);

    let history = query.account_history(buyer.id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].kind, TransactionKind::Purchase);
    assert_eq!(history[0].amount.abs(), 6);
    assert_eq!(history[0].amount, -6);
    assert_eq!(query.stand_history(stand.id).unwrap(), history);
    assert_eq!(line.price_tokens, 2);
}

#[tokio::test]
async fn test_transfer_beyond_balance_is_rejected() {
    let (ledger, _temp) = create_test_ledger().await;
    let parent = ledger.create_account("Parent", AccountKind::Parent, 20).await.unwrap();
    let child = ledger.create_account("Child", AccountKind::Child, 0).await.unwrap();
    ledger.link_child(parent.id, child.id).await.unwrap();

    let err = ledger
        .transfer_tokens(parent.id, child.id, 25)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InsufficientBalance);
    assert_eq!(ledger.query().account(parent.id).unwrap().balance_tokens, 20);
    assert_eq!(ledger.query().account(child.id).unwrap().balance_tokens, 0);
    assert!(ledger.query().account_history(parent.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_transfer_to_unlinked_child_is_rejected() {
    let (ledger, _temp) = create_test_ledger().await;
    let parent = ledger.create_account("Parent", AccountKind::Parent, 0).await.unwrap();
    let stranger = ledger.create_account("Other", AccountKind::Child, 0).await.unwrap();

    // Relationship is checked before the (insufficient) balance
    let err = ledger
        .transfer_tokens(parent.id, stranger.id, 5)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RelationshipViolation { .. }));
    assert_eq!(err.to_body().kind, ErrorKind::RelationshipViolation);
}

#[tokio::test]
async fn test_transfer_moves_tokens() {
    let (ledger, _temp) = create_test_ledger().await;
    let parent = ledger.create_account("Parent", AccountKind::Parent, 20).await.unwrap();
    let child = ledger.create_account("Child", AccountKind::Child, 1).await.unwrap();
    ledger.link_child(parent.id, child.id).await.unwrap();

    let outcome = ledger.transfer_tokens(parent.id, child.id, 15).await.unwrap();
    assert_eq!(outcome.parent_balance, 5);
    assert_eq!(outcome.child_balance, 16);

    // One record, visible from both sides
    assert_eq!(ledger.query().account_history(child.id).unwrap().len(), 1);
    assert!(ledger.query().verify_conservation(parent.id).unwrap().balanced);
    assert!(ledger.query().verify_conservation(child.id).unwrap().balanced);
}

#[tokio::test]
async fn test_draw_assigns_distinct_tickets() {
    let (ledger, _temp) = create_test_ledger().await;
    let tombola = ledger.create_tombola(1, "Tombola").await.unwrap();
    let p1 = ledger
        .add_prize(tombola.id, "Velo", "", Decimal::new(120, 0))
        .await
        .unwrap();
    let p2 = ledger
        .add_prize(tombola.id, "Panier", "", Decimal::new(30, 0))
        .await
        .unwrap();

    let mut tickets = Vec::new();
    for name in ["A", "B", "C"] {
        let buyer = ledger.create_account(name, AccountKind::Child, 2).await.unwrap();
        tickets.push(ledger.buy_ticket(buyer.id, tombola.id).await.unwrap().ticket);
    }

    let receipt = ledger.draw(tombola.id).await.unwrap();

    assert_eq!(receipt.winners.len(), 2);
    assert_eq!(receipt.eligible_tickets, 3);
    assert!(receipt.unassigned_prizes.is_empty());
    assert_eq!(receipt.winners[0].prize_id, p1.id);
    assert_eq!(receipt.winners[1].prize_id, p2.id);
    assert_ne!(receipt.winners[0].ticket_id, receipt.winners[1].ticket_id);

    let stored = ledger.query().tickets(tombola.id).unwrap();
    let won: Vec<_> = stored.iter().filter(|t| t.won).collect();
    assert_eq!(won.len(), 2);
    assert_eq!(stored.iter().filter(|t| !t.won).count(), 1);

    let winners = ledger.query().winners(tombola.id).unwrap();
    assert_eq!(winners, receipt.winners);
    assert_eq!(ledger.query().tombola(tombola.id).unwrap().draw_count, 1);
}

#[tokio::test]
async fn test_redraw_only_awards_open_prizes() {
    let (ledger, _temp) = create_test_ledger().await;
    let tombola = ledger.create_tombola(1, "Tombola").await.unwrap();
    for name in ["Velo", "Livre", "Peluche"] {
        ledger
            .add_prize(tombola.id, name, "", Decimal::ONE)
            .await
            .unwrap();
    }
    let buyer = ledger.create_account("Lea", AccountKind::Child, 10).await.unwrap();
    ledger.buy_ticket(buyer.id, tombola.id).await.unwrap();

    let first = ledger.draw_with_seed(tombola.id, 3).await.unwrap();
    assert_eq!(first.winners.len(), 1);
    assert_eq!(first.unassigned_prizes.len(), 2);

    // No unwon ticket left
    let err = ledger.draw(tombola.id).await.unwrap_err();
    assert!(matches!(err, Error::NoTicketsAvailable(_)));

    ledger.buy_ticket(buyer.id, tombola.id).await.unwrap();
    ledger.buy_ticket(buyer.id, tombola.id).await.unwrap();
    let second = ledger.draw(tombola.id).await.unwrap();
    assert_eq!(second.winners.len(), 2);

    let winners = ledger.query().winners(tombola.id).unwrap();
    let prizes: HashSet<_> = winners.iter().map(|w| w.prize_id).collect();
    let tickets: HashSet<_> = winners.iter().map(|w| w.ticket_id).collect();
    assert_eq!(prizes.len(), 3);
    assert_eq!(tickets.len(), 3);

    let err = ledger.draw(tombola.id).await.unwrap_err();
    assert!(matches!(err, Error::NoTicketsAvailable(_) | Error::NoLotsAvailable(_)));
    assert_eq!(ledger.query().tickets_of(tombola.id, buyer.id).unwrap().len(), 3);
}

#[tokio::test]
async fn test_draw_without_prizes() {
    let (ledger, _temp) = create_test_ledger().await;
    let tombola = ledger.create_tombola(1, "Tombola").await.unwrap();
    let buyer = ledger.create_account("Lea", AccountKind::Child, 2).await.unwrap();
    ledger.buy_ticket(buyer.id, tombola.id).await.unwrap();

    let err = ledger.draw(tombola.id).await.unwrap_err();
    assert!(matches!(err, Error::NoLotsAvailable(_)));
    assert_eq!(err.kind(), ErrorKind::ValidationError);
}

#[tokio::test]
async fn test_activity_purchase_awards_points() {
    let (ledger, _temp) = create_test_ledger().await;
    let child = ledger.create_account("Lea", AccountKind::Child, 10).await.unwrap();
    let stand = ledger.create_stand("Peche a la ligne", StandCategory::Activity).await.unwrap();
    ledger.add_stock_line(stand.id, "Partie", 50, 1).await.unwrap();

    let outcome = ledger
        .purchase_with_tokens(child.id, stand.id, 2, None)
        .await
        .unwrap();

    assert_eq!(outcome.points_awarded, 20);
    assert_eq!(ledger.query().account(child.id).unwrap().accumulated_points, 20);
    assert_eq!(ledger.query().stand(stand.id).unwrap().points_awarded, 20);
}

#[tokio::test]
async fn test_stock_exhaustion_is_atomic() {
    let (ledger, _temp) = create_test_ledger().await;
    let buyer = ledger.create_account("Lea", AccountKind::Child, 50).await.unwrap();
    let stand = ledger.create_stand("Buvette", StandCategory::Drink).await.unwrap();
    ledger.add_stock_line(stand.id, "Sirop", 2, 1).await.unwrap();

    let err = ledger
        .purchase_with_tokens(buyer.id, stand.id, 3, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StockExhausted);

    let query = ledger.query();
    assert_eq!(query.account(buyer.id).unwrap().balance_tokens, 50);
    assert_eq!(query.stand(stand.id).unwrap().tokens_collected, 0);
    assert_eq!(query.stock_lines(stand.id).unwrap()[0].quantity, 2);
    assert!(query.stand_history(stand.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_stand_without_stock() {
    let (ledger, _temp) = create_test_ledger().await;
    let buyer = ledger.create_account("Lea", AccountKind::Child, 50).await.unwrap();
    let stand = ledger.create_stand("Vide", StandCategory::Food).await.unwrap();

    let err = ledger
        .purchase_with_tokens(buyer.id, stand.id, 1, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoStock(_)));
}

#[tokio::test]
async fn test_stock_selection_by_product() {
    let (ledger, _temp) = create_test_ledger_with(|config| {
        config.stands.stock_selection = jeton_ledger::config::StockSelection::ByProduct;
    })
    .await;
    let buyer = ledger.create_account("Lea", AccountKind::Child, 50).await.unwrap();
    let stand = ledger.create_stand("Buvette", StandCategory::Drink).await.unwrap();
    ledger.add_stock_line(stand.id, "Sirop", 10, 1).await.unwrap();
    let cafe = ledger.add_stock_line(stand.id, "Cafe", 10, 2).await.unwrap();

    let outcome = ledger
        .purchase_with_tokens(buyer.id, stand.id, 2, Some(cafe.id))
        .await
        .unwrap();
    assert_eq!(outcome.total_cost, 4);

    let lines = ledger.query().stock_lines(stand.id).unwrap();
    assert_eq!(lines[0].quantity, 10);
    assert_eq!(lines[1].quantity, 8);
}

#[tokio::test]
async fn test_restock_then_sell() {
    let (ledger, _temp) = create_test_ledger().await;
    let buyer = ledger.create_account("Lea", AccountKind::Child, 10).await.unwrap();
    let stand = ledger.create_stand("Crepes", StandCategory::Food).await.unwrap();
    let line = ledger.add_stock_line(stand.id, "Crepe", 0, 1).await.unwrap();

    assert!(ledger.purchase_with_tokens(buyer.id, stand.id, 1, None).await.is_err());
    assert!(ledger.adjust_stock(line.id, -1).await.is_err());

    let line = ledger.adjust_stock(line.id, 4).await.unwrap();
    assert_eq!(line.quantity, 4);
    ledger.purchase_with_tokens(buyer.id, stand.id, 4, None).await.unwrap();
}

#[tokio::test]
async fn test_value_is_conserved_across_operations() {
    let (ledger, _temp) = create_test_ledger().await;
    let parent = ledger.create_account("Parent", AccountKind::Parent, 5).await.unwrap();
    let child = ledger.create_account("Child", AccountKind::Child, 0).await.unwrap();
    ledger.link_child(parent.id, child.id).await.unwrap();
    let stand = ledger.create_stand("Crepes", StandCategory::Food).await.unwrap();
    ledger.add_stock_line(stand.id, "Crepe", 100, 2).await.unwrap();
    let tombola = ledger.create_tombola(1, "Tombola").await.unwrap();

    ledger
        .buy_tokens(parent.id, Decimal::new(1000, 2), 20, "pi_a")
        .await
        .unwrap();
    ledger.transfer_tokens(parent.id, child.id, 12).await.unwrap();
    ledger.purchase_with_tokens(child.id, stand.id, 3, None).await.unwrap();
    ledger.buy_ticket(child.id, tombola.id).await.unwrap();
    ledger
        .post_manual_adjustment(ManualEntry {
            account_id: parent.id,
            amount: 3,
            kind: TransactionKind::Payment,
            description: "Cash at the desk".to_string(),
            stand_id: None,
        })
        .await
        .unwrap();
    ledger
        .record_manual_transaction(ManualEntry {
            account_id: child.id,
            amount: 100,
            kind: TransactionKind::Utilisation,
            description: "Paper voucher".to_string(),
            stand_id: Some(stand.id),
        })
        .await
        .unwrap();

    let totals = ledger.query().value_totals().unwrap();
    assert_eq!(totals.tokens_minted, 20);
    assert_eq!(totals.manual_adjustments, 3);
    assert_eq!(totals.stand_tokens, 6);
    assert_eq!(totals.tombola_tokens, 2);
    assert!(totals.is_conserved());

    for account in [parent.id, child.id] {
        assert!(ledger.query().verify_conservation(account).unwrap().balanced);
    }

    let summary = ledger.query().transaction_summary().unwrap();
    assert_eq!(summary.total_records, 6);
    assert_eq!(summary.get(TransactionKind::Transfer).unwrap().debited, 12);
}

#[tokio::test]
async fn test_duplicate_payment_credits_once() {
    let (ledger, _temp) = create_test_ledger().await;
    let parent = ledger.create_account("Parent", AccountKind::Parent, 0).await.unwrap();

    ledger
        .buy_tokens(parent.id, Decimal::new(500, 2), 10, "pi_dup")
        .await
        .unwrap();
    let err = ledger
        .buy_tokens(parent.id, Decimal::new(500, 2), 10, "pi_dup")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::DuplicatePayment(_)));
    assert_eq!(ledger.query().account(parent.id).unwrap().balance_tokens, 10);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();

    let ledger = Ledger::open(config.clone()).await.unwrap();
    let account = ledger.create_account("Lea", AccountKind::Child, 7).await.unwrap();
    ledger.shutdown().await.unwrap();

    let ledger = Ledger::open(config).await.unwrap();
    assert_eq!(ledger.query().account(account.id).unwrap().balance_tokens, 7);
    let next = ledger.create_account("Tom", AccountKind::Child, 0).await.unwrap();
    assert!(next.id > account.id);
}

#[tokio::test]
async fn test_payment_confirmed_after_restart() {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();

    let ledger = Ledger::open(config.clone())
        .await
        .unwrap()
        .with_payment_provider(Arc::new(OfflinePaymentProvider));
    let parent = ledger.create_account("Parent", AccountKind::Parent, 0).await.unwrap();
    let intent = ledger
        .initiate_token_purchase(parent.id, Decimal::new(1000, 2), 20)
        .await
        .unwrap();
    ledger.shutdown().await.unwrap();

    let ledger = Ledger::open(config)
        .await
        .unwrap()
        .with_payment_provider(Arc::new(OfflinePaymentProvider));
    assert_eq!(ledger.query().pending_payment_orders().unwrap().len(), 1);

    let confirmation = PaymentConfirmation {
        payment_ref: intent.payment_ref.clone(),
        status: PaymentStatus::Succeeded,
    };
    let outcome = ledger
        .confirm_payment(confirmation.clone())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.new_balance, 20);
    assert_eq!(outcome.record.fiat_amount, Some(Decimal::new(1000, 2)));
    assert!(ledger.query().pending_payment_orders().unwrap().is_empty());
    assert!(ledger.query().value_totals().unwrap().is_conserved());

    // A replayed confirmation credits nothing
    let err = ledger.confirm_payment(confirmation).await.unwrap_err();
    assert!(matches!(err, Error::DuplicatePayment(_)));
    assert_eq!(ledger.query().account(parent.id).unwrap().balance_tokens, 20);
}

#[tokio::test]
async fn test_unconfirmed_orders_expire() {
    let (ledger, _temp) = create_test_ledger_with(|config| {
        config.payments.order_ttl_secs = 1;
    })
    .await;
    let ledger = ledger.with_payment_provider(Arc::new(OfflinePaymentProvider));
    let parent = ledger.create_account("Parent", AccountKind::Parent, 0).await.unwrap();

    let intent = ledger
        .initiate_token_purchase(parent.id, Decimal::new(500, 2), 10)
        .await
        .unwrap();
    assert_eq!(ledger.expire_payment_orders().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(ledger.expire_payment_orders().await.unwrap(), 1);
    assert!(ledger.query().pending_payment_orders().unwrap().is_empty());

    let err = ledger
        .confirm_payment(PaymentConfirmation {
            payment_ref: intent.payment_ref,
            status: PaymentStatus::Succeeded,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert_eq!(ledger.query().account(parent.id).unwrap().balance_tokens, 0);
}

#[tokio::test]
async fn test_tombolas_listed_per_kermesse() {
    let (ledger, _temp) = create_test_ledger().await;
    let spring = ledger.create_tombola(1, "Tombola du printemps").await.unwrap();
    let summer = ledger.create_tombola(2, "Tombola d'ete").await.unwrap();
    let lots = ledger.create_tombola(1, "Petits lots").await.unwrap();

    let first: Vec<_> = ledger
        .query()
        .tombolas_for_event(1)
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(first, vec![spring.id, lots.id]);

    assert_eq!(ledger.query().tombolas_for_event(2).unwrap()[0].id, summer.id);
    assert!(ledger.query().tombolas_for_event(3).unwrap().is_empty());
    assert_eq!(ledger.query().tombolas().unwrap().len(), 3);
}
