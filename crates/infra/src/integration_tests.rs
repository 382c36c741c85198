//! End-to-end checks for the ledger as assembled by `Ledger`.
//!
//! Request → lock → aggregate → EventStore → bus / read models, with several
//! threads hitting the same stock items and the same numbering period.

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    use atelier_core::{ActorContext, AggregateRoot, ClientId, Money};
    use atelier_events::{EventBus, InMemoryEventBus};
    use atelier_inventory::{MovementType, StockItemId, StockKind};
    use atelier_orders::{Order, OrderStatus, Priority, TaskStatus};

    use crate::clock::FixedClock;
    use crate::config::LedgerConfig;
    use crate::error::LedgerError;
    use crate::event_store::{EventStore, InMemoryEventStore};
    use crate::ledger::{RegisterStockItemRequest, StockMovementRequest};
    use crate::order_service::{CreateOrderRequest, OrderLineRequest, TaskStatusRequest, TransitionRequest};
    use crate::projections::OrderFilter;
    use crate::sequence::InMemorySequenceStore;
    use crate::services::{Collaborators, Ledger};
    use crate::sinks::{BusSink, LowStockAlert, TracingSink};

    fn collaborators() -> Collaborators {
        Collaborators {
            clock: Arc::new(FixedClock(Utc.with_ymd_and_hms(2024, 3, 14, 9, 30, 0).unwrap())),
            ..Collaborators::default()
        }
    }

    fn ledger() -> Ledger {
        Ledger::in_memory(&LedgerConfig::default(), collaborators()).unwrap()
    }

    fn actor() -> ActorContext {
        ActorContext::system()
    }

    fn register(ledger: &Ledger, sku: &str, qty: u64, threshold: u64) -> StockItemId {
        ledger
            .stock()
            .register_stock_item(
                RegisterStockItemRequest {
                    sku: sku.to_string(),
                    name: format!("{sku} stock"),
                    kind: StockKind::Consumable,
                    reorder_threshold: threshold,
                    unit_price: Some(Money::from_minor(500)),
                    initial_quantity: qty,
                },
                &actor(),
            )
            .unwrap()
            .id_typed()
    }

    fn movement(id: StockItemId, movement_type: MovementType, quantity: u64) -> StockMovementRequest {
        StockMovementRequest {
            stock_item_id: id,
            movement_type,
            quantity,
            reference: None,
            note: None,
            operation_key: None,
        }
    }

    fn order_for(lines: &[(StockItemId, u64)]) -> CreateOrderRequest {
        CreateOrderRequest {
            client_id: ClientId::new(),
            lines: lines
                .iter()
                .map(|&(stock_item_id, quantity)| OrderLineRequest {
                    stock_item_id,
                    quantity,
                    unit_price: None,
                })
                .collect(),
            discount: Money::ZERO,
            tax_rate_bps: 0,
            priority: Priority::default(),
            notes: None,
            deadline: None,
        }
    }

    fn move_to(ledger: &Ledger, order: &Order, target: OrderStatus, reason: Option<&str>) -> Result<Order, LedgerError> {
        ledger.orders().transition_order(
            TransitionRequest {
                order_id: order.id_typed(),
                target,
                reason: reason.map(str::to_string),
            },
            &actor(),
        )
    }

    fn on_hand(ledger: &Ledger, id: StockItemId) -> u64 {
        ledger.stock().stock_item(id).unwrap().quantity_on_hand()
    }

    fn count_movements(ledger: &Ledger, id: StockItemId, movement_type: MovementType) -> usize {
        ledger
            .stock()
            .movements(id)
            .unwrap()
            .iter()
            .filter(|m| m.movement_type == movement_type)
            .count()
    }

    #[test]
    fn concurrent_orders_get_unique_gapless_numbers() {
        let ledger = Arc::new(ledger());
        let tee = register(&ledger, "TEE-WHT-M", 1_000, 0);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                thread::spawn(move || {
                    (0..10)
                        .map(|_| {
                            let order = ledger.orders().create_order(order_for(&[(tee, 2)]), &actor()).unwrap();
                            order.order_number().unwrap().sequence()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let numbers: BTreeSet<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        assert_eq!(numbers, (1..=80).collect::<BTreeSet<_>>());
        assert_eq!(on_hand(&ledger, tee), 1_000 - 160);
        assert_eq!(ledger.orders().list_orders(&OrderFilter::default()).len(), 80);
    }

    #[test]
    fn concurrent_decreases_never_oversell() {
        let ledger = Arc::new(ledger());
        let ink = register(&ledger, "INK-BLK", 100, 0);

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let ledger = ledger.clone();
                thread::spawn(move || {
                    let movement_type = if worker % 2 == 0 { MovementType::Out } else { MovementType::Reserve };
                    (0..10)
                        .filter(|_| {
                            match ledger.stock().apply_movement(movement(ink, movement_type, 3), &actor()) {
                                Ok(_) => true,
                                Err(LedgerError::InsufficientStock { available, .. }) => {
                                    assert!(available < 3);
                                    false
                                }
                                Err(other) => panic!("unexpected error: {other:?}"),
                            }
                        })
                        .count() as u64
                })
            })
            .collect();

        let accepted: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 33);
        assert_eq!(on_hand(&ledger, ink), 1);

        let log = ledger.stock().movements(ink).unwrap();
        assert_eq!(log.len() as u64, accepted + 1);
        assert!(log.windows(2).all(|w| w[1].sequence == w[0].sequence + 1));
        assert_eq!(log.last().unwrap().resulting_quantity, 1);
    }

    #[test]
    fn reservation_is_all_or_nothing() {
        let ledger = ledger();
        let tee = register(&ledger, "TEE", 10, 0);
        let cap = register(&ledger, "CAP", 1, 0);

        let err = ledger
            .orders()
            .create_order(order_for(&[(tee, 4), (cap, 2)]), &actor())
            .unwrap_err();
        assert!(matches!(err, LedgerError::StockUnavailable { requested: 2, available: 1, .. }));
        assert_eq!(on_hand(&ledger, tee), 10);
        assert_eq!(on_hand(&ledger, cap), 1);
        assert_eq!(count_movements(&ledger, tee, MovementType::Reserve), 0);
        assert_eq!(count_movements(&ledger, tee, MovementType::Release), 0);
        assert!(ledger.orders().list_orders(&OrderFilter::default()).is_empty());
    }

    #[test]
    fn cancel_releases_once() {
        let ledger = ledger();
        let tee = register(&ledger, "TEE", 10, 0);
        let order = ledger.orders().create_order(order_for(&[(tee, 5)]), &actor()).unwrap();
        assert_eq!(on_hand(&ledger, tee), 5);

        assert!(matches!(
            move_to(&ledger, &order, OrderStatus::Cancelled, None),
            Err(LedgerError::ValidationFailed(_))
        ));

        let cancelled = move_to(&ledger, &order, OrderStatus::Cancelled, Some("client withdrew")).unwrap();
        assert_eq!(cancelled.status(), OrderStatus::Cancelled);
        assert_eq!(on_hand(&ledger, tee), 10);

        let again = move_to(&ledger, &order, OrderStatus::Cancelled, Some("client withdrew")).unwrap();
        assert_eq!(again.version(), cancelled.version());
        assert_eq!(on_hand(&ledger, tee), 10);
        assert_eq!(count_movements(&ledger, tee, MovementType::Release), 1);

        let err = move_to(&ledger, &order, OrderStatus::Confirmed, None).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition(_)));
    }

    #[test]
    fn delivery_consumes_reservation_without_touching_on_hand() {
        let ledger = ledger();
        let tee = register(&ledger, "TEE", 10, 0);
        let order = ledger.orders().create_order(order_for(&[(tee, 5)]), &actor()).unwrap();

        move_to(&ledger, &order, OrderStatus::Confirmed, None).unwrap();
        let started = move_to(&ledger, &order, OrderStatus::InProgress, None).unwrap();
        for task in started.tasks() {
            ledger
                .orders()
                .update_task_status(
                    TaskStatusRequest {
                        order_id: order.id_typed(),
                        task_no: task.task_no,
                        status: TaskStatus::Completed,
                    },
                    &actor(),
                )
                .unwrap();
        }
        assert_eq!(ledger.orders().get_order(order.id_typed()).unwrap().status(), OrderStatus::Ready);

        let delivered = move_to(&ledger, &order, OrderStatus::Delivered, None).unwrap();
        assert_eq!(delivered.status(), OrderStatus::Delivered);
        assert_eq!(on_hand(&ledger, tee), 5);

        let types: Vec<_> = ledger.stock().movements(tee).unwrap().iter().map(|m| m.movement_type).collect();
        assert_eq!(
            types,
            vec![MovementType::In, MovementType::Reserve, MovementType::Release, MovementType::Out]
        );
        assert!(matches!(
            move_to(&ledger, &order, OrderStatus::Cancelled, Some("too late")),
            Err(LedgerError::InvalidTransition(_))
        ));
    }

    #[test]
    fn low_stock_alert_and_refused_oversell() {
        let alerts = Arc::new(InMemoryEventBus::<LowStockAlert>::new());
        let received = alerts.subscribe();
        let ledger = Ledger::in_memory(
            &LedgerConfig::default(),
            Collaborators {
                notifier: Arc::new(BusSink::new(alerts.clone())),
                activity: Arc::new(TracingSink),
                ..collaborators()
            },
        )
        .unwrap();
        let ink = register(&ledger, "INK-001", 20, 5);
        assert!(received.drain().is_empty());

        let (item, mv) = ledger
            .stock()
            .apply_movement(movement(ink, MovementType::Out, 16), &actor())
            .unwrap();
        assert_eq!(item.quantity_on_hand(), 4);
        assert_eq!(mv.quantity_delta, -16);
        let alert = received.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!((alert.sku.as_str(), alert.quantity_on_hand, alert.reorder_threshold), ("INK-001", 4, 5));
        assert_eq!(ledger.stock().low_stock_items().len(), 1);

        let err = ledger
            .stock()
            .apply_movement(movement(ink, MovementType::Out, 10), &actor())
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientStock {
                stock_item_id: ink,
                requested: 10,
                available: 4
            }
        );
        assert!(!err.is_retryable());
        assert_eq!(on_hand(&ledger, ink), 4);
        assert_eq!(ledger.stock().movements(ink).unwrap().len(), 2);
    }

    #[test]
    fn subscribers_see_committed_events_in_order() {
        let ledger = ledger();
        let sub = ledger.subscribe();
        let tee = register(&ledger, "TEE", 10, 0);
        ledger.stock().apply_movement(movement(tee, MovementType::Waste, 1), &actor()).unwrap();
        let _ = ledger
            .stock()
            .apply_movement(movement(tee, MovementType::Out, 50), &actor())
            .unwrap_err();

        let seen: Vec<_> = sub
            .drain()
            .into_iter()
            .map(|env| (env.event_type().to_string(), env.sequence_number()))
            .collect();
        assert_eq!(
            seen,
            vec![
                ("stock.item.registered".to_string(), 1),
                ("stock.item.movement_recorded".to_string(), 2),
                ("stock.item.movement_recorded".to_string(), 3),
            ]
        );
    }

    #[test]
    fn read_models_survive_restart_on_shared_stores() {
        let events = Arc::new(InMemoryEventStore::new());
        let sequences = Arc::new(InMemorySequenceStore::default());
        let config = LedgerConfig::default();

        let first = Ledger::assemble(events.clone(), sequences.clone(), &config, collaborators()).unwrap();
        let tee = register(&first, "TEE", 10, 3);
        let order = first.orders().create_order(order_for(&[(tee, 8)]), &actor()).unwrap();
        let number = order.order_number().unwrap().to_string();
        drop(first);

        let second = Ledger::assemble(events.clone(), sequences, &config, collaborators()).unwrap();
        assert_eq!(second.stock().find_by_sku("TEE").unwrap().quantity_on_hand(), 2);
        assert_eq!(second.stock().low_stock_items().len(), 1);
        assert_eq!(second.orders().find_by_number(&number).unwrap().id_typed(), order.id_typed());

        let next = second.orders().create_order(order_for(&[(tee, 1)]), &actor()).unwrap();
        assert_eq!(next.order_number().unwrap().sequence(), 2);
        assert_eq!(events.load_stream(tee.0).unwrap().len(), 4);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        #[test]
        fn on_hand_matches_accepted_movements(
            initial in 0u64..50,
            steps in proptest::collection::vec((0usize..7, 1u64..20), 1..40),
        ) {
            let ledger = ledger();
            let id = register(&ledger, "PROP", initial, 0);
            let kinds = [
                MovementType::In,
                MovementType::Out,
                MovementType::Adjustment,
                MovementType::Waste,
                MovementType::Return,
                MovementType::Reserve,
                MovementType::Release,
            ];

            let mut expected = initial;
            for (kind, qty) in steps {
                let movement_type = kinds[kind];
                match ledger.stock().apply_movement(movement(id, movement_type, qty), &actor()) {
                    Ok((item, mv)) => {
                        expected = movement_type.resulting_quantity(expected, qty).unwrap();
                        prop_assert_eq!(item.quantity_on_hand(), expected);
                        prop_assert_eq!(mv.resulting_quantity, expected);
                    }
                    Err(LedgerError::InsufficientStock { available, requested, .. }) => {
                        prop_assert!(movement_type.is_decrease());
                        prop_assert_eq!(available, expected);
                        prop_assert!(requested > available);
                    }
                    Err(other) => prop_assert!(false, "unexpected error: {:?}", other),
                }
            }

            let log = ledger.stock().movements(id).unwrap();
            let replayed = log.iter().fold(0i64, |acc, m| acc + m.quantity_delta);
            prop_assert_eq!(replayed, expected as i64);
            prop_assert_eq!(ledger.stock().levels().get(id).map(|l| l.quantity_on_hand), Some(expected));
        }
    }
}
