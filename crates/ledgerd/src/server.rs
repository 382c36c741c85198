//! Request dispatch and the stdin/stdout loop.

use std::io::{BufRead, Write};

use serde::Serialize;
use serde_json::{Value as JsonValue, json};

use atelier_infra::{Ledger, LedgerResult};

use crate::protocol::{ErrorBody, Operation, Request, Response};

/// Read requests line by line until end of input, answering each in order.
/// Blank lines are skipped. Returns the number of requests answered.
pub fn serve(ledger: &Ledger, input: impl BufRead, mut output: impl Write) -> anyhow::Result<usize> {
    let mut served = 0;
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let response = handle_line(ledger, &line);
        serde_json::to_writer(&mut output, &response)?;
        output.write_all(b"\n")?;
        output.flush()?;
        served += 1;
    }
    Ok(served)
}

pub fn handle_line(ledger: &Ledger, line: &str) -> Response {
    match serde_json::from_str::<Request>(line) {
        Ok(request) => handle(ledger, request),
        Err(err) => {
            tracing::warn!(error = %err, "unparseable request");
            Response::error(JsonValue::Null, ErrorBody::bad_request(err.to_string()))
        }
    }
}

pub fn handle(ledger: &Ledger, request: Request) -> Response {
    let Request { id, actor, op } = request;
    let name = op.name();
    let mutation = op.is_mutation();

    let result = match execute(ledger, op, &actor) {
        Ok(result) => result,
        Err(body) => {
            if body.retryable {
                tracing::warn!(op = name, code = body.code, message = %body.message, "request failed, retryable");
            } else {
                tracing::debug!(op = name, code = body.code, message = %body.message, "request rejected");
            }
            return Response::error(id, body);
        }
    };

    if mutation {
        tracing::debug!(op = name, actor_id = %actor.actor_id, "request applied");
    }
    Response::ok(id, result)
}

fn execute(ledger: &Ledger, op: Operation, actor: &atelier_core::ActorContext) -> Result<JsonValue, ErrorBody> {
    let stock = ledger.stock();
    let orders = ledger.orders();

    match op {
        Operation::RegisterStockItem(req) => reply(stock.register_stock_item(req, actor)),
        Operation::ApplyStockMovement(req) => reply(
            stock
                .apply_movement(req, actor)
                .map(|(item, movement)| json!({ "stock_item": item, "movement": movement })),
        ),
        Operation::SetReorderThreshold { stock_item_id, threshold } => {
            reply(stock.set_reorder_threshold(stock_item_id, threshold, actor))
        }
        Operation::ReceivePurchase(receipt) => {
            let outcomes = stock.receive_purchase(receipt, actor).map_err(|e| ErrorBody::from(&e))?;
            let lines = outcomes
                .into_iter()
                .map(|outcome| match outcome.result {
                    Ok(movement) => json!({
                        "stock_item_id": outcome.stock_item_id,
                        "status": "ok",
                        "movement": movement,
                    }),
                    Err(err) => json!({
                        "stock_item_id": outcome.stock_item_id,
                        "status": "error",
                        "error": ErrorBody::from(&err),
                    }),
                })
                .collect::<Vec<_>>();
            Ok(JsonValue::Array(lines))
        }
        Operation::GetStockItem { stock_item_id } => reply(stock.stock_item(stock_item_id)),
        Operation::FindStockItemBySku { sku } => reply(stock.find_by_sku(&sku)),
        Operation::ListStockMovements { stock_item_id } => reply(stock.movements(stock_item_id)),
        Operation::ListStockItems => reply(Ok(stock.list_stock_items())),
        Operation::ListLowStockItems => reply(Ok(stock.low_stock_items())),

        Operation::CreateOrder(req) => reply(orders.create_order(req, actor)),
        Operation::TransitionOrder(req) => reply(orders.transition_order(req, actor)),
        Operation::AddOrderLine(req) => reply(orders.add_order_line(req, actor)),
        Operation::RemoveOrderLine(req) => reply(orders.remove_order_line(req, actor)),
        Operation::UpdateTaskStatus(req) => reply(orders.update_task_status(req, actor)),
        Operation::AssignTask(req) => reply(orders.assign_task(req, actor)),
        Operation::AddPayment(req) => reply(orders.add_payment(req, actor)),
        Operation::GetOrder { order_id } => reply(orders.get_order(order_id)),
        Operation::FindOrderByNumber { order_number } => reply(orders.find_by_number(&order_number)),
        Operation::ListOrders(filter) => reply(Ok(orders.list_orders(&filter))),
    }
}

fn reply<T: Serialize>(result: LedgerResult<T>) -> Result<JsonValue, ErrorBody> {
    let value = result.map_err(|e| ErrorBody::from(&e))?;
    serde_json::to_value(value).map_err(|e| ErrorBody::internal(format!("cannot encode result: {e}")))
}
