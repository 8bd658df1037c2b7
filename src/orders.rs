//! The contract of the external order system that feeds the worklist.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Compact timestamp format used by the order system for textual timestamps.
pub const ORDER_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M";

/// Modality assumed for orders without a unit code.
pub const DEFAULT_MODALITY: &str = "OT";

/// An order as delivered by the order system. Every field is optional because the source
/// rows are not validated upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Order {
	pub order_seq: Option<i64>,
	pub ordered_at: Option<OrderTimestamp>,
	/// Unit code, used as the modality.
	pub unit_code: Option<String>,
	pub patient_name: Option<String>,
	/// Chart number, used as the patient identifier.
	pub chart_number: Option<String>,
	pub birth_date: Option<String>,
	pub sex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderTimestamp {
	DateTime(NaiveDateTime),
	Text(String),
}

/// Order status values understood by the order system.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OrderStatus {
	InProgress,
	Completed,
}

impl OrderStatus {
	pub const fn code(&self) -> &'static str {
		match self {
			Self::InProgress => "IP",
			Self::Completed => "CO",
		}
	}
}

impl Display for OrderStatus {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.code())
	}
}

#[async_trait]
pub trait OrderSource: Send + Sync {
	/// Returns orders with a sequence number strictly greater than `cursor`, newest first.
	/// Without a cursor the most recent batch is returned.
	async fn fetch_new_orders(&self, cursor: Option<i64>) -> Result<Vec<Order>, OrderSourceError>;

	/// Pushes a status update for an order. Returns `false` if no order was updated.
	async fn update_order_status(
		&self,
		order_seq: i64,
		status: OrderStatus,
	) -> Result<bool, OrderSourceError>;
}

#[derive(Debug, Error)]
pub enum OrderSourceError {
	#[error("Order source is unreachable: {0}")]
	Unavailable(String),
	#[error(transparent)]
	Backend(Box<dyn std::error::Error + Send + Sync>),
}

#[cfg(test)]
pub(crate) mod testing {
	use super::*;
	use std::sync::Mutex;

	/// A scripted order source that serves a fixed set of orders and records status pushes.
	#[derive(Default)]
	pub struct ScriptedOrderSource {
		orders: Mutex<Vec<Order>>,
		pub cursors: Mutex<Vec<Option<i64>>>,
		pub updates: Mutex<Vec<(i64, OrderStatus)>>,
		pub fail_fetch: bool,
		pub fail_update: bool,
	}

	impl ScriptedOrderSource {
		pub fn with_orders(orders: Vec<Order>) -> Self {
			Self {
				orders: Mutex::new(orders),
				..Self::default()
			}
		}

		/// Every fetch fails as if the order system were unreachable.
		pub fn failing_fetch() -> Self {
			Self {
				fail_fetch: true,
				..Self::default()
			}
		}

		/// Every status push fails as if the order system were unreachable.
		pub fn failing_update() -> Self {
			Self {
				fail_update: true,
				..Self::default()
			}
		}

		pub fn push(&self, order: Order) {
			self.orders.lock().unwrap().push(order);
		}

		pub fn updates(&self) -> Vec<(i64, OrderStatus)> {
			self.updates.lock().unwrap().clone()
		}
	}

	#[async_trait]
	impl OrderSource for ScriptedOrderSource {
		async fn fetch_new_orders(
			&self,
			cursor: Option<i64>,
		) -> Result<Vec<Order>, OrderSourceError> {
			self.cursors.lock().unwrap().push(cursor);
			if self.fail_fetch {
				return Err(OrderSourceError::Unavailable(String::from("scripted")));
			}
			let mut orders: Vec<Order> = self
				.orders
				.lock()
				.unwrap()
				.iter()
				.filter(|order| match (cursor, order.order_seq) {
					(Some(cursor), Some(seq)) => seq > cursor,
					_ => true,
				})
				.cloned()
				.collect();
			orders.sort_by(|a, b| b.order_seq.cmp(&a.order_seq));
			Ok(orders)
		}

		async fn update_order_status(
			&self,
			order_seq: i64,
			status: OrderStatus,
		) -> Result<bool, OrderSourceError> {
			if self.fail_update {
				return Err(OrderSourceError::Unavailable(String::from("scripted")));
			}
			self.updates.lock().unwrap().push((order_seq, status));
			Ok(true)
		}
	}

	pub fn order(seq: i64, modality: &str, chart_number: &str, name: &str) -> Order {
		Order {
			order_seq: Some(seq),
			ordered_at: Some(OrderTimestamp::Text(String::from("202501011000"))),
			unit_code: Some(modality.to_owned()),
			patient_name: Some(name.to_owned()),
			chart_number: Some(chart_number.to_owned()),
			birth_date: Some(String::from("19800101")),
			sex: Some(String::from("M")),
		}
	}
}
