//! Order source backed by the EMR's SQL Server database.
//!
//! Orders live in the `PcsInf` table. Every call opens its own connection, so a database
//! restart only fails the calls made while it is down.

use crate::config::OrdersConfig;
use crate::orders::{Order, OrderSource, OrderSourceError, OrderStatus, OrderTimestamp};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, Query};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, instrument};

/// Selected columns, in the order [`order_from_columns`] reads them.
const ORDER_COLUMNS: &str =
	"PcsOdrSeq, PcsOdrDtm, PcsUntCod, PcsPatNam, PcsChtNum, PcsBirDte, PcsSexTyp";

pub struct EmrOrderSource {
	config: Config,
	batch: u32,
}

impl EmrOrderSource {
	pub fn new(orders: &OrdersConfig) -> Self {
		let mut config = Config::new();
		config.host(&orders.host);
		config.port(orders.port);
		config.database(&orders.database);
		config.authentication(AuthMethod::sql_server(&orders.user, &orders.password));
		config.application_name(env!("CARGO_PKG_NAME"));
		if orders.encrypt {
			config.encryption(EncryptionLevel::Required);
			config.trust_cert();
		} else {
			config.encryption(EncryptionLevel::NotSupported);
		}

		Self {
			config,
			batch: orders.batch,
		}
	}

	async fn connect(&self) -> Result<Client<Compat<TcpStream>>, OrderSourceError> {
		let tcp = TcpStream::connect(self.config.get_addr())
			.await
			.map_err(|err| OrderSourceError::Unavailable(err.to_string()))?;
		tcp.set_nodelay(true)
			.map_err(|err| OrderSourceError::Unavailable(err.to_string()))?;

		Client::connect(self.config.clone(), tcp.compat_write())
			.await
			.map_err(|err| OrderSourceError::Unavailable(err.to_string()))
	}
}

#[async_trait]
impl OrderSource for EmrOrderSource {
	#[instrument(skip(self))]
	async fn fetch_new_orders(&self, cursor: Option<i64>) -> Result<Vec<Order>, OrderSourceError> {
		let mut client = self.connect().await?;

		let query = match cursor {
			Some(cursor) => {
				let mut query = Query::new(format!(
					"SELECT {ORDER_COLUMNS} FROM PcsInf \
					 WHERE PcsDelFlg = 'N' AND PcsOdrSeq > @P1 ORDER BY PcsOdrSeq DESC"
				));
				query.bind(cursor);
				query
			}
			None => {
				let mut query = Query::new(format!(
					"SELECT TOP (@P1) {ORDER_COLUMNS} FROM PcsInf \
					 WHERE PcsDelFlg = 'N' ORDER BY PcsOdrSeq DESC"
				));
				query.bind(i64::from(self.batch));
				query
			}
		};

		let rows = query
			.query(&mut client)
			.await
			.map_err(backend)?
			.into_first_result()
			.await
			.map_err(backend)?;

		let orders: Vec<Order> = rows.into_iter().map(order_from_columns).collect();
		debug!(orders = orders.len(), "Fetched orders from the EMR");
		Ok(orders)
	}

	#[instrument(skip(self))]
	async fn update_order_status(
		&self,
		order_seq: i64,
		status: OrderStatus,
	) -> Result<bool, OrderSourceError> {
		let mut client = self.connect().await?;
		let result = client
			.execute(
				"UPDATE PcsInf SET PcsStatus = @P1 WHERE PcsOdrSeq = @P2",
				&[&status.code(), &order_seq],
			)
			.await
			.map_err(backend)?;

		let updated = result.total();
		info!(order_seq, %status, updated, "Updated order status in the EMR");
		Ok(updated > 0)
	}
}

fn backend(err: tiberius::error::Error) -> OrderSourceError {
	OrderSourceError::Backend(Box::new(err))
}

/// Maps a `PcsInf` row. Column types differ between EMR installations, so every value is
/// converted from whatever the server sends.
fn order_from_columns(columns: impl IntoIterator<Item = ColumnData<'static>>) -> Order {
	let mut columns = columns.into_iter();
	let mut next = || columns.next();

	Order {
		order_seq: next().as_ref().and_then(integer),
		ordered_at: next().as_ref().and_then(timestamp),
		unit_code: next().as_ref().and_then(text),
		patient_name: next().as_ref().and_then(text),
		chart_number: next().as_ref().and_then(text),
		birth_date: next().as_ref().and_then(text),
		sex: next().as_ref().and_then(text),
	}
}

fn integer(value: &ColumnData<'static>) -> Option<i64> {
	match value {
		ColumnData::U8(value) => value.map(i64::from),
		ColumnData::I16(value) => value.map(i64::from),
		ColumnData::I32(value) => value.map(i64::from),
		ColumnData::I64(value) => *value,
		ColumnData::Numeric(value) => value.and_then(|value| i64::try_from(value.int_part()).ok()),
		ColumnData::String(value) => value.as_deref().and_then(|value| value.trim().parse().ok()),
		_ => None,
	}
}

fn datetime(value: &ColumnData<'static>) -> Option<NaiveDateTime> {
	NaiveDateTime::from_sql(value).ok().flatten()
}

fn timestamp(value: &ColumnData<'static>) -> Option<OrderTimestamp> {
	match value {
		ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) => {
			datetime(value).map(OrderTimestamp::DateTime)
		}
		_ => text(value).map(OrderTimestamp::Text),
	}
}

/// Blank strings count as missing. Dates become `YYYYMMDD`.
fn text(value: &ColumnData<'static>) -> Option<String> {
	match value {
		ColumnData::String(value) => value
			.as_deref()
			.map(str::trim)
			.filter(|value| !value.is_empty())
			.map(str::to_owned),
		ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) => {
			datetime(value).map(|value| value.format("%Y%m%d").to_string())
		}
		_ => integer(value).map(|value| value.to_string()),
	}
}
