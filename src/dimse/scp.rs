use super::association::server::{ServerAssociation, ServerAssociationOptions};
use super::association::Association;
use super::cecho::{CompositeEchoRequest, CompositeEchoResponse, COMMAND_FIELD_COMPOSITE_ECHO_REQUEST};
use super::cfind::{
	CompositeCancelRequest, CompositeFindRequest, CompositeFindResponse,
	COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST, COMMAND_FIELD_COMPOSITE_FIND_REQUEST,
};
use super::ncreate::{
	NormalizedCreateRequest, NormalizedCreateResponse, COMMAND_FIELD_NORMALIZED_CREATE_REQUEST,
};
use super::nset::{NormalizedSetRequest, NormalizedSetResponse, COMMAND_FIELD_NORMALIZED_SET_REQUEST};
use super::{DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError, StatusType};
use crate::config::ServerConfig;
use crate::service::{WorklistService, STATUS_SUCCESS};
use crate::types::US;
use crate::worklist::FindResponse;
use dicom::dictionary_std::uids;
use dicom::object::InMemDicomObject;
use dicom::ul::Pdu;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// SOP classes served by the provider.
const ABSTRACT_SYNTAXES: &[&str] = &[
	uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND,
	uids::MODALITY_PERFORMED_PROCEDURE_STEP,
	uids::VERIFICATION,
];

pub struct WorklistServiceClassProvider {
	inner: Arc<InnerWorklistServiceClassProvider>,
}

struct InnerWorklistServiceClassProvider {
	service: Arc<WorklistService>,
	config: ServerConfig,
}

impl WorklistServiceClassProvider {
	pub fn new(service: Arc<WorklistService>, config: ServerConfig) -> Self {
		Self {
			inner: Arc::new(InnerWorklistServiceClassProvider { service, config }),
		}
	}

	/// Accepts associations until `shutdown` turns `true`. Open associations are closed once
	/// they observe the same signal, running worklist queries end as cancelled.
	pub async fn spawn(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
		let address = SocketAddr::from((self.inner.config.interface, self.inner.config.port));
		let listener = TcpListener::bind(&address).await?;
		info!("Started Worklist Service Class Provider on {address}");

		let mut stop = shutdown.clone();
		loop {
			tokio::select! {
				accepted = listener.accept() => match accepted {
					Ok((stream, peer)) => {
						let span = info_span!(
							"WORKLIST-SCP",
							aet = &self.inner.config.aet,
							peer = peer.to_string()
						);
						info!("Accepted incoming connection from {peer}");
						let inner = Arc::clone(&self.inner);
						let shutdown = shutdown.clone();
						tokio::spawn(
							async move {
								if let Err(err) = Self::process(stream, inner, shutdown).await {
									error!("{err}");
								}
							}
							.instrument(span),
						);
					}
					Err(err) => error!("Failed to accept incoming connection: {err}"),
				},
				() = shutdown_requested(&mut stop) => break,
			}
		}

		info!("Stopped Worklist Service Class Provider");
		Ok(())
	}

	#[instrument(skip_all)]
	async fn process(
		stream: TcpStream,
		inner: Arc<InnerWorklistServiceClassProvider>,
		shutdown: watch::Receiver<bool>,
	) -> anyhow::Result<()> {
		let tcp_stream = stream.into_std()?;
		// This is required because the `dicom-rs` crate does not use non-blocking reads/writes.
		// The actual reading/writing happens in ServerAssociation, which moves IO operation
		// to another thread.
		tcp_stream.set_nonblocking(false)?;

		let options = ServerAssociationOptions {
			aet: inner.config.aet.clone(),
			tcp_stream,
			abstract_syntaxes: ABSTRACT_SYNTAXES,
		};
		let association = ServerAssociation::new(options).await?;
		let timeout = inner.config.write_timeout();

		let mut stop = shutdown.clone();
		loop {
			// Duration::MAX to indefinitely wait for incoming messages
			let message = tokio::select! {
				message = association.read_message(Duration::MAX) => message,
				() = shutdown_requested(&mut stop) => {
					info!("Closing association due to shutdown");
					break;
				}
			};

			let message = match message {
				Ok(message) => message,
				Err(ReadError::UnexpectedPdu(Pdu::ReleaseRQ)) => {
					association.send(Pdu::ReleaseRP, timeout).await?;
					info!("Released association");
					break;
				}
				Err(ReadError::UnexpectedPdu(Pdu::AbortRQ { source })) => {
					info!("Association was aborted by the peer: {source:?}");
					break;
				}
				Err(err) => return Err(err.into()),
			};

			match message.command_field()? {
				COMMAND_FIELD_COMPOSITE_ECHO_REQUEST => {
					Self::echo(&association, &inner, message, timeout).await?;
				}
				COMMAND_FIELD_COMPOSITE_FIND_REQUEST => {
					Self::find(&association, &inner.service, message, &shutdown, timeout).await?;
				}
				COMMAND_FIELD_NORMALIZED_CREATE_REQUEST => {
					Self::create(&association, &inner, message, timeout).await?;
				}
				COMMAND_FIELD_NORMALIZED_SET_REQUEST => {
					Self::set(&association, &inner, message, timeout).await?;
				}
				COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST => {
					// Cancels for a running query are consumed while it streams its matches.
					debug!(
						message_id = message.message_id(),
						"Ignoring C-CANCEL without a running query"
					);
				}
				command_field => {
					return Err(anyhow::anyhow!(
						"Unexpected Command Field {command_field:#06x}. Only C-ECHO-RQ, C-FIND-RQ, N-CREATE-RQ and N-SET-RQ are supported."
					));
				}
			}
		}
		Ok(())
	}

	async fn echo(
		association: &ServerAssociation,
		inner: &InnerWorklistServiceClassProvider,
		message: DicomMessage,
		timeout: Duration,
	) -> anyhow::Result<()> {
		let presentation_context_id = message.presentation_context_id;
		let request = CompositeEchoRequest::try_from(message)?;
		let response = CompositeEchoResponse {
			message_id: request.message_id,
			status: inner.service.echo(),
		};
		association
			.write_message(response, presentation_context_id, timeout)
			.await?;
		Ok(())
	}

	/// Streams the matches of a worklist query. Between two pending responses the association
	/// is checked for a C-CANCEL-RQ, which ends the query with a cancel status.
	async fn find<A: Association>(
		association: &A,
		service: &WorklistService,
		message: DicomMessage,
		shutdown: &watch::Receiver<bool>,
		timeout: Duration,
	) -> anyhow::Result<()> {
		let presentation_context_id = message.presentation_context_id;
		let request = CompositeFindRequest::try_from(message)?;

		let stopping = *shutdown.borrow();
		let (cancel_tx, cancel_rx) = watch::channel(stopping);
		let mut responses = service.find(&request.identifier, cancel_rx);
		let mut matches = 0;
		while let Some(response) = responses.next().await {
			let status = response.status();
			let identifier = match response {
				FindResponse::Pending(record) => {
					matches += 1;
					Some(InMemDicomObject::from(*record))
				}
				_ => {
					log_status("C-FIND", status);
					None
				}
			};
			let pending = identifier.is_some();

			let response = CompositeFindResponse {
				message_id: request.message_id,
				affected_sop_class_uid: request.affected_sop_class_uid.clone(),
				status,
				identifier,
			};
			association
				.write_message(response, presentation_context_id, timeout)
				.await?;

			if pending {
				let stopping = *shutdown.borrow();
				if stopping || cancel_requested(association, request.message_id, timeout).await? {
					cancel_tx.send_replace(true);
				}
			}
		}

		info!(matches, "Answered worklist query");
		Ok(())
	}

	async fn create(
		association: &ServerAssociation,
		inner: &InnerWorklistServiceClassProvider,
		message: DicomMessage,
		timeout: Duration,
	) -> anyhow::Result<()> {
		let presentation_context_id = message.presentation_context_id;
		let request = NormalizedCreateRequest::try_from(message)?;

		let (status, attributes) = match inner
			.service
			.create_step(request.affected_sop_instance_uid.clone(), request.attributes)
			.await
		{
			Ok(record) => (STATUS_SUCCESS, Some(record)),
			Err(err) => {
				warn!("N-CREATE failed: {err}");
				(err.status(), None)
			}
		};
		log_status("N-CREATE", status);

		let response = NormalizedCreateResponse {
			message_id: request.message_id,
			affected_sop_class_uid: request.affected_sop_class_uid,
			affected_sop_instance_uid: request.affected_sop_instance_uid,
			status,
			attributes,
		};
		association
			.write_message(response, presentation_context_id, timeout)
			.await?;
		Ok(())
	}

	async fn set(
		association: &ServerAssociation,
		inner: &InnerWorklistServiceClassProvider,
		message: DicomMessage,
		timeout: Duration,
	) -> anyhow::Result<()> {
		let presentation_context_id = message.presentation_context_id;
		let request = NormalizedSetRequest::try_from(message)?;

		let (status, attributes) = match inner
			.service
			.update_step(
				request.requested_sop_instance_uid.as_deref(),
				request.modifications,
			)
			.await
		{
			Ok(record) => (STATUS_SUCCESS, Some(record)),
			Err(err) => {
				warn!("N-SET failed: {err}");
				(err.status(), None)
			}
		};
		log_status("N-SET", status);

		let response = NormalizedSetResponse {
			message_id: request.message_id,
			affected_sop_class_uid: request.requested_sop_class_uid,
			affected_sop_instance_uid: request.requested_sop_instance_uid,
			status,
			attributes,
		};
		association
			.write_message(response, presentation_context_id, timeout)
			.await?;
		Ok(())
	}
}

/// Resolves once shutdown is signalled or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
	while !*shutdown.borrow_and_update() {
		if shutdown.changed().await.is_err() {
			return;
		}
	}
}

/// Consumes a message the peer sent while a query is running. Only a C-CANCEL-RQ naming
/// `message_id` stops the query, anything else is dropped.
async fn cancel_requested<A: Association>(
	association: &A,
	message_id: US,
	timeout: Duration,
) -> Result<bool, ReadError> {
	let Some(message) = association.try_read_message(timeout).await? else {
		return Ok(false);
	};

	match message.command_field()? {
		COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST => {
			let cancel = CompositeCancelRequest::try_from(message)?;
			if cancel.message_id_being_responded_to == message_id {
				info!(message_id, "Received C-CANCEL for running worklist query");
				Ok(true)
			} else {
				debug!(
					message_id = cancel.message_id_being_responded_to,
					"Ignoring C-CANCEL for another query"
				);
				Ok(false)
			}
		}
		command_field => {
			warn!("Ignoring Command Field {command_field:#06x} received during a worklist query");
			Ok(false)
		}
	}
}

fn log_status(operation: &str, status: US) {
	match StatusType::try_from(status) {
		Ok(StatusType::Success | StatusType::Pending) => {
			debug!("{operation} finished with status {status:#06x}");
		}
		Ok(StatusType::Cancel) => info!("{operation} was cancelled"),
		Ok(StatusType::Warning) => warn!("{operation} finished with warning {status:#06x}"),
		Ok(StatusType::Failure) | Err(_) => {
			warn!("{operation} failed with status {status:#06x}");
		}
	}
}
