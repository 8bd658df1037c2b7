use super::{oneshot, AskPattern, Association, AssociationError, ChannelError, Command, Sender};
use crate::types::AE;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::Pdu;
use dicom::ul::pdu::PresentationContextNegotiated;
use std::convert::identity;
use std::io::ErrorKind;
use std::{net::TcpStream, thread, time::Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug)]
pub struct ServerAssociation {
	channel: Sender<Command>,
	presentation_contexts: Vec<PresentationContextNegotiated>,
	tcp_stream: TcpStream,
}

pub struct ServerAssociationOptions {
	pub aet: AE,
	pub tcp_stream: TcpStream,
	/// SOP classes offered to the calling AE.
	pub abstract_syntaxes: &'static [&'static str],
}

impl ServerAssociation {
	pub async fn new(options: ServerAssociationOptions) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let mut server_options = dicom::ul::ServerAssociationOptions::new()
			.ae_title(options.aet.clone());

		for abstract_syntax in options.abstract_syntaxes {
			server_options = server_options.with_abstract_syntax(*abstract_syntax);
		}
		// Worklist and MPPS payloads are small, so only uncompressed data sets are negotiated.
		for syntax in TransferSyntaxRegistry.iter() {
			if syntax.is_codec_free() {
				server_options = server_options.with_transfer_syntax(syntax.uid());
			}
		}

		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let _handle = thread::Builder::new()
			.name(format!("{}-server", options.aet))
			.spawn(move || {
				let span =
					tracing::info_span!("ServerAssociation", association_id = uuid.to_string());
				let _enter = span.enter();

				let mut association = match server_options.establish(options.tcp_stream) {
					Ok(mut association) => {
						let stream = match association.inner_stream().try_clone() {
							Ok(stream) => stream,
							Err(e) => {
								connect_tx
									.send(Err(AssociationError::Stream(e)))
									.map_err(|_value| ())?;
								return Err(());
							}
						};
						info!(
							calling_aet = association.client_ae_title(),
							called_aet = options.aet,
							"Established new server association"
						);

						let pcs = association.presentation_contexts().to_vec();
						connect_tx.send(Ok((stream, pcs))).map_err(|_value| ())?;
						association
					}
					Err(e) => {
						connect_tx.send(Err(e.into())).map_err(|_value| ())?;
						return Err(());
					}
				};

				let mut released = false;
				while let Some(command) = rx.blocking_recv() {
					let result = match command {
						Command::Send(pdu, response) => {
							released |= matches!(pdu, Pdu::ReleaseRP);
							let send_result = association
								.send(&pdu)
								.map_err(AssociationError::Association);
							response
								.send(send_result)
								.map_err(|_value| ChannelError::Closed)
						}
						Command::Receive(response) => {
							let receive_result =
								association.receive().map_err(AssociationError::Association);
							response
								.send(receive_result)
								.map_err(|_value| ChannelError::Closed)
						}
						Command::TryReceive(response) => {
							let receive_result = has_pending_data(association.inner_stream())
								.map_err(AssociationError::Stream)
								.and_then(|pending| {
									if pending {
										association
											.receive()
											.map(Some)
											.map_err(AssociationError::Association)
									} else {
										Ok(None)
									}
								});
							response
								.send(receive_result)
								.map_err(|_value| ChannelError::Closed)
						}
					};

					if let Some(err) = result.err() {
						error!("Error in ServerAssociation: {err}");
						return Err(());
					}
				}

				rx.close();

				// A released association must not be aborted afterwards.
				if released {
					debug!("Association was released");
					return Ok(());
				}

				if let Err(e) = association.abort() {
					match e {
						dicom::ul::association::Error::WireSend { source, .. }
							if source.kind() == ErrorKind::BrokenPipe =>
						{
							// no-op, happens on MacOS if the TCP stream is already closed
						}
						_ => {
							warn!("ServerAssociation.abort() returned error: {e}");
						}
					}
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts) = connect_result
			.await
			.map_err(|_| AssociationError::Channel(ChannelError::Closed))??;

		Ok(Self {
			channel: tx,
			presentation_contexts,
			tcp_stream,
		})
	}
}

impl Association for ServerAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn try_receive(&self, timeout: Duration) -> Result<Option<Pdu>, AssociationError> {
		self.channel
			.ask(Command::TryReceive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	fn close(&mut self) {
		debug!("Closing TcpStream from outside");

		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			// The peer usually closed the connection already.
			debug!("TcpStream::shutdown failed: {err}");
		}
	}

	fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
		&self.presentation_contexts
	}
}

/// Checks without blocking whether the peer has sent bytes that were not read yet.
/// Bytes already buffered by `dicom-ul` are not visible here.
fn has_pending_data(stream: &TcpStream) -> std::io::Result<bool> {
	stream.set_nonblocking(true)?;
	let mut buf = [0_u8; 1];
	let pending = match stream.peek(&mut buf) {
		Ok(read) => Ok(read > 0),
		Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(false),
		Err(err) => Err(err),
	};
	stream.set_nonblocking(false)?;
	pending
}

impl Drop for ServerAssociation {
	fn drop(&mut self) {
		self.close();
	}
}
