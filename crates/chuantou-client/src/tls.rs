//! TLS connector for `tls://` server urls.

use std::sync::Arc;

use rustls::{ClientConfig, crypto::CryptoProvider};
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, client::TlsStream};

pub(crate) async fn connect(
	stream: TcpStream,
	domain: &str,
	skip_cert_verify: bool,
) -> eyre::Result<TlsStream<TcpStream>> {
	let config = if skip_cert_verify {
		danger::insecure_config()?
	} else {
		tls_config()?
	};
	let connector = TlsConnector::from(Arc::new(config));
	let server_name = ServerName::try_from(domain.to_owned())
		.map_err(|err| eyre::eyre!("invalid server name {domain}: {err}"))?;
	Ok(connector.connect(server_name, stream).await?)
}

fn tls_config() -> eyre::Result<ClientConfig> {
	use rustls_platform_verifier::BuilderVerifierExt;

	let provider = CryptoProvider::get_default()
		.ok_or_else(|| eyre::eyre!("no default crypto provider installed"))?;
	let config = ClientConfig::builder_with_provider(provider.clone())
		.with_protocol_versions(&[&rustls::version::TLS13])
		.map_err(|err| eyre::eyre!("tls configuration: {err}"))?
		.with_platform_verifier()?
		.with_no_client_auth();
	Ok(config)
}

mod danger {
	use std::sync::Arc;

	use rustls::{
		ClientConfig, DigitallySignedStruct, SignatureScheme,
		client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
		crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature},
	};
	use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

	/// Accepts any certificate. Development only.
	#[derive(Debug)]
	struct NoVerify {
		provider: Arc<CryptoProvider>,
	}

	impl ServerCertVerifier for NoVerify {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer<'_>,
			_intermediates: &[CertificateDer<'_>],
			_server_name: &ServerName<'_>,
			_ocsp_response: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			message: &[u8],
			cert: &CertificateDer<'_>,
			dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			verify_tls12_signature(
				message,
				cert,
				dss,
				&self.provider.signature_verification_algorithms,
			)
		}

		fn verify_tls13_signature(
			&self,
			message: &[u8],
			cert: &CertificateDer<'_>,
			dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			verify_tls13_signature(
				message,
				cert,
				dss,
				&self.provider.signature_verification_algorithms,
			)
		}

		fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
			self.provider
				.signature_verification_algorithms
				.supported_schemes()
		}
	}

	pub(super) fn insecure_config() -> eyre::Result<ClientConfig> {
		let provider = CryptoProvider::get_default()
			.ok_or_else(|| eyre::eyre!("no default crypto provider installed"))?
			.clone();
		let config = ClientConfig::builder_with_provider(provider.clone())
			.with_protocol_versions(&[&rustls::version::TLS13])
			.map_err(|err| eyre::eyre!("tls configuration: {err}"))?
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(NoVerify { provider }))
			.with_no_client_auth();
		Ok(config)
	}
}
