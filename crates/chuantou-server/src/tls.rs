//! Optional TLS wrap for the control/data transport.

use std::sync::Arc;

use eyre::Context as _;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject as _};
use tokio_rustls::TlsAcceptor;

use crate::TlsOpts;

pub(crate) fn acceptor(opts: &TlsOpts) -> eyre::Result<TlsAcceptor> {
	let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(&opts.cert)
		.map_err(|err| eyre::eyre!("Failed to read certificate {}: {err}", opts.cert.display()))?
		.collect::<Result<_, _>>()
		.map_err(|err| eyre::eyre!("Failed to parse certificate {}: {err}", opts.cert.display()))?;
	let key = PrivateKeyDer::from_pem_file(&opts.key)
		.map_err(|err| eyre::eyre!("Failed to read private key {}: {err}", opts.key.display()))?;

	let config = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(certs, key)
		.wrap_err("Failed to configure TLS certificate")?;

	Ok(TlsAcceptor::from(Arc::new(config)))
}
