//! HTTP client adapter using Hyper with Rustls (HTTP/1.1 + HTTP/2).
//!
//! One pooled client per process backs both proxied traffic and health
//! probes so connections are shared per backend authority. A second client
//! with certificate verification disabled serves backends that explicitly
//! opt out via their `tls.verify: false` transport option; the forwarder
//! signals that through a request extension.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::body::Body;
use eyre::Result;
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::{Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::ports::http_client::{
    HttpClient, HttpClientError, HttpClientResult, UpstreamTlsOptions,
};

type PooledClient = Client<HttpsConnector<HttpConnector>, Body>;

pub struct HttpClientAdapter {
    client: PooledClient,
    insecure_client: PooledClient,
}

impl HttpClientAdapter {
    pub fn new() -> Result<Self> {
        // Install the default crypto provider for rustls if not already set.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("failed to add native certificate to root store");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(errors = ?native_certs.errors, "some native certificates failed to load");
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let mut insecure_config = rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        insecure_config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerification::new()));

        let build = |tls: rustls::ClientConfig| {
            let mut http_connector = HttpConnector::new();
            http_connector.enforce_http(false);
            let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
                .with_tls_config(tls)
                .https_or_http()
                .enable_http1()
                .wrap_connector(http_connector);
            Client::builder(TokioExecutor::new()).build::<_, Body>(https_connector)
        };

        Ok(Self {
            client: build(tls_config),
            insecure_client: build(insecure_config),
        })
    }

    fn client_for(&self, req: &Request<Body>) -> &PooledClient {
        match req.extensions().get::<UpstreamTlsOptions>() {
            Some(options) if !options.verify => &self.insecure_client,
            _ => &self.client,
        }
    }
}

impl Default for HttpClientAdapter {
    fn default() -> Self {
        Self::new().expect("failed to create HTTP client")
    }
}

fn classify_send_error(error: hyper_util::client::legacy::Error) -> HttpClientError {
    let message = error.to_string();
    let mut parts = vec![message.to_ascii_lowercase()];
    let mut cause: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(&error);
    while let Some(inner) = cause {
        parts.push(inner.to_string().to_ascii_lowercase());
        cause = inner.source();
    }
    let chain = parts.join("; ");

    if chain.contains("certificate") || chain.contains("handshake") || chain.contains("tls") {
        HttpClientError::Tls(message)
    } else if error.is_connect() {
        HttpClientError::Connect(message)
    } else if chain.contains("reset") || chain.contains("broken pipe") || chain.contains("closed")
    {
        HttpClientError::Reset(message)
    } else {
        HttpClientError::Connect(message)
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
        if req.uri().host().is_none() {
            return Err(HttpClientError::InvalidRequest(format!(
                "outgoing uri has no host: {}",
                req.uri()
            )));
        }

        let client = self.client_for(&req).clone();
        match client.request(req).await {
            Ok(response) => {
                let (parts, hyper_body) = response.into_parts();
                Ok(Response::from_parts(parts, Body::new(hyper_body)))
            }
            Err(error) => Err(classify_send_error(error)),
        }
    }

    async fn probe(
        &self,
        req: Request<Body>,
        probe_timeout: Duration,
    ) -> HttpClientResult<StatusCode> {
        let client = self.client_for(&req).clone();
        match timeout(probe_timeout, client.request(req)).await {
            Ok(Ok(response)) => {
                let status = response.status();
                // Drain the body so the connection can return to the pool.
                let _ = response.into_body().collect().await;
                Ok(status)
            }
            Ok(Err(error)) => Err(classify_send_error(error)),
            Err(_) => Err(HttpClientError::Timeout(probe_timeout.as_millis() as u64)),
        }
    }
}

/// Certificate verifier that accepts anything; only reachable for backends
/// whose spec sets `tls.verify: false`.
#[derive(Debug)]
struct NoVerification {
    provider: rustls::crypto::CryptoProvider,
}

impl NoVerification {
    fn new() -> Self {
        Self {
            provider: rustls::crypto::aws_lc_rs::default_provider(),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
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
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
