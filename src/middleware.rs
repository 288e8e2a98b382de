//! actix-web middleware wiring the gate and detector into a request pipeline.
//!
//! ## Flow
//!
//! 1. Extract the client IP (configured proxy headers, then peer address)
//! 2. **Gate**: blocked clients get `403 ScanForbidden` and the wrapped
//!    service is never called
//! 3. Dispatch to the wrapped service
//! 4. **Detector**: a `404 Not Found` outcome is recorded against the client

use crate::config::{Config, IpExtractionConfig};
use crate::detector::ScanDetector;
use crate::gate::{ScanGate, REJECT_BODY};
use crate::policy::{parse_identifier, TrustedSet};
use crate::store::ExpiringStore;
use actix_web::body::{BoxBody, EitherBody};
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::HeaderMap;
use actix_web::http::StatusCode;
use actix_web::{Error, HttpResponse};
use futures_util::future::LocalBoxFuture;
use std::future::{ready, Ready};
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Scan protection middleware factory.
#[derive(Clone)]
pub struct ScanProtection {
    gate: Arc<ScanGate>,
    detector: Arc<ScanDetector>,
    ip_extraction: Arc<IpExtractionConfig>,
    enabled: bool,
}

impl ScanProtection {
    pub fn new(
        gate: Arc<ScanGate>,
        detector: Arc<ScanDetector>,
        ip_extraction: IpExtractionConfig,
    ) -> Self {
        Self {
            gate,
            detector,
            ip_extraction: Arc::new(ip_extraction),
            enabled: true,
        }
    }

    /// Build gate and detector over one shared store.
    pub fn from_config(config: &Config, store: Arc<dyn ExpiringStore>) -> Self {
        Self {
            enabled: config.settings.enabled,
            ..Self::new(
                Arc::new(ScanGate::from_config(config, store.clone())),
                Arc::new(ScanDetector::from_config(config, store)),
                config.ip_extraction.clone(),
            )
        }
    }

    /// The detector, for maintenance operations.
    pub fn detector(&self) -> &Arc<ScanDetector> {
        &self.detector
    }

    pub fn gate(&self) -> &Arc<ScanGate> {
        &self.gate
    }
}

impl<S, B> Transform<S, ServiceRequest> for ScanProtection
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B, BoxBody>>;
    type Error = Error;
    type InitError = ();
    type Transform = ScanProtectionMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ScanProtectionMiddleware {
            service: Rc::new(service),
            protection: self.clone(),
        }))
    }
}

/// The middleware service that checks each request.
pub struct ScanProtectionMiddleware<S> {
    service: Rc<S>,
    protection: ScanProtection,
}

impl<S, B> Service<ServiceRequest> for ScanProtectionMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B, BoxBody>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();

        if !self.protection.enabled {
            return Box::pin(async move {
                let res = service.call(req).await?;
                Ok(res.map_into_left_body())
            });
        }

        let gate = self.protection.gate.clone();
        let detector = self.protection.detector.clone();
        let client_ip = extract_client_ip(
            req.headers(),
            req.peer_addr(),
            &self.protection.ip_extraction,
            detector.trusted(),
        )
        .map(|ip| ip.to_string());

        Box::pin(async move {
            let identifier = client_ip.as_deref();

            if gate.check(identifier).await.is_reject() {
                debug!(ip = ?identifier, path = req.path(), "Short-circuiting blocked client");
                let response = HttpResponse::build(StatusCode::FORBIDDEN).body(REJECT_BODY);
                return Ok(req.into_response(response).map_into_right_body());
            }

            match service.call(req).await {
                Ok(res) => {
                    if res.status() == StatusCode::NOT_FOUND {
                        detector.on_not_found(identifier).await;
                    }
                    Ok(res.map_into_left_body())
                }
                Err(e) => {
                    if e.as_response_error().status_code() == StatusCode::NOT_FOUND {
                        detector.on_not_found(identifier).await;
                    }
                    Err(e)
                }
            }
        })
    }
}

/// Extract the client IP from proxy headers, falling back to the peer address.
///
/// Trusted and loopback values in proxy headers are ignored: a forged
/// `X-Forwarded-For: 127.0.0.1` (or any address in `trusted`) must not claim
/// trusted status. Only the peer address can be trusted.
pub fn extract_client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    config: &IpExtractionConfig,
    trusted: &TrustedSet,
) -> Option<IpAddr> {
    for header_name in &config.headers {
        let Some(value) = headers
            .get(header_name.to_lowercase().as_str())
            .and_then(|v| v.to_str().ok())
        else {
            continue;
        };

        let candidate = if config.use_first_ip {
            // X-Forwarded-For: client, proxy1, proxy2
            value.split(',').next()
        } else {
            // Use the last IP (closest proxy)
            value.split(',').last()
        };

        match candidate.and_then(parse_identifier) {
            Some(ip) if ip.is_loopback() || trusted.contains(&ip) => {
                warn!(header = %header_name, value, "Ignoring trusted address in proxy header");
            }
            Some(ip) => return Some(ip),
            None => {}
        }
    }

    peer.map(|addr| addr.ip())
}
