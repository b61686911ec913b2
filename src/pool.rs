//! Bounded handle pool and session-wide shared caches.
//!
//! A [`Handle`] is the unit of transfer capacity: the pool holds a fixed set
//! of them, a transfer borrows one for its whole duration and returns it on
//! completion. Borrowing waits (bounded by the transfer deadline) when every
//! handle is busy, so a flood of submissions backs up at the pool instead of
//! growing without limit. A handle also parks at most one keep-alive
//! connection between transfers, keyed by scheme, host and port.
//!
//! [`SharedCaches`] is the cross-transfer state every handle shares: the DNS
//! cache, the two TLS client configurations (verifying and not) and the
//! optional cookie jar.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::sync::Semaphore;

use crate::error::{TransportCode, TransportFault};
use crate::wire::{Conn, ConnKey};

/// How long a resolved address set stays valid.
const DNS_TTL: Duration = Duration::from_secs(60);

/// One transfer slot.
///
/// Owns the per-transfer connection state; between transfers it may park a
/// single keep-alive connection for reuse.
pub(crate) struct Handle {
    id: usize,
    source_ip: Option<IpAddr>,
    parked: Option<(ConnKey, Conn)>,
}

impl Handle {
    fn new(id: usize, source_ip: Option<IpAddr>) -> Self {
        Self {
            id,
            source_ip,
            parked: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Local address this handle binds outgoing connections to, when the
    /// session was configured with source addresses.
    pub fn source_ip(&self) -> Option<IpAddr> {
        self.source_ip
    }

    /// Take the parked connection if it matches the target; a parked
    /// connection for a different target is dropped (closing it).
    pub fn take_parked(&mut self, key: &ConnKey) -> Option<Conn> {
        match self.parked.take() {
            Some((parked_key, conn)) if parked_key == *key => Some(conn),
            _ => None,
        }
    }

    /// Park a keep-alive connection for the next transfer to this target.
    pub fn park(&mut self, key: ConnKey, conn: Conn) {
        self.parked = Some((key, conn));
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("source_ip", &self.source_ip)
            .field("parked", &self.parked.as_ref().map(|(key, _)| key))
            .finish()
    }
}

/// Fixed-size pool of transfer handles.
pub(crate) struct ConnectionPool {
    free: Mutex<Vec<Handle>>,
    permits: Semaphore,
    size: usize,
}

impl ConnectionPool {
    /// Allocate every handle up front. Source addresses, when given, are
    /// assigned round-robin across the handles.
    pub fn new(size: usize, source_ips: &[IpAddr]) -> Self {
        let handles = (0..size)
            .map(|id| {
                let source_ip = if source_ips.is_empty() {
                    None
                } else {
                    Some(source_ips[id % source_ips.len()])
                };
                Handle::new(id, source_ip)
            })
            .collect();
        Self {
            free: Mutex::new(handles),
            permits: Semaphore::new(size),
            size,
        }
    }

    /// Borrow a handle, waiting up to `wait` for one to free up. The guard
    /// returns the handle to the pool on drop, so a transfer cancelled by
    /// its deadline never leaks pool capacity.
    pub async fn borrow(pool: &Arc<Self>, wait: Duration) -> Result<PooledHandle, TransportFault> {
        let permit = match tokio::time::timeout(wait, pool.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(TransportFault::new(
                    TransportCode::Unknown,
                    "connection pool is closed",
                ))
            }
            Err(_) => {
                return Err(TransportFault::new(
                    TransportCode::OperationTimedOut,
                    "no transfer handle became free before the deadline",
                ))
            }
        };
        permit.forget();
        let handle = pool
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or_else(|| {
                TransportFault::new(TransportCode::Unknown, "pool accounting out of sync")
            })?;
        Ok(PooledHandle {
            pool: pool.clone(),
            handle: Some(handle),
        })
    }

    fn put(&self, handle: Handle) {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        self.permits.add_permits(1);
    }

    /// Handles currently free.
    pub fn available(&self) -> usize {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// RAII guard over a borrowed [`Handle`].
pub(crate) struct PooledHandle {
    pool: Arc<ConnectionPool>,
    handle: Option<Handle>,
}

impl std::fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledHandle").field(&self.handle).finish()
    }
}

impl std::ops::Deref for PooledHandle {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        // Populated from borrow until drop.
        match &self.handle {
            Some(handle) => handle,
            None => unreachable!(),
        }
    }
}

impl std::ops::DerefMut for PooledHandle {
    fn deref_mut(&mut self) -> &mut Handle {
        match &mut self.handle {
            Some(handle) => handle,
            None => unreachable!(),
        }
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.put(handle);
        }
    }
}

/// Cookie store shared by every request of a session, keyed by host.
///
/// Deliberately minimal: no path or expiry handling, a later cookie with the
/// same name replaces the earlier one.
#[derive(Debug, Default)]
pub struct CookieJar {
    store: Mutex<HashMap<String, Vec<(String, String)>>>,
}

impl CookieJar {
    /// All cookies stored for a host, in insertion order.
    pub fn cookies_for(&self, host: &str) -> Vec<(String, String)> {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host)
            .cloned()
            .unwrap_or_default()
    }

    /// Merge response cookies into the store for a host.
    pub fn store(&self, host: &str, cookies: &[(String, String)]) {
        if cookies.is_empty() {
            return;
        }
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = store.entry(host.to_string()).or_default();
        for (name, value) in cookies {
            entry.retain(|(n, _)| n != name);
            entry.push((name.clone(), value.clone()));
        }
    }
}

/// State shared across every transfer of a session.
pub(crate) struct SharedCaches {
    dns: moka::sync::Cache<String, Arc<Vec<SocketAddr>>>,
    tls_verified: Arc<ClientConfig>,
    tls_unverified: Arc<ClientConfig>,
    cookies: Option<CookieJar>,
}

impl SharedCaches {
    pub fn new(share_cookies: bool) -> Self {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_verified = Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let tls_unverified = Arc::new(
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
                .with_no_client_auth(),
        );

        Self {
            dns: moka::sync::Cache::builder()
                .max_capacity(1024)
                .time_to_live(DNS_TTL)
                .build(),
            tls_verified,
            tls_unverified,
            cookies: share_cookies.then(CookieJar::default),
        }
    }

    /// Resolve a host, serving repeats from the shared cache while the TTL
    /// lasts.
    pub async fn resolve(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Arc<Vec<SocketAddr>>, TransportFault> {
        let key = format!("{host}:{port}");
        if let Some(addrs) = self.dns.get(&key) {
            return Ok(addrs);
        }
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|err| {
                TransportFault::new(
                    TransportCode::CouldntResolveHost,
                    format!("{host}: {err}"),
                )
            })?
            .collect();
        if addrs.is_empty() {
            return Err(TransportFault::new(
                TransportCode::CouldntResolveHost,
                format!("{host}: no addresses"),
            ));
        }
        let addrs = Arc::new(addrs);
        self.dns.insert(key, addrs.clone());
        Ok(addrs)
    }

    /// The TLS configuration for the requested verification mode.
    pub fn tls_config(&self, verify: bool) -> Arc<ClientConfig> {
        if verify {
            self.tls_verified.clone()
        } else {
            self.tls_unverified.clone()
        }
    }

    /// The session cookie jar, when cookie sharing is on.
    pub fn jar(&self) -> Option<&CookieJar> {
        self.cookies.as_ref()
    }
}

/// Certificate verifier that accepts anything, backing `verify=false`.
/// Signatures are still checked so a broken handshake fails loudly.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
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
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn borrow_and_drop_restore_the_pool() {
        let pool = Arc::new(ConnectionPool::new(3, &[]));
        assert_eq!(pool.available(), 3);
        let a = ConnectionPool::borrow(&pool, Duration::from_millis(100))
            .await
            .unwrap();
        let b = ConnectionPool::borrow(&pool, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(pool.available(), 1);
        assert_ne!(a.id(), b.id());
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out_the_borrow() {
        let pool = Arc::new(ConnectionPool::new(1, &[]));
        let held = ConnectionPool::borrow(&pool, Duration::from_millis(100))
            .await
            .unwrap();
        let fault = ConnectionPool::borrow(&pool, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(fault.code, TransportCode::OperationTimedOut);
        drop(held);
        assert!(ConnectionPool::borrow(&pool, Duration::from_millis(50))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn waiting_borrow_wakes_when_a_handle_returns() {
        let pool = Arc::new(ConnectionPool::new(1, &[]));
        let held = ConnectionPool::borrow(&pool, Duration::from_millis(100))
            .await
            .unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { ConnectionPool::borrow(&pool, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        let got = waiter.await.unwrap();
        assert!(got.is_ok());
    }

    #[test]
    fn source_ips_round_robin_across_handles() {
        let ips: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];
        let pool = ConnectionPool::new(4, &ips);
        let handles = pool
            .free
            .lock()
            .unwrap()
            .iter()
            .map(|h| h.source_ip())
            .collect::<Vec<_>>();
        assert_eq!(
            handles,
            vec![
                Some(ips[0]),
                Some(ips[1]),
                Some(ips[0]),
                Some(ips[1]),
            ]
        );

        let unbound = ConnectionPool::new(2, &[]);
        assert!(unbound.free.lock().unwrap().iter().all(|h| h.source_ip().is_none()));
    }

    #[test]
    fn cookie_jar_later_value_wins() {
        let jar = CookieJar::default();
        jar.store("example.com", &[("session".into(), "one".into())]);
        jar.store(
            "example.com",
            &[("session".into(), "two".into()), ("lang".into(), "en".into())],
        );
        assert_eq!(
            jar.cookies_for("example.com"),
            vec![
                ("session".to_string(), "two".to_string()),
                ("lang".to_string(), "en".to_string()),
            ]
        );
        assert!(jar.cookies_for("other.example").is_empty());
    }

    #[tokio::test]
    async fn resolve_serves_repeats_from_cache() {
        let caches = SharedCaches::new(false);
        let first = caches.resolve("127.0.0.1", 80).await.unwrap();
        let second = caches.resolve("127.0.0.1", 80).await.unwrap();
        assert!(!first.is_empty());
        // Same Arc means the second lookup never hit the resolver.
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn tls_configs_differ_by_verification_mode() {
        let caches = SharedCaches::new(true);
        assert!(!Arc::ptr_eq(
            &caches.tls_config(true),
            &caches.tls_config(false)
        ));
        assert!(caches.jar().is_some());
        assert!(SharedCaches::new(false).jar().is_none());
    }
}
