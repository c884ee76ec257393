//! Host-to-tenant resolution.
//!
//! A request's `Host` header is normalized to a bare domain, looked up in the
//! tenant registry and turned into a [`TenantContext`] naming the database the
//! request should run against.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{DevFallback, ResolverConfig};
use crate::error::{TenancyError, TenancyResult};
use crate::manager::TenantConnectionManager;
use crate::pool::ConnectionFactory;

/// A tenant row from the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TenantRecord {
    pub id: String,
    pub domain: String,
    pub database_name: String,
}

/// Resolved tenant for one request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TenantContext {
    pub tenant_id: String,
    pub database_name: String,
    pub domain: String,
    /// Registry row, absent when the development fallback was used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<TenantRecord>,
}

impl TenantContext {
    pub fn is_dev_fallback(&self) -> bool {
        self.tenant.is_none()
    }
}

/// Lookup of tenants by domain.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn find_by_domain(&self, domain: &str) -> TenancyResult<Option<TenantRecord>>;
}

/// Reduce a `Host` header value to a lower-case domain.
///
/// Strips the port (bracketed IPv6 hosts keep their address) and a trailing
/// dot. Returns `None` when nothing is left.
pub fn normalize_domain(host: &str) -> Option<String> {
    let host = host.trim();
    let domain = match host.strip_prefix('[') {
        Some(rest) => rest.split(']').next().unwrap_or_default(),
        None => host.split(':').next().unwrap_or_default(),
    };
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    (!domain.is_empty()).then_some(domain)
}

/// Resolves hosts to tenants through a [`TenantDirectory`].
pub struct DomainResolver<D> {
    directory: D,
    dev_fallback: Option<DevFallback>,
}

impl<D: TenantDirectory> DomainResolver<D> {
    pub fn new(directory: D, config: &ResolverConfig) -> Self {
        let dev_fallback = config.dev_fallback.clone().map(|mut fallback| {
            fallback.domain = normalize_domain(&fallback.domain).unwrap_or_default();
            fallback
        });
        Self {
            directory,
            dev_fallback,
        }
    }

    /// Tenant serving `host`.
    ///
    /// The development fallback applies only to its configured domain and only
    /// when the registry has no row for it.
    pub async fn resolve(&self, host: Option<&str>) -> TenancyResult<TenantContext> {
        let domain = host
            .and_then(normalize_domain)
            .ok_or(TenancyError::MissingHost)?;

        let record = self
            .directory
            .find_by_domain(&domain)
            .await
            .map_err(|e| match e {
                TenancyError::Registry(_) => e,
                other => TenancyError::Registry(other.to_string()),
            })?;

        if let Some(record) = record {
            debug!(%domain, tenant_id = %record.id, database = %record.database_name, "tenant resolved");
            return Ok(TenantContext {
                tenant_id: record.id.clone(),
                database_name: record.database_name.clone(),
                domain,
                tenant: Some(record),
            });
        }

        match &self.dev_fallback {
            Some(fallback) if fallback.domain == domain => {
                warn!(%domain, database = %fallback.database, "using development tenant fallback");
                Ok(TenantContext {
                    tenant_id: fallback.tenant_id.clone(),
                    database_name: fallback.database.clone(),
                    domain,
                    tenant: None,
                })
            }
            _ => {
                debug!(%domain, "no tenant registered for domain");
                Err(TenancyError::TenantNotFound(domain))
            }
        }
    }

    /// Resolve `host` and acquire its tenant pool.
    pub async fn connect<F: ConnectionFactory>(
        &self,
        host: Option<&str>,
        manager: &TenantConnectionManager<F>,
    ) -> TenancyResult<(TenantContext, F::Pool)> {
        let context = self.resolve(host).await?;
        let pool = manager
            .get_tenant_connection(&context.database_name)
            .await?;
        Ok((context, pool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::testing::{MockFactory, manual_sweep_config};

    // ── Mock directory ───────────────────────────────────────────────

    #[derive(Default)]
    struct MockDirectory {
        tenants: HashMap<String, TenantRecord>,
        unavailable: AtomicBool,
    }

    impl MockDirectory {
        fn with(records: &[(&str, &str, &str)]) -> Self {
            Self {
                tenants: records
                    .iter()
                    .map(|(id, domain, database)| {
                        (
                            domain.to_string(),
                            TenantRecord {
                                id: id.to_string(),
                                domain: domain.to_string(),
                                database_name: database.to_string(),
                            },
                        )
                    })
                    .collect(),
                unavailable: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl TenantDirectory for MockDirectory {
        async fn find_by_domain(&self, domain: &str) -> TenancyResult<Option<TenantRecord>> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(TenancyError::connection("registry", "connection refused"));
            }
            Ok(self.tenants.get(domain).cloned())
        }
    }

    fn dev_config(domain: &str) -> ResolverConfig {
        ResolverConfig {
            dev_fallback: Some(DevFallback {
                domain: domain.to_string(),
                tenant_id: "dev-tenant".to_string(),
                database: "saas_dev".to_string(),
            }),
            ..ResolverConfig::default()
        }
    }

    // ── normalize_domain ─────────────────────────────────────────────

    #[test]
    fn strips_port_and_lowercases() {
        assert_eq!(normalize_domain("Acme.Example.com:8443").as_deref(), Some("acme.example.com"));
        assert_eq!(normalize_domain("acme.example.com").as_deref(), Some("acme.example.com"));
        assert_eq!(normalize_domain("  localhost:3000 ").as_deref(), Some("localhost"));
    }

    #[test]
    fn strips_trailing_dot() {
        assert_eq!(normalize_domain("acme.example.com.").as_deref(), Some("acme.example.com"));
    }

    #[test]
    fn keeps_bracketed_ipv6_address() {
        assert_eq!(normalize_domain("[::1]:8080").as_deref(), Some("::1"));
        assert_eq!(normalize_domain("[FE80::1]").as_deref(), Some("fe80::1"));
    }

    #[test]
    fn empty_hosts_normalize_to_none() {
        for host in ["", "   ", ":8080", "[]:80", "."] {
            assert_eq!(normalize_domain(host), None, "{host:?}");
        }
    }

    // ── resolve ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn resolves_registered_domain() {
        let directory = MockDirectory::with(&[("t1", "acme.example.com", "saas_tenant_t1")]);
        let resolver = DomainResolver::new(directory, &ResolverConfig::default());

        let context = resolver.resolve(Some("ACME.example.com:443")).await.unwrap();
        assert_eq!(context.tenant_id, "t1");
        assert_eq!(context.database_name, "saas_tenant_t1");
        assert_eq!(context.domain, "acme.example.com");
        assert!(!context.is_dev_fallback());
    }

    #[tokio::test]
    async fn missing_host_is_rejected() {
        let resolver = DomainResolver::new(MockDirectory::default(), &ResolverConfig::default());
        assert_eq!(resolver.resolve(None).await.unwrap_err(), TenancyError::MissingHost);
        assert_eq!(resolver.resolve(Some("")).await.unwrap_err(), TenancyError::MissingHost);
    }

    #[tokio::test]
    async fn unknown_domain_is_not_found() {
        let resolver = DomainResolver::new(MockDirectory::default(), &ResolverConfig::default());
        assert_eq!(
            resolver.resolve(Some("nobody.example.com")).await.unwrap_err(),
            TenancyError::TenantNotFound("nobody.example.com".to_string())
        );
    }

    #[tokio::test]
    async fn dev_fallback_applies_only_to_its_domain() {
        let resolver = DomainResolver::new(MockDirectory::default(), &dev_config("LocalHost"));

        let context = resolver.resolve(Some("localhost:3000")).await.unwrap();
        assert_eq!(context.tenant_id, "dev-tenant");
        assert_eq!(context.database_name, "saas_dev");
        assert!(context.is_dev_fallback());

        assert!(matches!(
            resolver.resolve(Some("other.example.com")).await,
            Err(TenancyError::TenantNotFound(_))
        ));
    }

    #[tokio::test]
    async fn registered_tenant_wins_over_dev_fallback() {
        let directory = MockDirectory::with(&[("t9", "localhost", "saas_tenant_t9")]);
        let resolver = DomainResolver::new(directory, &dev_config("localhost"));
        let context = resolver.resolve(Some("localhost")).await.unwrap();
        assert_eq!(context.database_name, "saas_tenant_t9");
    }

    #[tokio::test]
    async fn registry_failures_are_registry_errors() {
        let directory = MockDirectory::default();
        directory.unavailable.store(true, Ordering::SeqCst);
        let resolver = DomainResolver::new(directory, &dev_config("localhost"));

        let err = resolver.resolve(Some("localhost")).await.unwrap_err();
        assert!(matches!(err, TenancyError::Registry(_)));
        assert!(err.is_unavailable());
    }

    // ── connect ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn connect_acquires_the_tenant_pool() {
        let factory = MockFactory::new();
        let manager = TenantConnectionManager::new(manual_sweep_config(3), Arc::clone(&factory));
        manager.start().await.unwrap();
        let directory = MockDirectory::with(&[("t1", "acme.example.com", "saas_tenant_t1")]);
        let resolver = DomainResolver::new(directory, &ResolverConfig::default());

        let (context, pool) = resolver
            .connect(Some("acme.example.com"), &manager)
            .await
            .unwrap();
        assert_eq!(context.tenant_id, "t1");
        assert_eq!(pool.database, "saas_tenant_t1");
        assert_eq!(manager.get_stats().await.tenants, ["saas_tenant_t1"]);
    }

    #[tokio::test]
    async fn connect_surfaces_pool_failures() {
        let factory = MockFactory::new();
        factory.fail_database("saas_tenant_t1");
        let manager = TenantConnectionManager::new(manual_sweep_config(3), Arc::clone(&factory));
        manager.start().await.unwrap();
        let directory = MockDirectory::with(&[("t1", "acme.example.com", "saas_tenant_t1")]);
        let resolver = DomainResolver::new(directory, &ResolverConfig::default());

        let err = resolver
            .connect(Some("acme.example.com"), &manager)
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }
}
