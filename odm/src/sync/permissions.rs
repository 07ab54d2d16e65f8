use std::collections::HashMap;
use std::str::FromStr;

use odm_core::RemoteDriveClient;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::snapshot::Permission;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainMap {
    rules: HashMap<String, String>,
}

#[derive(Debug, Error)]
#[error("invalid domain mapping {0:?}, expected source:destination")]
pub struct DomainMapError(String);

impl FromStr for DomainMap {
    type Err = DomainMapError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut rules = HashMap::new();
        for pair in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((from, to)) = pair.split_once(':') else {
                return Err(DomainMapError(pair.to_string()));
            };
            let (from, to) = (from.trim(), to.trim());
            if from.is_empty() || to.is_empty() {
                return Err(DomainMapError(pair.to_string()));
            }
            rules.insert(from.to_lowercase(), to.to_lowercase());
        }
        Ok(Self { rules })
    }
}

impl DomainMap {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rewrite(&self, address: &str) -> String {
        let Some((local, domain)) = address.rsplit_once('@') else {
            return address.to_string();
        };
        match self.rules.get(&domain.to_lowercase()) {
            Some(mapped) => format!("{local}@{mapped}"),
            None => address.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareGrant {
    pub address: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShareSummary {
    pub applied: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PermissionReplicator {
    domains: DomainMap,
}

impl PermissionReplicator {
    pub fn new(domains: DomainMap) -> Self {
        Self { domains }
    }

    /// Grants worth replaying: no link shares, no owners, addresses rewritten.
    pub fn grants(&self, permissions: &[Permission]) -> Vec<ShareGrant> {
        let mut grants = Vec::new();
        for permission in permissions {
            if let Some(link) = &permission.link {
                info!(
                    scope = link.scope.as_deref().unwrap_or("unknown"),
                    "skipping link share"
                );
                continue;
            }
            if permission.roles.iter().any(|role| role == "owner") {
                continue;
            }
            let Some(address) = permission.grantee() else {
                debug!("skipping permission without a grantee address");
                continue;
            };
            grants.push(ShareGrant {
                address: self.domains.rewrite(address),
                roles: permission.roles.clone(),
            });
        }
        grants
    }

    pub async fn replicate<C: RemoteDriveClient>(
        &self,
        client: &C,
        target: &C::Handle,
        path: &str,
        permissions: &[Permission],
    ) -> ShareSummary {
        let mut summary = ShareSummary::default();
        for grant in self.grants(permissions) {
            match client.share(target, &grant.address, &grant.roles).await {
                Ok(()) => {
                    debug!(path, address = %grant.address, roles = ?grant.roles, "shared");
                    summary.applied += 1;
                }
                Err(err) => {
                    warn!(path, address = %grant.address, "failed to share: {err}");
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}
