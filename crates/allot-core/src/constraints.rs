use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Operator-mandated bounds on the stored quota of one resource.
///
/// `expected` pins the quota to an exact value; otherwise `minimum` and
/// `maximum` clamp it. Loaded from the quota-constraints file referenced in
/// the cluster config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConstraint {
    #[serde(default)]
    pub minimum: Option<u64>,
    #[serde(default)]
    pub maximum: Option<u64>,
    #[serde(default)]
    pub expected: Option<u64>,
}

impl QuotaConstraint {
    /// Whether a stored quota satisfies this constraint as-is.
    pub fn allows(&self, quota: u64) -> bool {
        if let Some(expected) = self.expected {
            return quota == expected;
        }
        if self.minimum.is_some_and(|min| quota < min) {
            return false;
        }
        if self.maximum.is_some_and(|max| quota > max) {
            return false;
        }
        true
    }

    /// The nearest quota value that satisfies this constraint.
    pub fn apply_to(&self, quota: u64) -> u64 {
        if let Some(expected) = self.expected {
            return expected;
        }
        let mut quota = quota;
        if let Some(min) = self.minimum {
            quota = quota.max(min);
        }
        if let Some(max) = self.maximum {
            quota = quota.min(max);
        }
        quota
    }

    /// The quota a brand-new resource record starts with under this
    /// constraint.
    pub fn initial_quota(&self) -> u64 {
        self.expected.or(self.minimum).unwrap_or(0)
    }

    fn validate(&self, location: &str) -> Result<(), CoreError> {
        if let (Some(min), Some(max)) = (self.minimum, self.maximum) {
            if min > max {
                return Err(CoreError::InvalidConfig(format!(
                    "quota constraint for {location}: minimum {min} exceeds maximum {max}"
                )));
            }
        }
        Ok(())
    }
}

/// resource name → constraint
pub type ResourceConstraints = BTreeMap<String, QuotaConstraint>;
/// service type → resource name → constraint
pub type ServiceConstraints = BTreeMap<String, ResourceConstraints>;

/// All quota constraints for one cluster.
///
/// Domain constraints are keyed by domain name; project constraints by
/// `"{domain}/{project}"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaConstraintSet {
    #[serde(default)]
    pub domains: BTreeMap<String, ServiceConstraints>,
    #[serde(default)]
    pub projects: BTreeMap<String, ServiceConstraints>,
}

impl QuotaConstraintSet {
    pub fn for_domain(
        &self,
        domain_name: &str,
        service_type: &str,
        resource_name: &str,
    ) -> Option<QuotaConstraint> {
        self.domains
            .get(domain_name)?
            .get(service_type)?
            .get(resource_name)
            .copied()
    }

    pub fn for_project(
        &self,
        domain_name: &str,
        project_name: &str,
        service_type: &str,
        resource_name: &str,
    ) -> Option<QuotaConstraint> {
        self.projects
            .get(&format!("{domain_name}/{project_name}"))?
            .get(service_type)?
            .get(resource_name)
            .copied()
    }

    /// All resource constraints configured for one project and service.
    pub fn project_service(
        &self,
        domain_name: &str,
        project_name: &str,
        service_type: &str,
    ) -> Option<&ResourceConstraints> {
        self.projects
            .get(&format!("{domain_name}/{project_name}"))?
            .get(service_type)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        for (domain, services) in &self.domains {
            for (service, resources) in services {
                for (resource, constraint) in resources {
                    constraint.validate(&format!("domain {domain}, {service}/{resource}"))?;
                }
            }
        }
        for (project, services) in &self.projects {
            if !project.contains('/') {
                return Err(CoreError::InvalidConfig(format!(
                    "project constraint key {project:?} must look like \"domain/project\""
                )));
            }
            for (service, resources) in services {
                for (resource, constraint) in resources {
                    constraint.validate(&format!("project {project}, {service}/{resource}"))?;
                }
            }
        }
        Ok(())
    }
}
