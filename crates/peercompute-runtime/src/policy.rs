//! Container security policy.
//!
//! Validated at the runtime boundary before any container starts. The
//! runtime never trusts the scheduler to have checked these.

use crate::{ContainerSpec, RuntimeError, RuntimeResult};

/// Environment variable names that are never passed into a container.
pub const FORBIDDEN_ENV_VARS: &[&str] = &["LD_PRELOAD", "LD_LIBRARY_PATH", "DOCKER_HOST"];

/// Minimum memory limit. Anything lower invites OOM kills that disturb the
/// host.
pub const MIN_MEMORY_BYTES: i64 = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    /// Maximum CPU allocation per container, millicores
    pub max_cpu_millicores: i64,
    /// Maximum memory allocation per container, bytes
    pub max_memory_bytes: i64,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        SecurityPolicy {
            max_cpu_millicores: 4000,
            max_memory_bytes: 4 * 1024 * 1024 * 1024,
        }
    }
}

impl SecurityPolicy {
    pub fn validate(&self, spec: &ContainerSpec) -> RuntimeResult<()> {
        if spec.deployment_id.is_empty() {
            return Err(RuntimeError::Policy("deployment id is required".into()));
        }
        if spec.image.is_empty() {
            return Err(RuntimeError::Policy("image is required".into()));
        }
        if spec.cpu_millicores <= 0 {
            return Err(RuntimeError::Policy("cpu limit must be positive".into()));
        }
        if spec.cpu_millicores > self.max_cpu_millicores {
            return Err(RuntimeError::Policy(format!(
                "cpu limit {} exceeds maximum {}",
                spec.cpu_millicores, self.max_cpu_millicores
            )));
        }
        if spec.memory_bytes < MIN_MEMORY_BYTES {
            return Err(RuntimeError::Policy(format!(
                "memory limit must be at least {MIN_MEMORY_BYTES} bytes"
            )));
        }
        if spec.memory_bytes > self.max_memory_bytes {
            return Err(RuntimeError::Policy(format!(
                "memory limit {} exceeds maximum {}",
                spec.memory_bytes, self.max_memory_bytes
            )));
        }
        for name in spec.environment.keys() {
            if is_forbidden_env(name) {
                return Err(RuntimeError::Policy(format!(
                    "environment variable {name} is not allowed"
                )));
            }
        }
        Ok(())
    }
}

pub fn is_forbidden_env(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    FORBIDDEN_ENV_VARS.iter().any(|banned| upper == *banned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            deployment_id: "dep-1".into(),
            requester_id: "peer-1".into(),
            image: "nginx:alpine".into(),
            cpu_millicores: 500,
            memory_bytes: 256 * 1024 * 1024,
            expose_port: 80,
            environment: BTreeMap::new(),
        }
    }

    #[test]
    fn test_valid_spec_passes() {
        SecurityPolicy::default().validate(&spec()).unwrap();
    }

    #[test]
    fn test_forbidden_env_rejected() {
        let mut s = spec();
        s.environment.insert("ld_preload".into(), "/x.so".into());
        assert!(matches!(
            SecurityPolicy::default().validate(&s),
            Err(RuntimeError::Policy(_))
        ));
    }

    #[test]
    fn test_limits_enforced() {
        let policy = SecurityPolicy::default();

        let mut s = spec();
        s.cpu_millicores = 0;
        assert!(policy.validate(&s).is_err());

        let mut s = spec();
        s.cpu_millicores = policy.max_cpu_millicores + 1;
        assert!(policy.validate(&s).is_err());

        let mut s = spec();
        s.memory_bytes = MIN_MEMORY_BYTES - 1;
        assert!(policy.validate(&s).is_err());

        let mut s = spec();
        s.memory_bytes = policy.max_memory_bytes + 1;
        assert!(policy.validate(&s).is_err());
    }
}
