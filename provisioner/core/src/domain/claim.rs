// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Volume claims and the name rules applied before any side effect.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

use crate::domain::volume::{AccessMode, ReclaimPolicy};

const QUALIFIED_NAME_MAX_LEN: usize = 63;
const DNS_SUBDOMAIN_MAX_LEN: usize = 253;

/// A user's request for a volume, as seen by the provisioner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub namespace: String,
    pub name: String,
    /// Platform-assigned unique id; the provisioned volume is named after it
    pub uid: String,
    /// Provisioner requested through the claim's storage class, if resolvable
    pub provisioner: Option<String>,
    /// Requested capacity as a platform quantity string (e.g. "1Gi")
    pub capacity: String,
    #[serde(default)]
    pub access_modes: Vec<AccessMode>,
    #[serde(default)]
    pub storage_class: Option<String>,
    /// Reclaim policy of the storage class, copied onto the volume
    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,
}

impl ClaimRequest {
    /// Name of the volume Provision creates for this claim
    pub fn volume_name(&self) -> String {
        format!("pvc-{}", self.uid)
    }

    /// "namespace/name", for logs
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Whether this claim asks for the provisioner called `name`
    pub fn requests(&self, name: &str) -> bool {
        self.provisioner.as_deref() == Some(name)
    }

    /// Reject claims that cannot be provisioned
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.namespace.is_empty() || self.name.is_empty() {
            return Err(ValidationError::InvalidClaim {
                claim: self.key(),
                reason: "namespace and name are required".to_string(),
            });
        }
        if self.uid.is_empty() {
            return Err(ValidationError::InvalidClaim {
                claim: self.key(),
                reason: "claim has no uid".to_string(),
            });
        }
        if self.capacity.trim().is_empty() {
            return Err(ValidationError::InvalidClaim {
                claim: self.key(),
                reason: "claim does not request a storage capacity".to_string(),
            });
        }
        validate_volume_name(&self.volume_name())
    }
}

/// Validation errors: rejected before any side effect
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid provisioner name '{name}': {reason}")]
    InvalidProvisionerName { name: String, reason: String },

    #[error("invalid volume name '{name}': {reason}")]
    InvalidVolumeName { name: String, reason: String },

    #[error("invalid claim {claim}: {reason}")]
    InvalidClaim { claim: String, reason: String },
}

fn qualified_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").expect("static regex")
    })
}

fn dns_subdomain_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
            .expect("static regex")
    })
}

/// Check that `name` is a qualified name: `[prefix/]name`, where the
/// optional prefix is a DNS subdomain. Case is ignored.
pub fn validate_provisioner_name(name: &str) -> Result<(), ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidProvisionerName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("name is required".to_string()));
    }

    let lowered = name.to_lowercase();
    let parts: Vec<&str> = lowered.split('/').collect();
    let (prefix, short) = match parts.as_slice() {
        [short] => (None, *short),
        [prefix, short] => (Some(*prefix), *short),
        _ => {
            return Err(invalid(
                "a qualified name must consist of an optional DNS subdomain prefix and a name separated by '/'"
                    .to_string(),
            ))
        }
    };

    if let Some(prefix) = prefix {
        if prefix.is_empty() {
            return Err(invalid("prefix part must be non-empty".to_string()));
        }
        if prefix.len() > DNS_SUBDOMAIN_MAX_LEN {
            return Err(invalid(format!(
                "prefix part must be no more than {} characters",
                DNS_SUBDOMAIN_MAX_LEN
            )));
        }
        if !dns_subdomain_regex().is_match(prefix) {
            return Err(invalid(
                "prefix part must be a lowercase DNS subdomain".to_string(),
            ));
        }
    }

    if short.is_empty() {
        return Err(invalid("name part must be non-empty".to_string()));
    }
    if short.len() > QUALIFIED_NAME_MAX_LEN {
        return Err(invalid(format!(
            "name part must be no more than {} characters",
            QUALIFIED_NAME_MAX_LEN
        )));
    }
    if !qualified_name_regex().is_match(short) {
        return Err(invalid(
            "name part must consist of alphanumeric characters, '-', '_' or '.', and must start and end with an alphanumeric character"
                .to_string(),
        ));
    }

    Ok(())
}

/// Volume names become directory names under the export root, so they
/// must be a single, non-special path component.
pub fn validate_volume_name(name: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidVolumeName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is required"));
    }
    if name == "." || name == ".." {
        return Err(invalid("name must not be a relative path component"));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(invalid("name must be a single path component"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(invalid("name must not contain whitespace"));
    }
    Ok(())
}
