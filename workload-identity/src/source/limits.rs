use std::sync::Arc;

use super::builder::ResourceLimits;
use super::errors::{LimitKind, SourceError};
use super::types::IdentityPicker;
use crate::identity::Identity;
use crate::workload_api::IdentityContext;

pub(super) fn validate_limits(
    ctx: &IdentityContext,
    limits: ResourceLimits,
) -> Result<(), SourceError> {
    if let Some(limit) = limits.max_identities {
        let actual = ctx.identities().len();
        if actual > limit {
            return Err(SourceError::ResourceLimitExceeded {
                kind: LimitKind::MaxIdentities,
                limit,
                actual,
            });
        }
    }

    if let Some(limit) = limits.max_bundles {
        let actual = ctx.bundles().len();
        if actual > limit {
            return Err(SourceError::ResourceLimitExceeded {
                kind: LimitKind::MaxBundles,
                limit,
                actual,
            });
        }
    }

    if let Some(limit) = limits.max_bundle_der_bytes {
        for bundle in ctx.bundles().iter() {
            let actual: usize = bundle
                .authorities()
                .iter()
                .map(|cert| cert.as_bytes().len())
                .sum();

            if actual > limit {
                return Err(SourceError::ResourceLimitExceeded {
                    kind: LimitKind::MaxBundleDerBytes,
                    limit,
                    actual,
                });
            }
        }
    }

    Ok(())
}

pub(super) fn select_identity(
    ctx: &IdentityContext,
    picker: Option<&dyn IdentityPicker>,
) -> Option<Arc<Identity>> {
    match picker {
        Some(p) => p
            .pick(ctx.identities())
            .and_then(|idx| ctx.identities().get(idx))
            .cloned(),
        None => ctx.default_identity().cloned(),
    }
}

/// Checks limits and selects the identity to publish.
pub(super) fn validate_context(
    ctx: &IdentityContext,
    picker: Option<&dyn IdentityPicker>,
    limits: ResourceLimits,
) -> Result<Arc<Identity>, SourceError> {
    validate_limits(ctx, limits)?;
    select_identity(ctx, picker).ok_or(SourceError::NoSuitableIdentity)
}
