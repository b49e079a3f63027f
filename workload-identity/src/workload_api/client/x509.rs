use std::sync::Arc;

use futures::{Stream, StreamExt as _};

use crate::bundle::{TrustBundle, TrustBundleSet};
use crate::identity::Identity;
use crate::subject_id::TrustDomain;
use crate::workload_api::context::IdentityContext;
use crate::workload_api::pb::{X509BundlesRequest, X509BundlesResponse, X509svidRequest, X509svidResponse};
use crate::workload_api::{WorkloadApiClient, WorkloadApiError};

impl WorkloadApiClient {
    /// Fetches the current identities and bundles once.
    pub async fn fetch_identity_context(&self) -> Result<IdentityContext, WorkloadApiError> {
        let mut client = self.client.clone();
        let response = client.fetch_x509svid(X509svidRequest::default()).await?;

        let message = Self::first_message(response.into_inner()).await?;
        parse_identity_context(message)
    }

    /// Fetches the trust bundles once, without requesting an identity.
    pub async fn fetch_trust_bundles(&self) -> Result<TrustBundleSet, WorkloadApiError> {
        let mut client = self.client.clone();
        let response = client
            .fetch_x509_bundles(X509BundlesRequest::default())
            .await?;

        let message = Self::first_message(response.into_inner()).await?;
        parse_trust_bundle_set(message)
    }

    /// Opens the update stream. Each item is one parsed provider message.
    ///
    /// The stream ends when the provider closes it and does not reconnect; use
    /// [`crate::IdentitySource`] for a self-healing view.
    pub async fn stream_identity_contexts(
        &self,
    ) -> Result<
        impl Stream<Item = Result<IdentityContext, WorkloadApiError>> + Send + 'static + use<>,
        WorkloadApiError,
    > {
        let mut client = self.client.clone();
        let response = client.fetch_x509svid(X509svidRequest::default()).await?;

        let stream = response.into_inner().map(|message| {
            message
                .map_err(WorkloadApiError::from)
                .and_then(parse_identity_context)
        });
        Ok(Box::pin(stream))
    }
}

fn parse_identity_context(response: X509svidResponse) -> Result<IdentityContext, WorkloadApiError> {
    if response.svids.is_empty() {
        return Err(WorkloadApiError::EmptyResponse);
    }

    let mut identities = Vec::with_capacity(response.svids.len());
    let mut bundles = TrustBundleSet::new();

    for svid in response.svids {
        let identity =
            Identity::parse_from_der(&svid.x509_svid, &svid.x509_svid_key)?.with_hint(svid.hint);

        let trust_domain = identity.subject_id().trust_domain().clone();
        bundles.add_bundle(TrustBundle::parse_from_der(trust_domain, &svid.bundle)?);
        identities.push(Arc::new(identity));
    }

    for (trust_domain, der) in response.federated_bundles {
        let trust_domain = TrustDomain::new(&trust_domain)?;
        bundles.add_bundle(TrustBundle::parse_from_der(trust_domain, &der)?);
    }

    Ok(IdentityContext::new(identities, Arc::new(bundles)))
}

fn parse_trust_bundle_set(response: X509BundlesResponse) -> Result<TrustBundleSet, WorkloadApiError> {
    let mut bundles = TrustBundleSet::new();
    for (trust_domain, der) in response.bundles {
        let trust_domain = TrustDomain::new(&trust_domain)?;
        bundles.add_bundle(TrustBundle::parse_from_der(trust_domain, &der)?);
    }
    Ok(bundles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{CertificateAuthority, IdentityParams};
    use crate::workload_api::pb::X509svid;

    fn svid_message(ca: &CertificateAuthority, id: &str) -> X509svid {
        let issued = ca.issue(&IdentityParams::new(id));
        X509svid {
            spiffe_id: id.to_string(),
            x509_svid: issued.chain_der(),
            x509_svid_key: issued.key_der.clone(),
            bundle: ca.cert_der().to_vec(),
            hint: String::new(),
        }
    }

    #[test]
    fn parses_identities_and_federated_bundles() {
        let local = CertificateAuthority::new("example.org");
        let federated = CertificateAuthority::new("partner.org");

        let mut response = X509svidResponse {
            svids: vec![svid_message(&local, "spiffe://example.org/web")],
            ..Default::default()
        };
        response
            .federated_bundles
            .insert("spiffe://partner.org".to_string(), federated.cert_der().to_vec());

        let ctx = parse_identity_context(response).unwrap();

        assert_eq!(
            ctx.default_identity().unwrap().subject_id().to_string(),
            "spiffe://example.org/web"
        );
        assert_eq!(ctx.bundles().len(), 2);
        assert!(ctx
            .bundles()
            .get(&TrustDomain::new("partner.org").unwrap())
            .is_some());
    }

    #[test]
    fn empty_response_is_not_a_format_error() {
        let err = parse_identity_context(X509svidResponse::default()).unwrap_err();
        assert!(matches!(err, WorkloadApiError::EmptyResponse));
        assert!(!err.is_format_error());
    }

    #[test]
    fn malformed_chain_is_a_format_error() {
        let ca = CertificateAuthority::new("example.org");
        let mut svid = svid_message(&ca, "spiffe://example.org/web");
        svid.x509_svid = b"garbage".to_vec();

        let response = X509svidResponse {
            svids: vec![svid],
            ..Default::default()
        };
        let err = parse_identity_context(response).unwrap_err();
        assert!(err.is_format_error());
    }
}
