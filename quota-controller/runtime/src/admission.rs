use crate::{
    engine::{self, Engine},
    events::{Denied, Recorder},
};
use cluster_quota_controller_core::{
    AdmissionDecision, Error as Denial, Kind, MetricsSink, ObjectCountKinds, Outcome, Reason,
    ResourceList,
};
use cluster_quota_controller_k8s_api::{
    ClusterResourceQuota, Namespace, PersistentVolumeClaim, Pod, Resource, ResourceExt, Service,
};
use cluster_quota_controller_k8s_usage::{
    ClusterState, ExtractError, Extractor, NamespaceInfo, ScopeResolver,
};
use futures::{future, FutureExt};
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::{admission::Operation, response::StatusSummary, DynamicObject};
use serde::de::DeserializeOwned;
use std::{panic::AssertUnwindSafe, sync::Arc};
use thiserror::Error;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Serves admission reviews for quota-governed kinds.
#[derive(Clone)]
pub struct Admission(Arc<Inner>);

/// Process-wide admission configuration.
pub struct Settings {
    pub resolver: ScopeResolver,
    pub extractor: Extractor,
    pub object_counts: ObjectCountKinds,
    pub timeout: Duration,
    pub staleness_tolerance: Duration,
    pub reservation_ttl: Duration,

    /// Publishes an event for every quota denial when set.
    pub recorder: Option<Recorder>,
}

struct Inner {
    engine: Engine,
    extractor: Extractor,
    object_counts: ObjectCountKinds,
    metrics: Arc<dyn MetricsSink>,
    recorder: Option<Recorder>,
    timeout: Duration,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

/// Paths the API server may be configured to post reviews to. The path never
/// determines how a review is handled.
const ROUTES: [&str; 7] = [
    "/",
    "/pods",
    "/persistentvolumeclaims",
    "/services",
    "/namespaces",
    "/clusterresourcequotas",
    "/objectcount",
];

/// Metric label for reviews whose kind could not be determined.
const UNKNOWN: &str = "unknown";

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if !is_routed(req.method(), req.uri().path()) {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            let bytes = req.into_body().collect().await?.to_bytes();
            let review = admission.review(&bytes).await;
            json_response(review)
        })
    }
}

impl Admission {
    pub fn new(
        cluster: Arc<dyn ClusterState>,
        metrics: Arc<dyn MetricsSink>,
        settings: Settings,
    ) -> Self {
        let Settings {
            resolver,
            extractor,
            object_counts,
            timeout,
            staleness_tolerance,
            reservation_ttl,
            recorder,
        } = settings;
        let engine = Engine::new(
            cluster,
            metrics.clone(),
            resolver,
            engine::Config {
                staleness_tolerance,
                reservation_ttl,
            },
        );
        Self(Arc::new(Inner {
            engine,
            extractor,
            object_counts,
            metrics,
            recorder,
            timeout,
        }))
    }

    /// Decodes a serialized review and responds to it. A response is always
    /// produced, echoing the request's uid whenever one can be read.
    pub(crate) async fn review(&self, body: &[u8]) -> AdmissionReview {
        let started = Instant::now();
        let req = match serde_json::from_slice::<AdmissionReview>(body)
            .map_err(|error| error.to_string())
            .and_then(|review| {
                let req: Result<AdmissionRequest, _> = review.try_into();
                req.map_err(|error| error.to_string())
            }) {
            Ok(req) => req,
            Err(error) => {
                warn!(%error, "Failed to parse admission review");
                let decision = AdmissionDecision::from(Denial::Decode(error));
                self.observe(UNKNOWN, UNKNOWN, &decision, started);
                let mut rsp = AdmissionResponse::invalid(&decision.message);
                rsp.uid = salvage_uid(body).unwrap_or_default();
                return respond(rsp, &decision).into_review();
            }
        };
        debug!(uid = %req.uid, kind = %req.kind.kind, ns = ?req.namespace, name = %req.name, op = ?req.operation);

        let rsp = AdmissionResponse::from(&req);
        let (kind, decision) = match self.kind_of(&req) {
            Ok(kind) => {
                let decision = self.admit(&kind, &req).await;
                (kind.as_str(), decision)
            }
            Err(error) => (UNKNOWN, AdmissionDecision::from(error)),
        };
        self.observe(kind, operation(&req.operation), &decision, started);

        match decision.outcome() {
            Outcome::Allowed => debug!(uid = %req.uid, "Allowed"),
            Outcome::Denied => info!(
                uid = %req.uid,
                ns = req.namespace.as_deref().unwrap_or_default(),
                name = %req.name,
                %kind,
                reason = %decision.reason,
                message = %decision.message,
                "Denied"
            ),
            Outcome::Errored => warn!(
                uid = %req.uid,
                %kind,
                reason = %decision.reason,
                message = %decision.message,
                "Failed to admit"
            ),
        }
        if decision.reason == Reason::QuotaExceeded && !req.dry_run {
            self.record_denial(&req, &decision);
        }

        let rsp = respond(rsp, &decision);
        trace!(?rsp);
        rsp.into_review()
    }

    /// Runs the decision for a recognized kind under the admission deadline.
    /// A panic or an expired deadline denies the request.
    async fn admit(&self, kind: &Kind, req: &AdmissionRequest) -> AdmissionDecision {
        let deadline = Instant::now() + self.0.timeout;
        let admit = AssertUnwindSafe(self.admit_kind(kind, req, deadline)).catch_unwind();
        match time::timeout_at(deadline, admit).await {
            Ok(Ok(res)) => res.into(),
            Ok(Err(_)) => {
                error!(uid = %req.uid, %kind, "Admission panicked");
                Denial::unavailable("internal error while admitting request").into()
            }
            Err(_) => Denial::unavailable(format!(
                "admission did not complete within {}ms",
                self.0.timeout.as_millis()
            ))
            .into(),
        }
    }

    async fn admit_kind(
        &self,
        kind: &Kind,
        req: &AdmissionRequest,
        deadline: Instant,
    ) -> Result<(), Denial> {
        // Status and other subresource writes never change usage.
        if req.sub_resource.is_some() {
            return Ok(());
        }
        let update = match req.operation {
            Operation::Create => false,
            Operation::Update => true,
            Operation::Delete | Operation::Connect => return Ok(()),
        };
        let engine = &self.0.engine;

        match kind {
            Kind::Pod => {
                self.admit_workload(kind, req, update, deadline, Extractor::pod)
                    .await
            }

            Kind::PersistentVolumeClaim => {
                self.admit_workload(
                    kind,
                    req,
                    update,
                    deadline,
                    Extractor::persistent_volume_claim,
                )
                .await
            }

            Kind::Service => {
                self.admit_workload(kind, req, update, deadline, Extractor::service)
                    .await
            }

            // Updating an object never changes how many objects there are.
            Kind::ObjectCount(_) if update => Ok(()),
            Kind::ObjectCount(count) => {
                let ns = namespace(req)?;
                let delta = self.0.extractor.object_count(count);
                engine.admit_usage(&ns, delta, req.dry_run, deadline).await
            }

            // A new namespace holds nothing.
            Kind::Namespace if !update => Ok(()),
            Kind::Namespace => {
                let new = parse::<Namespace>(req.object.as_ref(), kind)?;
                let old = parse::<Namespace>(req.old_object.as_ref(), kind)?;
                engine
                    .admit_namespace_update(
                        &NamespaceInfo::from(&old),
                        &NamespaceInfo::from(&new),
                        req.dry_run,
                        deadline,
                    )
                    .await
            }

            Kind::ClusterResourceQuota => {
                let quota = parse::<ClusterResourceQuota>(req.object.as_ref(), kind)?;
                let old = if update {
                    Some(parse::<ClusterResourceQuota>(req.old_object.as_ref(), kind)?)
                } else {
                    None
                };
                engine.admit_quota(&quota, old.as_ref(), deadline).await
            }
        }
    }

    /// Admits the usage a workload adds to its namespace. An update adds
    /// only what grew.
    async fn admit_workload<K, F>(
        &self,
        kind: &Kind,
        req: &AdmissionRequest,
        update: bool,
        deadline: Instant,
        extract: F,
    ) -> Result<(), Denial>
    where
        K: DeserializeOwned,
        F: Fn(&Extractor, &K) -> Result<ResourceList, ExtractError>,
    {
        let extract = |obj: &K| {
            extract(&self.0.extractor, obj).map_err(|error| Denial::extraction(kind.as_str(), error))
        };

        let obj = parse::<K>(req.object.as_ref(), kind)?;
        let mut delta = extract(&obj)?;
        if update {
            let old = parse::<K>(req.old_object.as_ref(), kind)?;
            delta = delta.increase_from(&extract(&old)?);
        }

        let ns = namespace(req)?;
        debug!(%ns, %kind, %delta, "Extracted usage");
        self.0
            .engine
            .admit_usage(&ns, delta, req.dry_run, deadline)
            .await
    }

    /// Resolves the closed set of kinds this service admits.
    fn kind_of(&self, req: &AdmissionRequest) -> Result<Kind, Denial> {
        if is_kind::<Pod>(req) {
            return Ok(Kind::Pod);
        }
        if is_kind::<PersistentVolumeClaim>(req) {
            return Ok(Kind::PersistentVolumeClaim);
        }
        if is_kind::<Service>(req) {
            return Ok(Kind::Service);
        }
        if is_kind::<Namespace>(req) {
            return Ok(Kind::Namespace);
        }
        if is_kind::<ClusterResourceQuota>(req) {
            return Ok(Kind::ClusterResourceQuota);
        }
        if let Some(count) = self
            .0
            .object_counts
            .get(&req.resource.group, &req.resource.resource)
        {
            return Ok(Kind::ObjectCount(count.clone()));
        }

        Err(Denial::UnsupportedKind(format!(
            "{}.{}.{}",
            req.kind.group, req.kind.version, req.kind.kind
        )))
    }

    fn observe(
        &self,
        kind: &'static str,
        operation: &'static str,
        decision: &AdmissionDecision,
        started: Instant,
    ) {
        let metrics = &self.0.metrics;
        metrics.admission(kind, operation, decision.outcome(), started.elapsed());
        if !decision.allowed {
            metrics.error(decision.reason);
        }
    }

    fn record_denial(&self, req: &AdmissionRequest, decision: &AdmissionDecision) {
        let Some(recorder) = self.0.recorder.as_ref() else {
            return;
        };
        let Some(namespace) = req.namespace.clone() else {
            return;
        };
        let name = match req.name.as_str() {
            "" => req
                .object
                .as_ref()
                .and_then(|obj| obj.metadata.generate_name.clone())
                .unwrap_or_default(),
            name => name.to_string(),
        };
        let api_version = match req.kind.group.as_str() {
            "" => req.kind.version.clone(),
            group => format!("{group}/{}", req.kind.version),
        };
        recorder.denied(Denied {
            api_version,
            kind: req.kind.kind.clone(),
            namespace,
            name,
            message: decision.message.clone(),
        });
    }
}

fn is_routed(method: &http::Method, path: &str) -> bool {
    method == http::Method::POST && ROUTES.contains(&path)
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn operation(op: &Operation) -> &'static str {
    match op {
        Operation::Create => "CREATE",
        Operation::Update => "UPDATE",
        Operation::Delete => "DELETE",
        Operation::Connect => "CONNECT",
    }
}

fn namespace(req: &AdmissionRequest) -> Result<String, Denial> {
    req.namespace
        .clone()
        .or_else(|| req.object.as_ref().and_then(|obj| obj.namespace()))
        .filter(|ns| !ns.is_empty())
        .ok_or_else(|| Denial::Decode("admission request missing 'namespace'".to_string()))
}

fn parse<K: DeserializeOwned>(obj: Option<&DynamicObject>, kind: &Kind) -> Result<K, Denial> {
    let obj = obj.ok_or_else(|| Denial::Decode(format!("admission request missing {kind} object")))?;
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|error| Denial::extraction(kind.as_str(), error))
}

/// Reads `request.uid` from a body that is not a well-formed review.
fn salvage_uid(body: &[u8]) -> Option<String> {
    let value = serde_json::from_slice::<serde_json::Value>(body).ok()?;
    value.get("request")?.get("uid")?.as_str().map(str::to_string)
}

fn respond(mut rsp: AdmissionResponse, decision: &AdmissionDecision) -> AdmissionResponse {
    if decision.allowed {
        return rsp;
    }
    rsp.allowed = false;
    rsp.result.status = Some(StatusSummary::Failure);
    rsp.result.code = decision.code();
    rsp.result.reason = decision.reason.status_reason().to_string();
    rsp.result.message = decision.message.clone();
    rsp
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_by_method_and_path() {
        for path in ROUTES {
            assert!(is_routed(&http::Method::POST, path), "{path}");
        }
        assert!(!is_routed(&http::Method::GET, "/pods"));
        assert!(!is_routed(&http::Method::POST, "/deployments"));
        assert!(!is_routed(&http::Method::POST, "/pods/extra"));
    }

    #[test]
    fn salvages_uid_from_partial_reviews() {
        assert_eq!(
            salvage_uid(br#"{"request":{"uid":"abc","kind":42}}"#),
            Some("abc".to_string())
        );
        assert_eq!(salvage_uid(b"{not json"), None);
    }
}
