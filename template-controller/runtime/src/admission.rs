use crate::k8s::{Requester, TemplateInstance};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use k8s_openapi::api::authentication::v1::UserInfo;
use kube::{
    core::{admission::Operation, DynamicObject},
    Resource,
};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Captures who asked for a TemplateInstance and keeps that record, along
/// with the rest of the spec, from being changed afterwards.
#[derive(Clone)]
pub struct Admission {}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl AdmissionService ===

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
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: Review = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(req)
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new() -> Self {
        Self {}
    }

    fn admit(&self, req: AdmissionRequest) -> AdmissionResponse {
        if !is_kind::<TemplateInstance>(&req) {
            return AdmissionResponse::invalid(format_args!(
                "unsupported resource type: {}.{}.{}",
                req.kind.group, req.kind.version, req.kind.kind
            ));
        }

        match req.operation {
            Operation::Create => stamp_requester(req),
            Operation::Update => deny_spec_changes(req),
            _ => AdmissionResponse::from(&req),
        }
    }
}

/// Records the authenticated user making the request as the instance's
/// requester, replacing anything the client supplied.
fn stamp_requester(req: AdmissionRequest) -> AdmissionResponse {
    let rsp = AdmissionResponse::from(&req);
    let requester = requester(&req.user_info);
    if requester.username.is_empty() {
        info!("Denied TemplateInstance without an authenticated user");
        return rsp.deny("request has no authenticated user");
    }

    let patch = match requester_patch(&requester) {
        Ok(patch) => patch,
        Err(error) => return rsp.deny(error),
    };
    debug!(user = %requester.username, name = %req.name, "Stamping requester");
    match rsp.with_patch(patch) {
        Ok(rsp) => rsp,
        Err(error) => AdmissionResponse::from(&req).deny(error),
    }
}

/// The spec, including the requester, is fixed at creation. Status updates
/// go through the subresource and are not checked.
fn deny_spec_changes(req: AdmissionRequest) -> AdmissionResponse {
    let rsp = AdmissionResponse::from(&req);
    if req.sub_resource.is_some() {
        return rsp;
    }

    let spec = |obj: Option<&DynamicObject>| obj.and_then(|o| o.data.get("spec").cloned());
    if spec(req.object.as_ref()) != spec(req.old_object.as_ref()) {
        info!(name = %req.name, "Denied TemplateInstance spec change");
        return rsp.deny("TemplateInstance spec is immutable");
    }
    rsp
}

fn requester(user: &UserInfo) -> Requester {
    Requester {
        username: user.username.clone().unwrap_or_default(),
        uid: user.uid.clone(),
        groups: user.groups.clone().unwrap_or_default(),
        extra: user.extra.clone().unwrap_or_default(),
    }
}

fn requester_patch(requester: &Requester) -> serde_json::Result<json_patch::Patch> {
    serde_json::from_value(serde_json::json!([{
        "op": "add",
        "path": "/spec/requester",
        "value": requester,
    }]))
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

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}
