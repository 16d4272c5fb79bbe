//! # Mock module
//!
//! This module provide a minimal in-memory kubernetes api server used to
//! exercise reconciliation code paths in tests, following the kube-rs
//! controller testing recipe (a [`kube::Client`] backed by a tower-test mock
//! service)

use std::collections::HashMap;

use http::{Request, Response, StatusCode};
use hyper::Body;
use kube::{Client, CustomResourceExt, ResourceExt};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tower_test::mock::{self, Handle};

// -----------------------------------------------------------------------------
// ApiServer structure

pub struct ApiServer {
    handle: Handle<Request<Body>, Response<Body>>,
}

/// returns a kubernetes client wired to an [`ApiServer`]
pub fn client() -> (Client, ApiServer) {
    let (service, handle) = mock::pair::<Request<Body>, Response<Body>>();

    (Client::new(service, "default"), ApiServer { handle })
}

/// returns the api path of the given namespaced custom resource
pub fn path_for<T>(obj: &T) -> String
where
    T: ResourceExt + CustomResourceExt,
{
    let api_resource = T::api_resource();
    let (namespace, name) = (
        obj.namespace().expect("resource to be namespaced"),
        obj.name_any(),
    );

    format!(
        "/apis/{}/namespaces/{}/{}/{}",
        api_resource.api_version, namespace, api_resource.plural, name
    )
}

impl ApiServer {
    /// serve requests against an in-memory object store keyed by api path,
    /// until the client side is dropped; returns the final state of the
    /// store.
    ///
    /// GET returns the stored object, PATCH applies a json patch to it (the
    /// `/status` sub-resource path patches its parent), POST inserts the body
    /// under `{path}/{metadata.name}`, DELETE removes the entry. Unknown
    /// paths answer a kubernetes 404 Status.
    pub fn run(mut self, store: HashMap<String, Value>) -> JoinHandle<HashMap<String, Value>> {
        tokio::spawn(async move {
            let mut store = store;

            while let Some((request, send)) = self.handle.next_request().await {
                let method = request.method().to_owned();
                let path = request.uri().path().to_string();
                let body = hyper::body::to_bytes(request.into_body())
                    .await
                    .expect("request body to be readable");

                let response = match method.as_str() {
                    "GET" => match store.get(&path) {
                        Some(obj) => respond(StatusCode::OK, obj),
                        None => not_found(),
                    },
                    "PATCH" => {
                        let key = path.trim_end_matches("/status").to_string();

                        match store.get_mut(&key) {
                            Some(obj) => {
                                let patch: json_patch::Patch =
                                    serde_json::from_slice(&body).expect("a json patch body");

                                json_patch::patch(obj, &patch).expect("patch to apply");
                                respond(StatusCode::OK, obj)
                            }
                            None => not_found(),
                        }
                    }
                    "POST" => {
                        let obj: Value = serde_json::from_slice(&body).expect("a json body");
                        let name = obj["metadata"]["name"]
                            .as_str()
                            .expect("created object to be named")
                            .to_string();

                        store.insert(format!("{}/{}", path, name), obj.to_owned());
                        respond(StatusCode::CREATED, &obj)
                    }
                    "PUT" => {
                        let obj: Value = serde_json::from_slice(&body).expect("a json body");

                        store.insert(path, obj.to_owned());
                        respond(StatusCode::OK, &obj)
                    }
                    "DELETE" => match store.remove(&path) {
                        Some(obj) => respond(StatusCode::OK, &obj),
                        None => not_found(),
                    },
                    _ => not_found(),
                };

                send.send_response(response);
            }

            store
        })
    }
}

// -----------------------------------------------------------------------------
// helpers

fn respond(status: StatusCode, obj: &Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::to_vec(obj).expect("object to serialize"),
        ))
        .expect("response to build")
}

fn not_found() -> Response<Body> {
    respond(
        StatusCode::NOT_FOUND,
        &json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": "the requested resource could not be found",
            "reason": "NotFound",
            "code": 404,
        }),
    )
}
