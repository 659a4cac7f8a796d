//! Request routing.
//!
//! Paths are parsed by hand rather than with axum's route table: a request is either for
//! the root, a collection (`/{collection}`) or a document (`/{collection}/{key}`), and
//! anything deeper is rejected instead of being silently truncated. The resulting
//! resource shape and the HTTP verb select an [`Operation`] from a fixed dispatch table.

use std::sync::Arc;
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use futures::{Stream, StreamExt, future, stream};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use storra_core::{
    backend::{DocumentStream, StoreBackend},
    document::{Document, ID_FIELD},
    error::{StorraError, StorraResult},
};

const FAVICON: &str = "favicon.ico";

/// The kind of resource a path addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Root,
    Collection,
    Document,
}

/// A parsed request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Root,
    Collection(String),
    Document { collection: String, key: String },
}

impl Resource {
    pub fn shape(&self) -> Shape {
        match self {
            Resource::Root => Shape::Root,
            Resource::Collection(_) => Shape::Collection,
            Resource::Document { .. } => Shape::Document,
        }
    }
}

/// The operations the dispatch table can bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Options,
    RootInfo,
    List,
    Create,
    RemoveCollection,
    Read,
    Update,
    Remove,
}

/// Parses a request path, ignoring empty segments.
///
/// # Errors
///
/// Returns [`StorraError::BadPath`] for paths with more than two segments.
pub fn parse_path(path: &str) -> StorraResult<Resource> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match segments.as_slice() {
        [] => Ok(Resource::Root),
        [collection] => Ok(Resource::Collection(collection.to_string())),
        [collection, key] => Ok(Resource::Document {
            collection: collection.to_string(),
            key: key.to_string(),
        }),
        _ => Err(StorraError::BadPath(format!(
            "only paths of the form /collection or /collection/key are supported, \
             {path} has {} segments",
            segments.len()
        ))),
    }
}

/// The dispatch table: which operation a verb maps to for each resource shape.
///
/// Collections are created on first write, so there is no `POST /`.
pub fn select(shape: Shape, method: &Method) -> Option<Operation> {
    match (shape, method.as_str()) {
        (_, "OPTIONS") => Some(Operation::Options),
        (Shape::Root, "GET") => Some(Operation::RootInfo),
        (Shape::Collection, "GET") => Some(Operation::List),
        (Shape::Collection, "POST") => Some(Operation::Create),
        (Shape::Collection, "DELETE") => Some(Operation::RemoveCollection),
        (Shape::Document, "GET") => Some(Operation::Read),
        (Shape::Document, "PUT") => Some(Operation::Update),
        (Shape::Document, "DELETE") => Some(Operation::Remove),
        _ => None,
    }
}

/// The verbs the dispatch table maps for `shape`, in `Allow` header form.
pub fn allowed_methods(shape: Shape) -> String {
    [Method::OPTIONS, Method::GET, Method::POST, Method::PUT, Method::DELETE]
        .iter()
        .filter(|method| select(shape, method).is_some())
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

struct AppState<B> {
    backend: Arc<B>,
    backend_name: &'static str,
}

impl<B> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            backend_name: self.backend_name,
        }
    }
}

/// Build the axum router serving `backend`.
pub fn build_router<B: StoreBackend + 'static>(backend: Arc<B>, backend_name: &'static str) -> Router {
    Router::new()
        .fallback(dispatch::<B>)
        .with_state(AppState { backend, backend_name })
        .layer(TraceLayer::new_for_http())
}

async fn dispatch<B: StoreBackend + 'static>(
    State(state): State<AppState<B>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Result<Response, ApiError> {
    debug!(%method, %uri, "routing request");
    let resource = parse_path(uri.path())?;

    if let Resource::Collection(collection) = &resource {
        if collection == FAVICON {
            return Err(StorraError::NotFound(FAVICON.to_string()).into());
        }
    }

    let shape = resource.shape();
    let operation = select(shape, &method)
        .ok_or_else(|| StorraError::NotImplemented(format!("{method} {}", uri.path())))?;
    let backend = state.backend.as_ref();

    let response = match (operation, resource) {
        (Operation::Options, _) => {
            let allow = HeaderValue::from_str(&allowed_methods(shape))
                .map_err(|e| StorraError::Backend(e.to_string()))?;
            (StatusCode::OK, [(header::ALLOW, allow)]).into_response()
        }
        (Operation::RootInfo, _) => Json(json!({
            "name": "storra",
            "version": env!("CARGO_PKG_VERSION"),
            "backend": state.backend_name,
        }))
        .into_response(),
        (Operation::List, Resource::Collection(collection)) => {
            let documents = backend.list(&collection).await?;
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
                Body::from_stream(json_array(documents)),
            )
                .into_response()
        }
        (Operation::Create, Resource::Collection(collection)) => {
            let document = Document::from_slice(&body)?;
            let key = backend.create(&collection, document).await?;
            let location = HeaderValue::from_str(&format!("/{collection}/{key}"))
                .map_err(|e| StorraError::Backend(e.to_string()))?;
            (
                StatusCode::CREATED,
                [(header::LOCATION, location)],
                Json(json!({ ID_FIELD: key })),
            )
                .into_response()
        }
        (Operation::RemoveCollection, Resource::Collection(collection)) => {
            backend.remove_collection(&collection).await?;
            StatusCode::NO_CONTENT.into_response()
        }
        (Operation::Read, Resource::Document { collection, key }) => {
            Json(backend.read(&collection, &key).await?).into_response()
        }
        (Operation::Update, Resource::Document { collection, key }) => {
            let document = Document::from_slice(&body)?;
            backend.update(&collection, &key, document).await?;
            StatusCode::OK.into_response()
        }
        (Operation::Remove, Resource::Document { collection, key }) => {
            backend.remove(&collection, &key).await?;
            StatusCode::NO_CONTENT.into_response()
        }
        (operation, resource) => {
            return Err(StorraError::NotImplemented(format!("{operation:?} on {resource:?}")).into());
        }
    };

    Ok(response)
}

/// Serializes a document stream as a JSON array, one chunk per document.
///
/// A failure mid-stream is logged and ends the body with an error, which aborts the
/// response instead of sending a truncated but well-formed array.
fn json_array(documents: DocumentStream) -> impl Stream<Item = Result<Bytes, StorraError>> + Send {
    let items = documents.enumerate().map(|(index, document)| {
        let document = document.inspect_err(|err| error!(%err, "listing failed mid-stream"))?;
        let mut chunk = if index == 0 { Vec::new() } else { b",".to_vec() };
        serde_json::to_writer(&mut chunk, &document)?;
        Ok(Bytes::from(chunk))
    });

    stream::once(future::ready(Ok(Bytes::from_static(b"["))))
        .chain(items)
        .chain(stream::once(future::ready(Ok(Bytes::from_static(b"]")))))
}

/// An error on its way to becoming an HTTP response.
#[derive(Debug)]
pub struct ApiError(StorraError);

impl From<StorraError> for ApiError {
    fn from(err: StorraError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(err = %self.0, "request failed");
        } else {
            debug!(err = %self.0, "request rejected");
        }

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
