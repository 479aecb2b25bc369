use anyhow::Result;
use serde_json::json;
use std::fs;
use std::sync::Arc;
use tracing::{debug, warn};

use super::http::{decode_segment, Request, Response};
use crate::error::FolioError;
use crate::reconcile::ProjectRegistry;
use crate::sidecar::{SidecarStore, Tier};

pub(crate) async fn route(request: &Request, registry: &ProjectRegistry, port: u16) -> Response {
    if request.method != "GET" {
        return Response::text(405, "method not allowed").with_header("Allow", "GET");
    }

    let segments: Vec<&str> = request.path.trim_start_matches('/').split('/').collect();
    match segments.as_slice() {
        ["health"] => Response::json(&json!({ "status": "ok", "port": port })),
        [route, project_id, file_name] => match Tier::from_route(route) {
            Some(tier) => serve_derivative(registry, tier, project_id, file_name).await,
            None => Response::not_found(),
        },
        _ => Response::not_found(),
    }
}

/// A bare file name: no separators, no parent references, not hidden.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\', '\0'])
}

async fn serve_derivative(registry: &ProjectRegistry, tier: Tier, project_id: &str, file_name: &str) -> Response {
    let (Some(project_id), Some(file_name)) = (decode_segment(project_id), decode_segment(file_name)) else {
        return Response::text(400, "bad path encoding");
    };
    if !is_plain_file_name(&file_name) {
        return Response::text(400, "bad file name");
    }
    let Some(store) = registry.get(&project_id) else {
        debug!("Request for unregistered project {}", project_id);
        return Response::not_found();
    };

    let name = file_name.clone();
    match tokio::task::spawn_blocking(move || resolve(&store, tier, &name)).await {
        Ok(Ok(bytes)) => Response::jpeg(bytes),
        Ok(Err(e)) if matches!(e.downcast_ref::<FolioError>(), Some(FolioError::NotFound(_))) => {
            debug!("{:#}", e);
            Response::not_found()
        }
        Ok(Err(e)) => {
            warn!("Cannot serve {:?} for {}/{}: {:#}", tier, project_id, file_name, e);
            Response::not_found()
        }
        Err(e) => {
            warn!("Resolver task failed: {}", e);
            Response::not_found()
        }
    }
}

/// Bytes for a tier, generating it when missing or stale. The full tier
/// falls back to standard for sources too small to have one.
fn resolve(store: &Arc<SidecarStore>, tier: Tier, file_name: &str) -> Result<Vec<u8>> {
    if !store.source_path(file_name).is_file() {
        // Source gone: whatever is still cached can be served until the sweep.
        let cached = store
            .existing_derivative(tier, file_name)
            .or_else(|| match tier {
                Tier::Full => store.existing_derivative(Tier::Standard, file_name),
                _ => None,
            })
            .ok_or_else(|| FolioError::NotFound(format!("no source or cached {:?} for {}", tier, file_name)))?;
        return Ok(fs::read(cached)?);
    }

    let rendition = store.generate(tier, file_name)?;
    let path = match rendition.path {
        Some(path) => path,
        None => store
            .generate(Tier::Standard, file_name)?
            .path
            .ok_or_else(|| FolioError::NotFound(format!("no standard preview for {}", file_name)))?,
    };
    Ok(fs::read(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DerivativeConfig;

    #[test]
    fn test_plain_file_names() {
        assert!(is_plain_file_name("photo 1.jpg"));
        assert!(!is_plain_file_name("../etc/passwd"));
        assert!(!is_plain_file_name("a/b.jpg"));
        assert!(!is_plain_file_name("..\\b.jpg"));
        assert!(!is_plain_file_name(".folio"));
        assert!(!is_plain_file_name(""));
    }

    #[tokio::test]
    async fn test_non_get_is_rejected() {
        let request = Request {
            method: "POST".to_string(),
            path: "/health".to_string(),
        };
        let response = route(&request, &ProjectRegistry::new(), 1).await;
        assert_eq!(response.status, 405);
    }

    #[tokio::test]
    async fn test_unknown_project_and_route() {
        let registry = ProjectRegistry::new();
        for path in ["/thumb/nope/a.jpg", "/original/p/a.jpg", "/thumb/p", "/"] {
            let request = Request {
                method: "GET".to_string(),
                path: path.to_string(),
            };
            assert_eq!(route(&request, &registry, 1).await.status, 404, "{}", path);
        }
    }

    #[tokio::test]
    async fn test_traversal_is_bad_request() {
        let request = Request {
            method: "GET".to_string(),
            path: "/thumb/p/..%2Fsecret.jpg".to_string(),
        };
        assert_eq!(route(&request, &ProjectRegistry::new(), 1).await.status, 400);
    }

    #[test]
    fn test_missing_source_without_cache_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SidecarStore::open(dir.path(), &DerivativeConfig::default()).unwrap());

        let err = resolve(&store, Tier::Thumbnail, "gone.jpg").unwrap_err();
        assert!(matches!(err.downcast_ref::<FolioError>(), Some(FolioError::NotFound(_))));
    }
}
